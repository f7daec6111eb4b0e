//! Service node facade
//!
//! Bundles the registry and watcher for a process that is both a member of
//! a service and a consumer of peers, plus the subject naming convention used
//! to reach a node over the messaging layer.

use std::collections::HashMap;
use std::sync::Arc;

use beacon_api::Node;

use crate::error::Result;
use crate::listener::NodeEventListener;
use crate::registry::{RegistryConfig, ServiceRegistry};
use crate::store::KvStore;
use crate::watcher::{ServiceWatcher, WatchHandle, WatcherConfig};

/// Subject a node serves requests on
pub fn rpc_channel(node: &Node) -> String {
    format!("rpc-{}", node.id)
}

/// Subject a node broadcasts its notifications on
pub fn event_channel(node: &Node) -> String {
    format!("event-{}", node.id)
}

pub struct ServiceNode {
    registry: ServiceRegistry,
    watcher: ServiceWatcher,
}

impl ServiceNode {
    pub fn new(
        store: Arc<dyn KvStore>,
        registry_config: RegistryConfig,
        watcher_config: WatcherConfig,
    ) -> Result<Self> {
        Ok(Self {
            registry: ServiceRegistry::new(store.clone(), registry_config)?,
            watcher: ServiceWatcher::new(store, watcher_config),
        })
    }

    /// Register this process as `node_id` of `service_name`.
    pub async fn register_node(&self, service_name: &str, node_id: &str) -> Result<Node> {
        self.register_node_with_info(service_name, node_id, HashMap::new())
            .await
    }

    pub async fn register_node_with_info(
        &self,
        service_name: &str,
        node_id: &str,
        info: HashMap<String, String>,
    ) -> Result<Node> {
        let mut node = Node::new(service_name, node_id);
        node.info = info;
        self.registry.register(service_name, node).await?;
        // register fills in the address, hand back what was written
        Ok(self
            .registry
            .node()
            .unwrap_or_else(|| Node::new(service_name, node_id)))
    }

    pub async fn unregister_node(&self) -> Result<()> {
        self.registry.unregister().await
    }

    /// The registered node, if any.
    pub fn node_info(&self) -> Option<Node> {
        self.registry.node()
    }

    pub fn rpc_channel(&self) -> Option<String> {
        self.node_info().as_ref().map(rpc_channel)
    }

    pub fn event_channel(&self) -> Option<String> {
        self.node_info().as_ref().map(event_channel)
    }

    pub async fn service_nodes(&self, service_name: &str) -> Result<Vec<Node>> {
        self.registry.list_nodes(service_name).await
    }

    pub fn watch(
        &self,
        service_name: &str,
        listener: Arc<dyn NodeEventListener>,
    ) -> Result<WatchHandle> {
        self.watcher.watch(service_name, listener)
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn watcher(&self) -> &ServiceWatcher {
        &self.watcher
    }
}
