//! Lease-backed node registration
//!
//! A registration writes the node under `scheme/service-nodeId` with a lease
//! and keeps that lease alive from a background task:
//!
//! ```text
//!   registering --grant+put ok--> keeping alive --keep_alive ok--> keeping alive
//!        ^   \--fail: retry next tick       |
//!        |                                  |
//!        +-------- keep_alive failed -------+
//! ```
//!
//! Losing the lease (expiry, revocation, store restart) always shows up as a
//! failed keep-alive, so the node is re-registered with a fresh lease.

use std::sync::Arc;
use std::time::Duration;

use beacon_api::{
    Node, node_id_from_key, node_key, scan_prefix, validate_node_id, validate_node_info,
    validate_service_name,
};
use beacon_common::{DEFAULT_SCHEME, INFO_IP, interface_ip};
use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DiscoveryError, Result, StoreError};
use crate::store::{KeyValue, KvStore, LeaseId};

/// Default interval between lease refreshes
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Default lease time-to-live
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Key prefix (data center) every node key lives under
    pub scheme: String,
    pub renew_interval: Duration,
    pub lease_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            renew_interval: DEFAULT_RENEW_INTERVAL,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.renew_interval.is_zero() {
            return Err(DiscoveryError::Config(
                "renew_interval must be positive".to_string(),
            ));
        }
        if self.lease_ttl <= self.renew_interval {
            return Err(DiscoveryError::Config(format!(
                "lease_ttl ({:?}) must exceed renew_interval ({:?})",
                self.lease_ttl, self.renew_interval
            )));
        }
        Ok(())
    }
}

struct Registration {
    node: Node,
    key: String,
    lease: Arc<Mutex<Option<LeaseId>>>,
    task: JoinHandle<()>,
}

/// Registers one node and keeps it registered until `unregister` or drop.
pub struct ServiceRegistry {
    store: Arc<dyn KvStore>,
    config: RegistryConfig,
    registration: Mutex<Option<Registration>>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn KvStore>, config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            registration: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register `node` as a member of `service_name`.
    ///
    /// The first write is attempted before returning. A failed first write is
    /// logged and left to the background loop. Registering again replaces the
    /// previous registration.
    pub async fn register(&self, service_name: &str, mut node: Node) -> Result<()> {
        validate_service_name(service_name)
            .map_err(|e| DiscoveryError::invalid("service_name", e))?;
        validate_node_id(&node.id).map_err(|e| DiscoveryError::invalid("node_id", e))?;

        node.service = service_name.to_string();
        if !node.info.contains_key(INFO_IP) {
            node.info.insert(INFO_IP.to_string(), interface_ip());
        }
        validate_node_info(&node.info).map_err(|e| DiscoveryError::invalid("info", e))?;

        let key = node_key(&self.config.scheme, service_name, &node.id);
        let value = node.encode()?;

        let previous = self.registration.lock().take();
        if let Some(previous) = previous {
            previous.task.abort();
            if previous.key != key {
                let previous_lease = *previous.lease.lock();
                self.remove(&previous.key, previous_lease).await;
            }
        }

        let lease = Arc::new(Mutex::new(None));
        match put_with_new_lease(self.store.as_ref(), &key, &value, self.config.lease_ttl).await {
            Ok(lease_id) => {
                *lease.lock() = Some(lease_id);
                info!(key = %key, lease_id, "Registered node");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Initial registration failed, will retry");
            }
        }
        counter!("registry_registrations_total").increment(1);

        let task = tokio::spawn(keep_registered(
            self.store.clone(),
            key.clone(),
            value,
            self.config.clone(),
            lease.clone(),
        ));

        *self.registration.lock() = Some(Registration {
            node,
            key,
            lease,
            task,
        });
        Ok(())
    }

    /// Stop the lease loop, revoke the lease and delete the node key.
    /// Calling it without an active registration is a no-op.
    pub async fn unregister(&self) -> Result<()> {
        let Some(registration) = self.registration.lock().take() else {
            return Ok(());
        };
        registration.task.abort();
        let _ = registration.task.await;

        let lease = *registration.lease.lock();
        if let Some(lease_id) = lease {
            match self.store.revoke_lease(lease_id).await {
                Ok(()) | Err(StoreError::LeaseNotFound(_)) => {}
                Err(e) => warn!(lease_id, error = %e, "Failed to revoke lease"),
            }
        }
        self.store.delete(&registration.key).await?;
        info!(key = %registration.key, "Unregistered node");
        Ok(())
    }

    /// The node as written to the store, once registered.
    pub fn node(&self) -> Option<Node> {
        self.registration.lock().as_ref().map(|r| r.node.clone())
    }

    pub fn key(&self) -> Option<String> {
        self.registration.lock().as_ref().map(|r| r.key.clone())
    }

    /// The lease currently backing the registration, if one is held.
    pub fn lease_id(&self) -> Option<LeaseId> {
        self.registration
            .lock()
            .as_ref()
            .and_then(|r| *r.lease.lock())
    }

    pub fn is_registered(&self) -> bool {
        self.registration.lock().is_some()
    }

    /// All nodes currently registered under `service_name`, in key order.
    pub async fn list_nodes(&self, service_name: &str) -> Result<Vec<Node>> {
        list_nodes(self.store.as_ref(), &self.config.scheme, service_name).await
    }

    async fn remove(&self, key: &str, lease: Option<LeaseId>) {
        if let Some(lease_id) = lease {
            let _ = self.store.revoke_lease(lease_id).await;
        }
        if let Err(e) = self.store.delete(key).await {
            warn!(key = %key, error = %e, "Failed to remove previous registration");
        }
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.get_mut().take() {
            registration.task.abort();
        }
    }
}

/// Prefix scan of one service, decoded into nodes.
pub async fn list_nodes(
    store: &dyn KvStore,
    scheme: &str,
    service_name: &str,
) -> Result<Vec<Node>> {
    validate_service_name(service_name).map_err(|e| DiscoveryError::invalid("service_name", e))?;
    let prefix = scan_prefix(scheme, service_name);
    let kvs = store.get_prefix(&prefix).await?;
    Ok(kvs
        .iter()
        .filter_map(|kv| decode_entry(service_name, &prefix, kv))
        .collect())
}

/// Decode a stored entry, skipping values that are corrupt or that belong to
/// another service sharing the key prefix.
pub(crate) fn decode_entry(service_name: &str, prefix: &str, kv: &KeyValue) -> Option<Node> {
    let id = node_id_from_key(prefix, &kv.key)?;
    let node = match Node::decode(&kv.value) {
        Ok(node) => node,
        Err(e) => {
            warn!(key = %kv.key, error = %e, "Skipping undecodable node entry");
            return None;
        }
    };
    if node.service != service_name || node.id != id {
        debug!(key = %kv.key, service = %node.service, "Skipping entry of another service");
        return None;
    }
    if node.info.is_empty() {
        warn!(key = %kv.key, "Skipping node entry without info");
        return None;
    }
    Some(node)
}

async fn put_with_new_lease(
    store: &dyn KvStore,
    key: &str,
    value: &[u8],
    ttl: Duration,
) -> std::result::Result<LeaseId, StoreError> {
    let lease_id = store.grant_lease(ttl).await?;
    if let Err(e) = store.put(key, value.to_vec(), Some(lease_id)).await {
        let _ = store.revoke_lease(lease_id).await;
        return Err(e);
    }
    Ok(lease_id)
}

async fn keep_registered(
    store: Arc<dyn KvStore>,
    key: String,
    value: Vec<u8>,
    config: RegistryConfig,
    lease: Arc<Mutex<Option<LeaseId>>>,
) {
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + config.renew_interval,
        config.renew_interval,
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Lease given up after a failed keep-alive, revoked once a new one holds the key
    let mut stale: Option<LeaseId> = None;

    loop {
        ticker.tick().await;

        let current = *lease.lock();
        if let Some(lease_id) = current {
            match store.keep_alive(lease_id).await {
                Ok(ttl) => {
                    debug!(key = %key, lease_id, ?ttl, "Lease renewed");
                    counter!("registry_lease_renewals_total").increment(1);
                    continue;
                }
                Err(e) => {
                    warn!(key = %key, lease_id, error = %e, "Lease renewal failed, re-registering");
                    counter!("registry_lease_losses_total").increment(1);
                    *lease.lock() = None;
                    stale = Some(lease_id);
                }
            }
        }

        match put_with_new_lease(store.as_ref(), &key, &value, config.lease_ttl).await {
            Ok(lease_id) => {
                info!(key = %key, lease_id, "Node re-registered");
                *lease.lock() = Some(lease_id);
                if let Some(old) = stale.take() {
                    match store.revoke_lease(old).await {
                        Ok(()) | Err(StoreError::LeaseNotFound(_)) => {}
                        Err(e) => {
                            warn!(key = %key, lease_id = old, error = %e, "Failed to revoke stale lease")
                        }
                    }
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Registration failed, retrying in {:?}", config.renew_interval);
            }
        }
    }
}
