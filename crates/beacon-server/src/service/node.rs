//! Node runtime
//!
//! Startup order is serve, register, announce, watch: by the time peers
//! see this node UP its RPC channel already answers.

use std::sync::Arc;

use beacon_api::{Envelope, Node, Notification, Request};
use beacon_broker::{
    Broadcaster, FnNotificationHandler, MessagingProtocol, MethodRouter, Responder, Transport,
};
use beacon_common::NodeState;
use beacon_common::error::NODE_INFO_ERROR;
use beacon_discovery::{
    ChannelNodeListener, KvStore, NodeEvent, NodeEventListener, ServiceNode, WatchHandle,
    event_channel, rpc_channel,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::{Timer, record_peer_ping, set_peers_up};
use crate::model::Configuration;

pub const METHOD_PING: &str = "ping";
pub const METHOD_INFO: &str = "info";

pub const NOTIFY_NODE_UP: &str = "node.up";
pub const NOTIFY_NODE_DOWN: &str = "node.down";

type PeerSet = Arc<DashMap<String, Node>>;

fn peer_key(node: &Node) -> String {
    format!("{}/{}", node.service, node.id)
}

fn generate_node_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A running node: registered, serving, announcing and following its peers.
pub struct BeaconNode {
    node: Node,
    service_node: Arc<ServiceNode>,
    protocol: MessagingProtocol,
    broadcaster: Broadcaster,
    peers: PeerSet,
    watches: Vec<WatchHandle>,
    peer_task: JoinHandle<()>,
}

impl BeaconNode {
    pub async fn start(
        configuration: &Configuration,
        store: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        let service = configuration.service_name();
        let node_id = configuration.node_id().unwrap_or_else(generate_node_id);
        let identity = Node::new(service.as_str(), node_id.as_str());

        let service_node = Arc::new(ServiceNode::new(
            store,
            configuration.registry_config(),
            configuration.watcher_config(),
        )?);
        let protocol = MessagingProtocol::new(transport, configuration.protocol_config());

        let router = rpc_router(&node_id, service_node.clone(), Utc::now())?;
        protocol
            .on_request(&rpc_channel(&identity), Arc::new(router))
            .await?;

        let node = service_node
            .register_node_with_info(&service, &node_id, configuration.node_info())
            .await?;

        let broadcaster = protocol.broadcaster(&event_channel(&node));
        broadcaster.say(NOTIFY_NODE_UP, &node);

        let peers: PeerSet = Arc::new(DashMap::new());
        let (listener, events) = ChannelNodeListener::new();
        let listener: Arc<dyn NodeEventListener> = Arc::new(listener);
        let peer_task = tokio::spawn(follow_peers(
            events,
            protocol.clone(),
            node.clone(),
            peers.clone(),
        ));

        let mut watches = Vec::new();
        for watched in configuration.watch_services() {
            watches.push(service_node.watch(&watched, listener.clone())?);
        }

        info!(
            node = %node,
            rpc = %rpc_channel(&node),
            events = %event_channel(&node),
            watching = watches.len(),
            "Beacon node started"
        );

        Ok(Self {
            node,
            service_node,
            protocol,
            broadcaster,
            peers,
            watches,
            peer_task,
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn protocol(&self) -> &MessagingProtocol {
        &self.protocol
    }

    pub fn service_node(&self) -> &ServiceNode {
        &self.service_node
    }

    /// Broadcaster on this node's event channel
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Peers currently UP, sorted by service then id.
    pub fn peers(&self) -> Vec<Node> {
        let mut peers: Vec<Node> = self.peers.iter().map(|e| e.value().clone()).collect();
        peers.sort_by(|a, b| (&a.service, &a.id).cmp(&(&b.service, &b.id)));
        peers
    }

    /// Announce `node.down`, unregister and close the messaging layer.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        for watch in self.watches {
            watch.stop();
        }
        self.peer_task.abort();

        let goodbye = Envelope::notification(NOTIFY_NODE_DOWN, serde_json::to_value(&self.node)?);
        if let Err(e) = self
            .protocol
            .send(&goodbye, &event_channel(&self.node), None)
            .await
        {
            warn!(node = %self.node, error = %e, "Failed to announce shutdown");
        }

        self.service_node.unregister_node().await?;
        self.protocol.close().await?;
        info!(node = %self.node, "Beacon node stopped");
        Ok(())
    }
}

fn rpc_router(
    node_id: &str,
    service_node: Arc<ServiceNode>,
    started_at: DateTime<Utc>,
) -> beacon_broker::Result<MethodRouter> {
    let node_id = node_id.to_string();
    MethodRouter::new()
        .route_fn(METHOD_PING, move |_request: Request, responder: Responder| {
            let now = Utc::now();
            let pong = json!({
                "id": node_id,
                "time": now.to_rfc3339(),
                "uptimeSecs": (now - started_at).num_seconds(),
            });
            async move {
                if let Err(e) = responder.accept(pong).await {
                    warn!(error = %e, "Failed to answer ping");
                }
            }
        })?
        .route_fn(METHOD_INFO, move |_request: Request, responder: Responder| {
            let node = service_node.node_info();
            async move {
                let result = match node.map(|node| serde_json::to_value(&node)) {
                    Some(Ok(info)) => responder.accept(info).await,
                    Some(Err(e)) => responder.reject(NODE_INFO_ERROR.code, e.to_string()).await,
                    None => {
                        responder
                            .reject(NODE_INFO_ERROR.code, "node is not registered")
                            .await
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "Failed to answer info");
                }
            }
        })
}

/// Apply peer events one at a time: follow each UP peer's event channel and
/// ping it, drop it again on DOWN.
async fn follow_peers(
    mut events: mpsc::UnboundedReceiver<NodeEvent>,
    protocol: MessagingProtocol,
    me: Node,
    peers: PeerSet,
) {
    while let Some(NodeEvent { state, node: peer, .. }) = events.recv().await {
        if peer.service == me.service && peer.id == me.id {
            continue;
        }
        let channel = event_channel(&peer);
        match state {
            NodeState::Up => {
                info!(peer = %peer, "Peer is UP");
                let handler = FnNotificationHandler::new(
                    |subject: &str, notification: Notification| {
                        info!(
                            subject = %subject,
                            method = %notification.method,
                            data = %notification.data,
                            "Peer notification"
                        );
                    },
                );
                if let Err(e) = protocol.on_broadcast(&channel, Arc::new(handler)).await {
                    warn!(peer = %peer, error = %e, "Failed to follow peer events");
                }
                ping_peer(&protocol, &peer, &me.id);
                peers.insert(peer_key(&peer), peer);
            }
            NodeState::Down => {
                info!(peer = %peer, "Peer is DOWN");
                peers.remove(&peer_key(&peer));
                if !protocol.off_broadcast(&channel) {
                    debug!(peer = %peer, "Peer events were not followed");
                }
            }
        }
        set_peers_up(peers.len());
    }
}

fn ping_peer(protocol: &MessagingProtocol, peer: &Node, from: &str) -> JoinHandle<()> {
    let timer = Timer::new();
    let accepted_peer = peer.to_string();
    let rejected_peer = accepted_peer.clone();
    protocol.requestor(&rpc_channel(peer)).request_with(
        METHOD_PING,
        json!({ "from": from }),
        move |reply| {
            let elapsed = timer.elapsed_secs();
            record_peer_ping(true, elapsed);
            info!(peer = %accepted_peer, reply = %reply, elapsed_secs = elapsed, "Peer answered ping");
        },
        move |code, reason| {
            record_peer_ping(false, 0.0);
            warn!(peer = %rejected_peer, code, reason = %reason, "Peer ping failed");
        },
    )
}
