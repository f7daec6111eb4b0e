//! Peer event listener trait and event types

use beacon_api::Node;
use beacon_common::NodeState;

/// Event delivered to watch listeners when a peer comes up or goes away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEvent {
    pub service_name: String,
    pub state: NodeState,
    pub node: Node,
}

impl NodeEvent {
    pub fn up(service_name: impl Into<String>, node: Node) -> Self {
        Self {
            service_name: service_name.into(),
            state: NodeState::Up,
            node,
        }
    }

    pub fn down(service_name: impl Into<String>, node: Node) -> Self {
        Self {
            service_name: service_name.into(),
            state: NodeState::Down,
            node,
        }
    }
}

/// Trait for receiving peer UP/DOWN events.
///
/// Called on the watch task in arrival order, so implementations should hand
/// slow work off to their own tasks.
pub trait NodeEventListener: Send + Sync + 'static {
    fn on_event(&self, event: NodeEvent);
}

/// A simple listener that invokes a closure.
pub struct FnNodeListener<F>
where
    F: Fn(NodeEvent) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnNodeListener<F>
where
    F: Fn(NodeEvent) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> NodeEventListener for FnNodeListener<F>
where
    F: Fn(NodeEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: NodeEvent) {
        (self.f)(event);
    }
}

/// Forwards events into an unbounded channel, for consumers that prefer
/// `recv().await` over callbacks.
pub struct ChannelNodeListener {
    tx: tokio::sync::mpsc::UnboundedSender<NodeEvent>,
}

impl ChannelNodeListener {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NodeEventListener for ChannelNodeListener {
    fn on_event(&self, event: NodeEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Node event receiver dropped");
        }
    }
}
