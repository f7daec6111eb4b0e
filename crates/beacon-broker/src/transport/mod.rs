//! Publish/subscribe transport
//!
//! Delivery is at-most-once: a message published to a subject with no
//! subscribers is dropped. `MemoryBroker` implements the transport in-process;
//! `NatsTransport` (feature `nats`) connects to a NATS server.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

pub use crate::error::{TransportError, TransportResult};

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

pub use memory::{MemoryBroker, MemoryTransport};
#[cfg(feature = "nats")]
pub use nats::NatsTransport;

/// Capacity of the per-connection event channel
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A message received on a subscription.
#[derive(Clone, Debug)]
pub struct Message {
    pub subject: String,
    /// Subject the sender expects replies on
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// Messages in arrival order. Ends when the subscription or the connection
/// is closed.
pub type Subscription = BoxStream<'static, Message>;

/// Connection-level lifecycle events
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Closed { reason: String },
    Error { reason: String },
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> TransportResult<()>;

    async fn subscribe(&self, subject: &str) -> TransportResult<Subscription>;

    /// A fresh subject nobody else subscribes to, for replies.
    fn new_inbox(&self) -> String;

    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    async fn close(&self) -> TransportResult<()>;
}
