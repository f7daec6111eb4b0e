//! In-process transport
//!
//! `MemoryBroker` plays the server: it routes published messages to every
//! subscription on the exact subject. Each `MemoryTransport` is one client
//! connection to it, with its own lifecycle and event channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;

use super::{
    EVENT_CHANNEL_CAPACITY, Message, Subscription, Transport, TransportError, TransportEvent,
    TransportResult,
};

struct Subscriber {
    connection: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct BrokerInner {
    subjects: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_connection: AtomicU64,
    fail_publishes: AtomicBool,
}

impl BrokerInner {
    fn route(&self, message: Message) -> usize {
        let mut subjects = self.subjects.lock();
        let Some(subscribers) = subjects.get_mut(&message.subject) else {
            trace!(subject = %message.subject, "No subscribers, message dropped");
            return 0;
        };
        subscribers.retain(|s| s.tx.send(message.clone()).is_ok());
        let delivered = subscribers.len();
        if subscribers.is_empty() {
            subjects.remove(&message.subject);
        }
        delivered
    }

    fn drop_connection(&self, connection: u64) {
        let mut subjects = self.subjects.lock();
        subjects.retain(|_, subscribers| {
            subscribers.retain(|s| s.connection != connection);
            !subscribers.is_empty()
        });
    }
}

/// In-process message router shared by any number of connections.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client connection.
    pub fn connect(&self) -> MemoryTransport {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        MemoryTransport {
            broker: self.inner.clone(),
            id,
            closed: AtomicBool::new(false),
            events,
        }
    }

    /// Make every publish fail until switched back.
    pub fn set_publish_failure(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Number of live subscriptions on `subject`.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner
            .subjects
            .lock()
            .get(subject)
            .map(|subscribers| subscribers.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// One client connection to a `MemoryBroker`.
pub struct MemoryTransport {
    broker: Arc<BrokerInner>,
    id: u64,
    closed: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl MemoryTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Report a connection error to event listeners without closing.
    pub fn inject_error(&self, reason: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Error {
            reason: reason.into(),
        });
    }

    /// Simulate the server dropping this connection.
    pub fn disconnect(&self, reason: impl Into<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker.drop_connection(self.id);
        let _ = self.events.send(TransportEvent::Closed {
            reason: reason.into(),
        });
    }

    fn check_open(&self) -> TransportResult<()> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> TransportResult<()> {
        self.check_open()?;
        if self.broker.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::Publish(format!(
                "broker rejected publish to {}",
                subject
            )));
        }
        self.broker.route(Message {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> TransportResult<Subscription> {
        self.check_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker
            .subjects
            .lock()
            .entry(subject.to_string())
            .or_default()
            .push(Subscriber {
                connection: self.id,
                tx,
            });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", uuid::Uuid::new_v4().simple())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> TransportResult<()> {
        self.disconnect("connection closed by client");
        Ok(())
    }
}
