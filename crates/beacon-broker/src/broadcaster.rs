//! Broadcaster
//!
//! Fire-and-forget notifications to one subject. `say` only queues; a
//! publish task drains the queue in order, so consecutive notifications go
//! out in call order and a slow transport never blocks the caller.

use std::sync::Arc;

use beacon_api::{Envelope, Notification};
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{EventObservers, FnProtocolListener, ListenerId, ProtocolEvent, ProtocolListener};
use crate::protocol::MessagingProtocol;

pub struct Broadcaster {
    subject: String,
    queue: mpsc::UnboundedSender<Notification>,
    observers: Arc<EventObservers>,
    protocol: MessagingProtocol,
    forward_id: ListenerId,
}

impl Broadcaster {
    pub(crate) fn new(protocol: MessagingProtocol, subject: &str) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(publish_loop(protocol.clone(), subject.to_string(), rx));

        let observers = Arc::new(EventObservers::new());
        let forward = observers.clone();
        let log_subject = subject.to_string();
        let forward_id = protocol.on(Arc::new(FnProtocolListener::new(move |event| {
            match event {
                ProtocolEvent::Close { .. } => {
                    info!(subject = %log_subject, event = %event, "Broadcaster connection closed")
                }
                ProtocolEvent::Error { .. } => {
                    warn!(subject = %log_subject, event = %event, "Broadcaster connection error")
                }
            }
            forward.emit(event);
        })));

        Self {
            subject: subject.to_string(),
            queue,
            observers,
            protocol,
            forward_id,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Queue a notification. Never blocks; serialization and publish
    /// failures are logged.
    pub fn say<T: Serialize + ?Sized>(&self, method: &str, data: &T) {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!(subject = %self.subject, method = %method, error = %e, "Failed to serialize notification");
                return;
            }
        };
        let notification = Notification {
            method: method.to_string(),
            data,
        };
        if self.queue.send(notification).is_err() {
            warn!(subject = %self.subject, method = %method, "Broadcast queue closed, notification dropped");
        }
    }

    /// Register a listener for the underlying protocol's close/error events.
    pub fn on(&self, listener: Arc<dyn ProtocolListener>) -> ListenerId {
        self.observers.subscribe(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.observers.unsubscribe(id)
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.protocol.remove_listener(self.forward_id);
    }
}

async fn publish_loop(
    protocol: MessagingProtocol,
    subject: String,
    mut rx: mpsc::UnboundedReceiver<Notification>,
) {
    while let Some(notification) = rx.recv().await {
        let method = notification.method.clone();
        match protocol
            .send(&Envelope::Notification(notification), &subject, None)
            .await
        {
            Ok(()) => {
                counter!("protocol_notifications_sent_total").increment(1);
                debug!(subject = %subject, method = %method, "Notification published");
            }
            Err(e) => {
                warn!(subject = %subject, method = %method, error = %e, "Failed to publish notification");
            }
        }
    }
}
