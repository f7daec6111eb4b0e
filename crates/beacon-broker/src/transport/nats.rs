//! NATS-backed transport

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    EVENT_CHANNEL_CAPACITY, Message, Subscription, Transport, TransportError, TransportEvent,
    TransportResult,
};

pub struct NatsTransport {
    client: Client,
    closed: Arc<AtomicBool>,
    events: broadcast::Sender<TransportEvent>,
}

/// Map a client connection event onto the transport's lifecycle events.
fn transport_event(event: &Event) -> Option<TransportEvent> {
    match event {
        Event::Closed => {
            info!("NATS connection closed");
            Some(TransportEvent::Closed {
                reason: "connection closed".to_string(),
            })
        }
        Event::Disconnected => {
            warn!("NATS connection lost");
            Some(TransportEvent::Error {
                reason: "disconnected".to_string(),
            })
        }
        Event::ServerError(e) => {
            warn!(error = %e, "NATS server error");
            Some(TransportEvent::Error {
                reason: e.to_string(),
            })
        }
        Event::ClientError(e) => {
            warn!(error = %e, "NATS client error");
            Some(TransportEvent::Error {
                reason: e.to_string(),
            })
        }
        other => {
            debug!(event = ?other, "NATS connection event");
            None
        }
    }
}

impl NatsTransport {
    pub async fn connect(url: &str) -> TransportResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));
        let callback_events = events.clone();
        let callback_closed = closed.clone();

        let client = ConnectOptions::new()
            .event_callback(move |event| {
                let events = callback_events.clone();
                let closed = callback_closed.clone();
                async move {
                    match transport_event(&event) {
                        // a local close has already announced itself
                        Some(TransportEvent::Closed { .. })
                            if closed.swap(true, Ordering::SeqCst) => {}
                        Some(mapped) => {
                            let _ = events.send(mapped);
                        }
                        None => {}
                    }
                }
            })
            .connect(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        info!(url = %url, "Connected to NATS");
        Ok(Self {
            client,
            closed,
            events,
        })
    }

    fn check_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> TransportResult<()> {
        self.check_open()?;
        let result = match reply {
            Some(reply) => {
                self.client
                    .publish_with_reply(subject.to_string(), reply.to_string(), payload)
                    .await
            }
            None => self.client.publish(subject.to_string(), payload).await,
        };
        result.map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> TransportResult<Subscription> {
        self.check_open()?;
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        Ok(subscriber
            .map(|msg| Message {
                subject: msg.subject.to_string(),
                reply: msg.reply.map(|r| r.to_string()),
                payload: msg.payload,
            })
            .boxed())
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // drain flushes pending publishes, then closes the connection
        if let Err(e) = self.client.drain().await {
            warn!(error = %e, "Failed to drain NATS connection on close");
        }
        let _ = self.events.send(TransportEvent::Closed {
            reason: "connection closed by client".to_string(),
        });
        Ok(())
    }
}
