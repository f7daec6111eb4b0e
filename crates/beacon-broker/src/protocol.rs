//! Request/response and broadcast messaging over a shared transport
//!
//! Server side, every bound subject gets one listener task. Requests are
//! handed to their handler on a task of their own so a slow handler never
//! holds up the subject; notifications run inline so one subject's
//! notifications are handled in arrival order.
//!
//! Client side, each protocol instance owns a single inbox subscription.
//! Requests carry the inbox as their reply subject and a correlation id from
//! a per-instance counter; responses are matched against the pending table and
//! anything unmatched is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use beacon_api::{Envelope, RawMessage, Rejection, Request, validate_method};
use beacon_common::error::{BAD_REQUEST, CONNECTION_CLOSED, TRANSPORT_ERROR};
use dashmap::DashMap;
use futures::StreamExt;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{OnceCell, broadcast};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::broadcaster::Broadcaster;
use crate::error::{BrokerError, Result};
use crate::events::{EventObservers, ListenerId, ProtocolEvent, ProtocolListener};
use crate::handler::{NotificationHandler, RequestHandler, Responder};
use crate::pending::{PendingCalls, PendingGuard};
use crate::requestor::Requestor;
use crate::transport::{Message, Subscription, Transport, TransportEvent};

/// Default deadline of a request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ProtocolConfig {
    pub request_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Request and broadcast handlers are bound independently, so one subject
/// can carry one of each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    Request,
    Broadcast,
}

impl BindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingKind::Request => "request",
            BindingKind::Broadcast => "broadcast",
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ProtocolConfig,
    pending: Arc<PendingCalls>,
    request_bindings: DashMap<String, AbortHandle>,
    broadcast_bindings: DashMap<String, AbortHandle>,
    inbox: OnceCell<String>,
    inbox_task: Mutex<Option<AbortHandle>>,
    event_task: Mutex<Option<AbortHandle>>,
    observers: Arc<EventObservers>,
    closed: Arc<AtomicBool>,
}

impl Inner {
    fn bindings(&self, kind: BindingKind) -> &DashMap<String, AbortHandle> {
        match kind {
            BindingKind::Request => &self.request_bindings,
            BindingKind::Broadcast => &self.broadcast_bindings,
        }
    }

    fn abort_tasks(&self) {
        for bindings in [&self.request_bindings, &self.broadcast_bindings] {
            bindings.retain(|_, task| {
                task.abort();
                false
            });
        }
        if let Some(task) = self.inbox_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Messaging endpoint over one transport connection. Cheap to clone; clones
/// share bindings, pending calls and listeners.
#[derive(Clone)]
pub struct MessagingProtocol {
    inner: Arc<Inner>,
}

impl MessagingProtocol {
    /// Wrap a transport connection. Must be called inside a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: ProtocolConfig) -> Self {
        let pending = Arc::new(PendingCalls::new());
        let observers = Arc::new(EventObservers::new());
        let closed = Arc::new(AtomicBool::new(false));

        let event_task = tokio::spawn(forward_transport_events(
            transport.events(),
            pending.clone(),
            observers.clone(),
            closed.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                pending,
                request_bindings: DashMap::new(),
                broadcast_bindings: DashMap::new(),
                inbox: OnceCell::new(),
                inbox_task: Mutex::new(None),
                event_task: Mutex::new(Some(event_task.abort_handle())),
                observers,
                closed,
            }),
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of requests waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Serve requests arriving on `subject`. Replaces any previous request
    /// handler of the subject. The subscription is live when this returns.
    pub async fn on_request(&self, subject: &str, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let subscription = self.subscribe(subject).await?;
        let task = tokio::spawn(serve_requests(
            subject.to_string(),
            subscription,
            handler,
            self.inner.transport.clone(),
        ));
        self.bind(BindingKind::Request, subject, task);
        Ok(())
    }

    /// Handle notifications arriving on `subject`, one at a time in arrival
    /// order. Replaces any previous notification handler of the subject.
    pub async fn on_broadcast(
        &self,
        subject: &str,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<()> {
        let subscription = self.subscribe(subject).await?;
        let task = tokio::spawn(serve_notifications(
            subject.to_string(),
            subscription,
            handler,
        ));
        self.bind(BindingKind::Broadcast, subject, task);
        Ok(())
    }

    /// Remove both bindings of `subject`. Returns false when nothing was bound.
    pub fn off(&self, subject: &str) -> bool {
        let request = self.unbind(BindingKind::Request, subject);
        let broadcast = self.unbind(BindingKind::Broadcast, subject);
        request || broadcast
    }

    pub fn off_request(&self, subject: &str) -> bool {
        self.unbind(BindingKind::Request, subject)
    }

    pub fn off_broadcast(&self, subject: &str) -> bool {
        self.unbind(BindingKind::Broadcast, subject)
    }

    pub fn is_bound(&self, kind: BindingKind, subject: &str) -> bool {
        self.inner.bindings(kind).contains_key(subject)
    }

    fn unbind(&self, kind: BindingKind, subject: &str) -> bool {
        match self.inner.bindings(kind).remove(subject) {
            Some((_, task)) => {
                task.abort();
                info!(subject = %subject, kind = kind.as_str(), "Unbound subject");
                true
            }
            None => false,
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        if subject.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "subject must not be empty".to_string(),
            ));
        }
        Ok(self.inner.transport.subscribe(subject).await?)
    }

    fn bind(&self, kind: BindingKind, subject: &str, task: JoinHandle<()>) {
        if let Some(previous) = self
            .inner
            .bindings(kind)
            .insert(subject.to_string(), task.abort_handle())
        {
            previous.abort();
            info!(subject = %subject, kind = kind.as_str(), "Rebound subject");
        } else {
            info!(subject = %subject, kind = kind.as_str(), "Bound subject");
        }
    }

    /// Send a request and wait for its outcome, using the configured deadline.
    pub async fn request(
        &self,
        subject: &str,
        method: &str,
        data: RawMessage,
    ) -> std::result::Result<RawMessage, Rejection> {
        self.request_with_timeout(subject, method, data, self.inner.config.request_timeout)
            .await
    }

    /// Send a request and wait at most `timeout` for its outcome. Dropping the
    /// returned future cancels the call.
    pub async fn request_with_timeout(
        &self,
        subject: &str,
        method: &str,
        data: RawMessage,
        timeout: Duration,
    ) -> std::result::Result<RawMessage, Rejection> {
        if self.is_closed() {
            return Err(Rejection::connection_closed());
        }
        if let Err(e) = validate_method(method) {
            return Err(Rejection::new(
                BAD_REQUEST.code,
                format!("invalid method: {}", e.code),
            ));
        }

        let inbox = self
            .ensure_inbox()
            .await
            .map_err(Rejection::publish_failed)?
            .to_string();

        let (id, rx) = self.inner.pending.register(subject, method);
        let _guard = PendingGuard::new(self.inner.pending.clone(), id);
        if self.is_closed() {
            return Err(Rejection::connection_closed());
        }

        let payload = Envelope::request(id, method, data)
            .encode()
            .map_err(|e| Rejection::new(BAD_REQUEST.code, e.to_string()))?;
        counter!("protocol_requests_total").increment(1);

        if let Err(e) = self
            .inner
            .transport
            .publish(subject, Some(&inbox), payload)
            .await
        {
            warn!(id, subject = %subject, method = %method, error = %e, "Failed to publish request");
            counter!("protocol_request_failures_total", "reason" => "publish").increment(1);
            return Err(Rejection::publish_failed(e));
        }
        trace!(id, subject = %subject, method = %method, "Request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                if result.is_err() {
                    counter!("protocol_request_failures_total", "reason" => "rejected")
                        .increment(1);
                }
                result
            }
            Ok(Err(_)) => Err(Rejection::connection_closed()),
            Err(_) => {
                debug!(id, subject = %subject, method = %method, ?timeout, "Request timed out");
                counter!("protocol_request_failures_total", "reason" => "timeout").increment(1);
                Err(Rejection::timeout())
            }
        }
    }

    /// Callback form of `request`. Exactly one of the callbacks runs, on a
    /// spawned task.
    pub fn request_with<A, R>(
        &self,
        subject: &str,
        method: &str,
        data: RawMessage,
        on_accept: A,
        on_reject: R,
    ) -> JoinHandle<()>
    where
        A: FnOnce(RawMessage) + Send + 'static,
        R: FnOnce(i32, String) + Send + 'static,
    {
        let protocol = self.clone();
        let subject = subject.to_string();
        let method = method.to_string();
        tokio::spawn(async move {
            match protocol.request(&subject, &method, data).await {
                Ok(result) => on_accept(result),
                Err(rejection) => on_reject(rejection.code, rejection.reason),
            }
        })
    }

    /// Publish one envelope. Failures are logged and returned, never retried.
    pub async fn send(
        &self,
        envelope: &Envelope,
        subject: &str,
        reply: Option<&str>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let payload = envelope.encode()?;
        if let Err(e) = self.inner.transport.publish(subject, reply, payload).await {
            warn!(subject = %subject, kind = envelope.kind(), error = %e, "Failed to send envelope");
            return Err(e.into());
        }
        Ok(())
    }

    async fn ensure_inbox(&self) -> Result<&str> {
        let inbox = self
            .inner
            .inbox
            .get_or_try_init(|| async {
                let inbox = self.inner.transport.new_inbox();
                let subscription = self.inner.transport.subscribe(&inbox).await?;
                let task = tokio::spawn(dispatch_responses(
                    subscription,
                    self.inner.pending.clone(),
                ));
                *self.inner.inbox_task.lock() = Some(task.abort_handle());
                debug!(inbox = %inbox, "Inbox subscribed");
                Ok::<_, BrokerError>(inbox)
            })
            .await?;
        Ok(inbox.as_str())
    }

    /// Register a lifecycle listener.
    pub fn on(&self, listener: Arc<dyn ProtocolListener>) -> ListenerId {
        self.inner.observers.subscribe(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.observers.unsubscribe(id)
    }

    /// Fail outstanding requests, stop every subscription, notify listeners
    /// and close the transport. Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let failed = self.inner.pending.fail_all(&Rejection::connection_closed());
        self.inner.abort_tasks();
        info!(failed_requests = failed, "Messaging protocol closed");

        self.inner.observers.emit(&ProtocolEvent::Close {
            code: CONNECTION_CLOSED.code,
            reason: "closed by local peer".to_string(),
        });

        self.inner.transport.close().await?;
        Ok(())
    }

    pub fn requestor(&self, subject: &str) -> Requestor {
        Requestor::new(self.clone(), subject)
    }

    pub fn broadcaster(&self, subject: &str) -> Broadcaster {
        Broadcaster::new(self.clone(), subject)
    }
}

async fn serve_requests(
    subject: String,
    mut subscription: Subscription,
    handler: Arc<dyn RequestHandler>,
    transport: Arc<dyn Transport>,
) {
    while let Some(message) = subscription.next().await {
        let Some(envelope) = decode(&subject, &message) else {
            continue;
        };
        match envelope {
            Envelope::Request(request) => {
                counter!("protocol_requests_received_total").increment(1);
                let responder = Responder::new(
                    request.id,
                    request.method.clone(),
                    message.reply,
                    transport.clone(),
                );
                let handler = handler.clone();
                tokio::spawn(async move {
                    handle_request(handler, request, responder).await;
                });
            }
            other => {
                debug!(subject = %subject, kind = other.kind(), "Ignoring non-request envelope");
            }
        }
    }
    debug!(subject = %subject, "Request subscription ended");
}

async fn handle_request(handler: Arc<dyn RequestHandler>, request: Request, responder: Responder) {
    trace!(id = request.id, method = %request.method, "Dispatching request");
    handler.handle(request, responder).await;
}

async fn serve_notifications(
    subject: String,
    mut subscription: Subscription,
    handler: Arc<dyn NotificationHandler>,
) {
    while let Some(message) = subscription.next().await {
        match decode(&subject, &message) {
            Some(Envelope::Notification(notification)) => {
                counter!("protocol_notifications_received_total").increment(1);
                handler.handle(&subject, notification).await;
            }
            Some(other) => {
                debug!(subject = %subject, kind = other.kind(), "Ignoring non-notification envelope");
            }
            None => {}
        }
    }
    debug!(subject = %subject, "Broadcast subscription ended");
}

async fn dispatch_responses(mut subscription: Subscription, pending: Arc<PendingCalls>) {
    while let Some(message) = subscription.next().await {
        match decode(&message.subject, &message) {
            Some(Envelope::Response(response)) => {
                if !pending.resolve(response.id, response.result) {
                    debug!(id = response.id, "Discarding late or unknown response");
                    counter!("protocol_responses_discarded_total").increment(1);
                }
            }
            Some(other) => {
                debug!(kind = other.kind(), "Ignoring non-response envelope on inbox");
            }
            None => {}
        }
    }
}

fn decode(subject: &str, message: &Message) -> Option<Envelope> {
    match Envelope::decode(&message.payload) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!(subject = %subject, error = %e, "Dropping undecodable message");
            None
        }
    }
}

async fn forward_transport_events(
    mut events: broadcast::Receiver<TransportEvent>,
    pending: Arc<PendingCalls>,
    observers: Arc<EventObservers>,
    closed: Arc<AtomicBool>,
) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Closed { reason }) => {
                // A local close has already notified listeners
                if closed.swap(true, Ordering::SeqCst) {
                    continue;
                }
                warn!(reason = %reason, "Transport connection closed");
                pending.fail_all(&Rejection::connection_closed());
                observers.emit(&ProtocolEvent::Close {
                    code: CONNECTION_CLOSED.code,
                    reason,
                });
            }
            Ok(TransportEvent::Error { reason }) => {
                warn!(reason = %reason, "Transport error");
                observers.emit(&ProtocolEvent::Error {
                    code: TRANSPORT_ERROR.code,
                    reason,
                });
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Transport events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
