//! Server-side handlers
//!
//! A `RequestHandler` receives each request together with a `Responder`.
//! `accept` and `reject` consume the responder, so a request can be answered
//! at most once. A responder dropped without an answer leaves the caller to
//! time out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use beacon_api::{
    CorrelationId, Envelope, Notification, RawMessage, Rejection, Request, Response,
    validate_method,
};
use metrics::counter;
use tracing::{debug, warn};

use crate::error::{BrokerError, Result};
use crate::transport::Transport;

/// One-shot reply channel for a request.
pub struct Responder {
    id: CorrelationId,
    method: String,
    reply: Option<String>,
    transport: Arc<dyn Transport>,
    replied: bool,
}

impl Responder {
    pub(crate) fn new(
        id: CorrelationId,
        method: String,
        reply: Option<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            id,
            method,
            reply,
            transport,
            replied: false,
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub async fn accept(mut self, data: RawMessage) -> Result<()> {
        self.respond(Response::accept(self.id, data)).await
    }

    pub async fn reject(self, code: i32, reason: impl Into<String>) -> Result<()> {
        self.reject_with(Rejection::new(code, reason)).await
    }

    pub async fn reject_with(mut self, rejection: Rejection) -> Result<()> {
        counter!("protocol_rejections_sent_total").increment(1);
        self.respond(Response::reject(self.id, rejection)).await
    }

    async fn respond(&mut self, response: Response) -> Result<()> {
        self.replied = true;
        let Some(reply) = self.reply.take() else {
            warn!(id = self.id, method = %self.method, "Request carried no reply subject, response dropped");
            return Ok(());
        };
        let payload = Envelope::Response(response).encode()?;
        if let Err(e) = self.transport.publish(&reply, None, payload).await {
            warn!(id = self.id, reply = %reply, error = %e, "Failed to publish response");
            return Err(e.into());
        }
        debug!(id = self.id, method = %self.method, "Response sent");
        Ok(())
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.replied {
            warn!(id = self.id, method = %self.method, "Request dropped without a reply");
        }
    }
}

#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request, responder: Responder);
}

#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    async fn handle(&self, subject: &str, notification: Notification);
}

/// Request handler backed by an async closure.
pub struct FnRequestHandler<F> {
    f: F,
}

impl<F, Fut> FnRequestHandler<F>
where
    F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, request: Request, responder: Responder) {
        (self.f)(request, responder).await;
    }
}

/// Notification handler backed by a closure. Runs inline on the subject's
/// listener task.
pub struct FnNotificationHandler<F> {
    f: F,
}

impl<F> FnNotificationHandler<F>
where
    F: Fn(&str, Notification) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> NotificationHandler for FnNotificationHandler<F>
where
    F: Fn(&str, Notification) + Send + Sync + 'static,
{
    async fn handle(&self, subject: &str, notification: Notification) {
        (self.f)(subject, notification);
    }
}

/// Dispatches requests to per-method handlers. Unknown methods are rejected
/// with `METHOD_NOT_FOUND`.
#[derive(Default)]
pub struct MethodRouter {
    routes: HashMap<String, Arc<dyn RequestHandler>>,
}

impl MethodRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, method: &str, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        validate_method(method)
            .map_err(|e| BrokerError::InvalidArgument(format!("method: {}", e.code)))?;
        if self.routes.contains_key(method) {
            return Err(BrokerError::DuplicateMethod(method.to_string()));
        }
        self.routes.insert(method.to_string(), handler);
        Ok(self)
    }

    pub fn route_fn<F, Fut>(self, method: &str, f: F) -> Result<Self>
    where
        F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.route(method, Arc::new(FnRequestHandler::new(f)))
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }
}

#[async_trait]
impl RequestHandler for MethodRouter {
    async fn handle(&self, request: Request, responder: Responder) {
        match self.routes.get(&request.method) {
            Some(handler) => handler.handle(request, responder).await,
            None => {
                debug!(method = %request.method, "No route for method");
                let rejection = Rejection::method_not_found(&request.method);
                if let Err(e) = responder.reject_with(rejection).await {
                    warn!(error = %e, "Failed to reject unrouted request");
                }
            }
        }
    }
}
