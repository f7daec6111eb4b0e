//! Beacon Broker - request/reply and broadcast messaging
//!
//! This crate provides:
//! - `Transport`: publish/subscribe connection, with an in-process backend and
//!   a NATS backend (feature `nats`)
//! - `MessagingProtocol`: subject bindings, correlated requests with deadlines,
//!   notifications and lifecycle events
//! - `Requestor` and `Broadcaster`: clients bound to one subject

pub mod broadcaster;
pub mod error;
pub mod events;
pub mod handler;
mod pending;
pub mod protocol;
pub mod requestor;
pub mod transport;

pub use broadcaster::Broadcaster;
pub use error::{BrokerError, Rejection, Result, TransportError, TransportResult};
pub use events::{EventObservers, FnProtocolListener, ListenerId, ProtocolEvent, ProtocolListener};
pub use handler::{
    FnNotificationHandler, FnRequestHandler, MethodRouter, NotificationHandler, RequestHandler,
    Responder,
};
pub use protocol::{BindingKind, DEFAULT_REQUEST_TIMEOUT, MessagingProtocol, ProtocolConfig};
pub use requestor::Requestor;
#[cfg(feature = "nats")]
pub use transport::NatsTransport;
pub use transport::{MemoryBroker, MemoryTransport, Message, Subscription, Transport, TransportEvent};
