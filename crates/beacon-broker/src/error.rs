//! Broker error types

use beacon_api::EnvelopeError;

pub use beacon_api::Rejection;

/// Errors reported by a `Transport`
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport connection closed")]
    Closed,

    #[error("transport connect failed: {0}")]
    Connect(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("method already routed: {0}")]
    DuplicateMethod(String),

    #[error("messaging protocol closed")]
    Closed,
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

pub type Result<T> = std::result::Result<T, BrokerError>;
