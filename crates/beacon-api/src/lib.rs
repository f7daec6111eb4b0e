//! Beacon API - wire models shared by discovery and messaging
//!
//! This crate provides:
//! - The `Node` model and its store key layout
//! - Protocol envelopes (request, response, notification) and their JSON codec
//! - Input validation utilities

pub mod envelope;
pub mod model;
pub mod validation;

// Re-export commonly used types
pub use envelope::{
    CorrelationId, Envelope, EnvelopeError, Notification, RawMessage, Rejection, Request, Response,
};
pub use model::*;
pub use validation::*;
