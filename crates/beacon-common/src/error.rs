//! Error types and error codes for Beacon
//!
//! This module defines:
//! - `BeaconError`: Application-specific error enum
//! - `ErrorCode`: Structured codes carried by protocol rejections

use serde::{Deserialize, Serialize};

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum BeaconError {
    #[error("configuration error: {0}")]
    ConfigError(String),
}

/// Error code structure carried by rejections
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

// Protocol-level rejection codes. These travel on the wire in `errorCode`.

pub const BAD_REQUEST: ErrorCode<'static> = ErrorCode {
    code: 400,
    message: "bad request",
};

pub const METHOD_NOT_FOUND: ErrorCode<'static> = ErrorCode {
    code: 404,
    message: "method not found",
};

pub const REQUEST_TIMEOUT: ErrorCode<'static> = ErrorCode {
    code: 408,
    message: "request timeout",
};

pub const HANDLER_ERROR: ErrorCode<'static> = ErrorCode {
    code: 500,
    message: "handler error",
};

pub const PUBLISH_FAILED: ErrorCode<'static> = ErrorCode {
    code: 502,
    message: "publish failed",
};

pub const CONNECTION_CLOSED: ErrorCode<'static> = ErrorCode {
    code: 503,
    message: "connection closed",
};

pub const TRANSPORT_ERROR: ErrorCode<'static> = ErrorCode {
    code: 504,
    message: "transport error",
};

pub const NODE_INFO_ERROR: ErrorCode<'static> = ErrorCode {
    code: 23001,
    message: "node info error",
};
