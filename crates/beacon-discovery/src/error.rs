//! Discovery error types

use crate::store::LeaseId;

/// Errors reported by a `KvStore` backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("watch stream closed")]
    WatchClosed,

    #[error("watch stream lagged behind by {0} events")]
    Lagged(u64),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("node codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl DiscoveryError {
    pub(crate) fn invalid(field: &str, err: validator::ValidationError) -> Self {
        DiscoveryError::InvalidArgument(format!("{}: {}", field, err.code))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub type Result<T> = std::result::Result<T, DiscoveryError>;
