//! Key-value store with leases
//!
//! The registry and watcher only need a narrow slice of a consensus store:
//! leases, leased puts, prefix scans and prefix watches. `MemoryKvStore`
//! implements it in-process; `EtcdKvStore` (feature `etcd`) talks to etcd.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use crate::error::{StoreError, StoreResult};

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;

#[cfg(feature = "etcd")]
pub use etcd::EtcdKvStore;
pub use memory::MemoryKvStore;

pub type LeaseId = i64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KvEventType {
    Put,
    Delete,
}

/// A change observed by a prefix watch. `value` is empty for deletes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvEvent {
    pub event_type: KvEventType,
    pub key: String,
    pub value: Vec<u8>,
}

impl KvEvent {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            event_type: KvEventType::Put,
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            event_type: KvEventType::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }
}

/// Events in store order. An `Err` item or the end of the stream means the
/// watch is gone and must be re-established.
pub type WatchStream = BoxStream<'static, StoreResult<KvEvent>>;

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Grant a lease that expires after `ttl` unless kept alive.
    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// Refresh a lease, returning its renewed TTL. Fails with
    /// `LeaseNotFound` once the lease has expired or was revoked.
    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<Duration>;

    /// Revoke a lease, deleting every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()>;

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>>;

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream>;

    async fn delete(&self, key: &str) -> StoreResult<()>;
}
