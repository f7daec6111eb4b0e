//! Beacon Discovery - node registration and peer watching
//!
//! This crate provides:
//! - `KvStore`: the lease/prefix-scan/prefix-watch slice of a consensus store,
//!   with an in-process backend and an etcd backend (feature `etcd`)
//! - `ServiceRegistry`: lease-backed registration with automatic re-registration
//! - `ServiceWatcher`: UP/DOWN peer events per service
//! - `ServiceNode`: facade combining both for one process

pub mod error;
pub mod listener;
pub mod node;
pub mod registry;
pub mod store;
pub mod watcher;

#[cfg(feature = "etcd")]
pub use store::EtcdKvStore;
pub use error::{DiscoveryError, Result, StoreError, StoreResult};
pub use listener::{ChannelNodeListener, FnNodeListener, NodeEvent, NodeEventListener};
pub use node::{ServiceNode, event_channel, rpc_channel};
pub use registry::{RegistryConfig, ServiceRegistry, list_nodes};
pub use store::{KeyValue, KvEvent, KvEventType, KvStore, LeaseId, MemoryKvStore, WatchStream};
pub use watcher::{ServiceWatcher, WatchHandle, WatcherConfig};
