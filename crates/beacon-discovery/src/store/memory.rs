//! In-process `KvStore`
//!
//! Keys live in a `BTreeMap` so prefix scans come back in key order. Leases
//! carry a deadline on the tokio clock and expire lazily on the next store
//! operation, or eagerly when a reaper task is running. Watchers share one
//! broadcast channel and filter by prefix.
//!
//! The store also exposes fault injection hooks (`set_available`,
//! `close_watches`, `expire_lease`) so failure handling in the registry and
//! watcher can be exercised without a real cluster.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;

use super::{KeyValue, KvEvent, KvStore, LeaseId, StoreError, StoreResult, WatchStream};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct State {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    events: broadcast::Sender<KvEvent>,
}

impl State {
    fn emit(&self, event: KvEvent) {
        // No receivers just means nobody is watching
        let _ = self.events.send(event);
    }

    fn remove_key(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        if let Some(lease_id) = entry.lease
            && let Some(lease) = self.leases.get_mut(&lease_id)
        {
            lease.keys.remove(key);
        }
        self.emit(KvEvent::delete(key));
        true
    }

    fn drop_lease(&mut self, lease_id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&lease_id) else {
            return false;
        };
        for key in lease.keys {
            if self.entries.remove(&key).is_some() {
                self.emit(KvEvent::delete(key));
            }
        }
        true
    }

    fn reap(&mut self, now: Instant) -> usize {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease_id in &expired {
            debug!(lease_id, "Lease expired");
            self.drop_lease(*lease_id);
        }
        expired.len()
    }
}

pub struct MemoryKvStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State {
                entries: BTreeMap::new(),
                leases: HashMap::new(),
                next_lease: 1,
                events,
            }),
            available: AtomicBool::new(true),
        }
    }

    /// Make every subsequent operation fail with `StoreError::Unavailable`
    /// (or succeed again). Leases keep ticking while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// End every open watch stream, as a server-side watch cancellation would.
    pub fn close_watches(&self) {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        self.state.lock().events = events;
    }

    /// Expire a lease immediately, deleting its keys. Returns false when the
    /// lease does not exist.
    pub fn expire_lease(&self, lease_id: LeaseId) -> bool {
        self.state.lock().drop_lease(lease_id)
    }

    /// Drop every lease whose deadline has passed. Returns how many expired.
    pub fn reap_expired(&self) -> usize {
        self.state.lock().reap(Instant::now())
    }

    /// Periodically reap expired leases so watchers observe expiry without
    /// waiting for another store call. Stops once the store is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.reap_expired();
                    }
                    None => break,
                }
            }
        })
    }

    pub fn lease_count(&self) -> usize {
        self.state.lock().leases.len()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ))
        }
    }

    /// Lock the state after expiring overdue leases.
    fn live_state(&self) -> StoreResult<parking_lot::MutexGuard<'_, State>> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.reap(Instant::now());
        Ok(state)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        if ttl.is_zero() {
            return Err(StoreError::Backend("lease ttl must be positive".to_string()));
        }
        let mut state = self.live_state()?;
        let lease_id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            lease_id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        Ok(lease_id)
    }

    async fn keep_alive(&self, lease_id: LeaseId) -> StoreResult<Duration> {
        let mut state = self.live_state()?;
        let lease = state
            .leases
            .get_mut(&lease_id)
            .ok_or(StoreError::LeaseNotFound(lease_id))?;
        lease.deadline = Instant::now() + lease.ttl;
        Ok(lease.ttl)
    }

    async fn revoke_lease(&self, lease_id: LeaseId) -> StoreResult<()> {
        let mut state = self.live_state()?;
        if state.drop_lease(lease_id) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease_id))
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut state = self.live_state()?;
        if let Some(lease_id) = lease
            && !state.leases.contains_key(&lease_id)
        {
            return Err(StoreError::LeaseNotFound(lease_id));
        }

        let previous = state.entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        if let Some(old_lease) = previous.and_then(|entry| entry.lease)
            && Some(old_lease) != lease
            && let Some(old) = state.leases.get_mut(&old_lease)
        {
            old.keys.remove(key);
        }
        if let Some(lease_id) = lease
            && let Some(current) = state.leases.get_mut(&lease_id)
        {
            current.keys.insert(key.to_string());
        }

        state.emit(KvEvent::put(key, value));
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let state = self.live_state()?;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        let receiver = self.live_state()?.events.subscribe();
        let prefix = prefix.to_string();

        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let matched = match item {
                Ok(event) if event.key.starts_with(&prefix) => Some(Ok(event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    Some(Err(StoreError::Lagged(skipped)))
                }
            };
            futures::future::ready(matched)
        });
        Ok(stream.boxed())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.live_state()?.remove_key(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KvEventType;

    #[tokio::test]
    async fn test_put_and_get_prefix() {
        let store = MemoryKvStore::new();
        store.put("dc1/game-a", b"1".to_vec(), None).await.unwrap();
        store.put("dc1/game-b", b"2".to_vec(), None).await.unwrap();
        store.put("dc1/chat-a", b"3".to_vec(), None).await.unwrap();

        let kvs = store.get_prefix("dc1/game-").await.unwrap();
        let keys: Vec<&str> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["dc1/game-a", "dc1/game-b"]);

        assert!(store.get_prefix("dc2/").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_keys() {
        let store = MemoryKvStore::new();
        let lease = store.grant_lease(Duration::from_secs(3)).await.unwrap();
        store.put("k", b"v".to_vec(), Some(lease)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.keep_alive(lease).await.unwrap(), Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get_prefix("k").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get_prefix("k").await.unwrap().is_empty());
        assert!(matches!(
            store.keep_alive(lease).await,
            Err(StoreError::LeaseNotFound(id)) if id == lease
        ));
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryKvStore::new();
        assert!(matches!(
            store.put("k", Vec::new(), Some(42)).await,
            Err(StoreError::LeaseNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_revoke_deletes_keys_and_emits_events() {
        let store = MemoryKvStore::new();
        let mut watch = store.watch_prefix("svc-").await.unwrap();

        let lease = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        store.put("svc-1", b"v".to_vec(), Some(lease)).await.unwrap();
        store.put("other", b"v".to_vec(), Some(lease)).await.unwrap();
        store.revoke_lease(lease).await.unwrap();

        let put = watch.next().await.unwrap().unwrap();
        assert_eq!(put.event_type, KvEventType::Put);
        assert_eq!(put.key, "svc-1");

        let delete = watch.next().await.unwrap().unwrap();
        assert_eq!(delete.event_type, KvEventType::Delete);
        assert_eq!(delete.key, "svc-1");

        assert!(store.get_prefix("").await.unwrap().is_empty());
        assert!(store.revoke_lease(lease).await.is_err());
    }

    #[tokio::test]
    async fn test_reput_moves_key_between_leases() {
        let store = MemoryKvStore::new();
        let first = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        let second = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        store.put("k", b"1".to_vec(), Some(first)).await.unwrap();
        store.put("k", b"2".to_vec(), Some(second)).await.unwrap();

        assert!(store.expire_lease(first));
        assert_eq!(store.get_prefix("k").await.unwrap()[0].value, b"2".to_vec());
    }

    #[tokio::test]
    async fn test_unavailable_and_close_watches() {
        let store = MemoryKvStore::new();
        let mut watch = store.watch_prefix("").await.unwrap();

        store.set_available(false);
        assert!(matches!(
            store.get_prefix("").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);

        store.close_watches();
        assert!(watch.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_expires_without_store_calls() {
        let store = Arc::new(MemoryKvStore::new());
        let _reaper = store.spawn_reaper(Duration::from_millis(100));

        let lease = store.grant_lease(Duration::from_secs(1)).await.unwrap();
        store.put("k", b"v".to_vec(), Some(lease)).await.unwrap();
        let mut watch = store.watch_prefix("k").await.unwrap();

        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event.event_type, KvEventType::Delete);
        assert_eq!(store.lease_count(), 0);
    }
}
