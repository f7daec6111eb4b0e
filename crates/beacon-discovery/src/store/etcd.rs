//! etcd-backed `KvStore`

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{KeyValue, KvEvent, KvStore, LeaseId, StoreError, StoreResult, WatchStream};

impl From<etcd_client::Error> for StoreError {
    fn from(err: etcd_client::Error) -> Self {
        match err {
            etcd_client::Error::TransportError(e) => StoreError::Unavailable(e.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// `KvStore` over an etcd v3 cluster.
///
/// `etcd_client::Client` is a cheap handle; every call works on a clone so
/// the store can be shared behind `&self`.
#[derive(Clone)]
pub struct EtcdKvStore {
    client: Client,
}

impl EtcdKvStore {
    pub async fn connect(endpoints: &[String]) -> StoreResult<Self> {
        let client = Client::connect(endpoints, None).await?;
        info!(?endpoints, "Connected to etcd");
        Ok(Self::from_client(client))
    }

    /// Wrap an already connected client, e.g. one built with TLS options.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KvStore for EtcdKvStore {
    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let resp = self.client.clone().lease_grant(ttl_secs, None).await?;
        debug!(lease_id = resp.id(), ttl_secs, "Granted lease");
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<Duration> {
        let (_keeper, mut stream) = self.client.clone().lease_keep_alive(lease).await?;
        match stream.message().await? {
            Some(resp) if resp.ttl() > 0 => Ok(Duration::from_secs(resp.ttl() as u64)),
            _ => Err(StoreError::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        self.client.clone().lease_revoke(lease).await?;
        Ok(())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.client.clone().put(key, value, options).await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let resp = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut result = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match kv.key_str() {
                Ok(key) => result.push(KeyValue {
                    key: key.to_string(),
                    value: kv.value().to_vec(),
                }),
                Err(e) => warn!(error = %e, "Skipping non UTF-8 key"),
            }
        }
        Ok(result)
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        let (watcher, stream) = self
            .client
            .clone()
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;

        // The watcher handle must outlive the stream or etcd cancels the watch
        let state = (watcher, stream, VecDeque::<KvEvent>::new(), false);
        let events = futures::stream::unfold(
            state,
            |(watcher, mut stream, mut pending, done)| async move {
                if done {
                    return None;
                }
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((Ok(event), (watcher, stream, pending, false)));
                    }
                    match stream.message().await {
                        Ok(Some(resp)) => {
                            if resp.canceled() {
                                return Some((
                                    Err(StoreError::WatchClosed),
                                    (watcher, stream, pending, true),
                                ));
                            }
                            for event in resp.events() {
                                let Some(kv) = event.kv() else { continue };
                                let Ok(key) = kv.key_str() else { continue };
                                pending.push_back(match event.event_type() {
                                    EventType::Put => KvEvent::put(key, kv.value().to_vec()),
                                    EventType::Delete => KvEvent::delete(key),
                                });
                            }
                        }
                        Ok(None) => return None,
                        Err(e) => {
                            return Some((Err(e.into()), (watcher, stream, pending, true)));
                        }
                    }
                }
            },
        );
        Ok(events.boxed())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.client.clone().delete(key, None).await?;
        Ok(())
    }
}
