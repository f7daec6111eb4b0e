//! Peer watching
//!
//! Each `watch` call owns one task and one snapshot of the watched service.
//! The task subscribes to the service prefix before scanning it, so no
//! change can fall between the scan and the first event. Events that the
//! scan already reflected are harmless: a PUT of a known id is a silent
//! refresh and a DELETE of an unknown id is ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use beacon_api::{Node, node_id_from_key, scan_prefix, validate_service_name};
use beacon_common::DEFAULT_SCHEME;
use dashmap::DashMap;
use futures::StreamExt;
use metrics::counter;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::{DiscoveryError, Result};
use crate::listener::{NodeEvent, NodeEventListener};
use crate::registry::decode_entry;
use crate::store::{KvEvent, KvEventType, KvStore};

#[derive(Clone, Debug)]
pub struct WatcherConfig {
    pub scheme: String,
    /// First resubscribe delay after a watch failure
    pub initial_backoff: Duration,
    /// Upper bound of the resubscribe delay
    pub max_backoff: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl WatcherConfig {
    fn backoff(&self) -> ResubscribeDelay {
        ResubscribeDelay {
            initial: self.initial_backoff,
            max: self.max_backoff,
            current: self.initial_backoff,
        }
    }
}

/// Doubling delay between resubscribe attempts, capped at `max`.
struct ResubscribeDelay {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ResubscribeDelay {
    fn next_delay(&mut self) -> Duration {
        let delay = std::cmp::min(self.current, self.max);
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

type WatchTasks = Arc<DashMap<u64, AbortHandle>>;

/// Spawns and tracks watch tasks over one store.
pub struct ServiceWatcher {
    store: Arc<dyn KvStore>,
    config: WatcherConfig,
    tasks: WatchTasks,
    next_id: AtomicU64,
}

impl ServiceWatcher {
    pub fn new(store: Arc<dyn KvStore>, config: WatcherConfig) -> Self {
        Self {
            store,
            config,
            tasks: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start watching `service_name`. Returns immediately; the initial scan
    /// and every later change are reported to `listener` from the watch task.
    pub fn watch(
        &self,
        service_name: &str,
        listener: Arc<dyn NodeEventListener>,
    ) -> Result<WatchHandle> {
        validate_service_name(service_name)
            .map_err(|e| DiscoveryError::invalid("service_name", e))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = WatchTask {
            store: self.store.clone(),
            service_name: service_name.to_string(),
            prefix: scan_prefix(&self.config.scheme, service_name),
            listener,
            snapshot: HashMap::new(),
        };
        let backoff = self.config.backoff();
        let handle = tokio::spawn(task.run(backoff));

        self.tasks.insert(id, handle.abort_handle());
        info!(service = %service_name, watch_id = id, "Watching service");

        Ok(WatchHandle {
            id,
            service_name: service_name.to_string(),
            tasks: self.tasks.clone(),
        })
    }

    /// Number of watches still running
    pub fn active_watches(&self) -> usize {
        self.tasks.len()
    }

    /// Stop every watch started from this watcher.
    pub fn stop_all(&self) {
        self.tasks.retain(|_, task| {
            task.abort();
            false
        });
    }
}

impl Drop for ServiceWatcher {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Stops its watch when stopped or dropped.
pub struct WatchHandle {
    id: u64,
    service_name: String,
    tasks: WatchTasks,
}

impl WatchHandle {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn is_active(&self) -> bool {
        self.tasks.contains_key(&self.id)
    }

    pub fn stop(self) {
        // Drop does the work
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some((_, task)) = self.tasks.remove(&self.id) {
            task.abort();
            debug!(service = %self.service_name, watch_id = self.id, "Watch stopped");
        }
    }
}

struct WatchTask {
    store: Arc<dyn KvStore>,
    service_name: String,
    prefix: String,
    listener: Arc<dyn NodeEventListener>,
    snapshot: HashMap<String, Node>,
}

impl WatchTask {
    async fn run(mut self, mut backoff: ResubscribeDelay) {
        loop {
            if self.watch_once(&mut backoff).await {
                warn!(service = %self.service_name, "Watch stream ended, resubscribing");
            }
            counter!("watcher_resubscribes_total").increment(1);
            let delay = backoff.next_delay();
            tokio::time::sleep(delay).await;
        }
    }

    /// Subscribe, reconcile and follow the stream until it fails. Returns
    /// true when the stream was established before it failed.
    async fn watch_once(&mut self, backoff: &mut ResubscribeDelay) -> bool {
        let mut stream = match self.store.watch_prefix(&self.prefix).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(service = %self.service_name, error = %e, "Failed to subscribe to watch");
                return false;
            }
        };

        match self.store.get_prefix(&self.prefix).await {
            Ok(kvs) => {
                let nodes = kvs
                    .iter()
                    .filter_map(|kv| decode_entry(&self.service_name, &self.prefix, kv))
                    .collect();
                self.reconcile(nodes);
            }
            Err(e) => {
                warn!(service = %self.service_name, error = %e, "Failed to scan service");
                return false;
            }
        }
        backoff.reset();

        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => self.apply(event),
                Err(e) => {
                    warn!(service = %self.service_name, error = %e, "Watch stream failed");
                    break;
                }
            }
        }
        true
    }

    /// Replace the snapshot with a full scan, firing UP for new ids and DOWN
    /// for ids no longer present.
    fn reconcile(&mut self, nodes: Vec<Node>) {
        let mut current: HashMap<String, Node> =
            nodes.into_iter().map(|n| (n.id.clone(), n)).collect();

        let vanished: Vec<String> = self
            .snapshot
            .keys()
            .filter(|id| !current.contains_key(*id))
            .cloned()
            .collect();
        for id in vanished {
            if let Some(node) = self.snapshot.remove(&id) {
                self.fire(NodeEvent::down(&self.service_name, node));
            }
        }

        let mut ids: Vec<String> = current.keys().cloned().collect();
        ids.sort();
        for id in ids {
            let Some(node) = current.remove(&id) else {
                continue;
            };
            if self.snapshot.insert(id, node.clone()).is_none() {
                self.fire(NodeEvent::up(&self.service_name, node));
            }
        }
    }

    fn apply(&mut self, event: KvEvent) {
        match event.event_type {
            KvEventType::Put => {
                let kv = crate::store::KeyValue {
                    key: event.key,
                    value: event.value,
                };
                let Some(node) = decode_entry(&self.service_name, &self.prefix, &kv) else {
                    return;
                };
                if self.snapshot.insert(node.id.clone(), node.clone()).is_none() {
                    self.fire(NodeEvent::up(&self.service_name, node));
                }
            }
            KvEventType::Delete => {
                let Some(id) = node_id_from_key(&self.prefix, &event.key) else {
                    return;
                };
                if let Some(node) = self.snapshot.remove(id) {
                    self.fire(NodeEvent::down(&self.service_name, node));
                }
            }
        }
    }

    fn fire(&self, event: NodeEvent) {
        debug!(
            service = %self.service_name,
            node_id = %event.node.id,
            state = %event.state,
            "Peer state changed"
        );
        counter!("watcher_events_total", "state" => event.state.as_str()).increment(1);
        self.listener.on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ChannelNodeListener;
    use crate::store::MemoryKvStore;
    use beacon_common::{INFO_IP, NodeState};

    fn task(listener: Arc<dyn NodeEventListener>) -> WatchTask {
        WatchTask {
            store: Arc::new(MemoryKvStore::new()),
            service_name: "game".to_string(),
            prefix: scan_prefix("dc1", "game"),
            listener,
            snapshot: HashMap::new(),
        }
    }

    fn node(id: &str) -> Node {
        Node::new("game", id).with_info(INFO_IP, "10.0.0.1")
    }

    fn put(id: &str) -> KvEvent {
        KvEvent::put(format!("dc1/game-{}", id), node(id).encode().unwrap())
    }

    #[tokio::test]
    async fn test_events_alternate_per_node() {
        let (listener, mut rx) = ChannelNodeListener::new();
        let mut task = task(Arc::new(listener));

        task.apply(put("a"));
        task.apply(put("a"));
        task.apply(KvEvent::delete("dc1/game-a"));
        task.apply(KvEvent::delete("dc1/game-a"));
        task.apply(put("a"));

        let states: Vec<NodeState> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.state)
            .collect();
        assert_eq!(states, vec![NodeState::Up, NodeState::Down, NodeState::Up]);
    }

    #[tokio::test]
    async fn test_reconcile_diffs_snapshot() {
        let (listener, mut rx) = ChannelNodeListener::new();
        let mut task = task(Arc::new(listener));

        task.reconcile(vec![node("a"), node("b")]);
        task.reconcile(vec![node("b"), node("c")]);

        let events: Vec<(NodeState, String)> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| (e.state, e.node.id))
            .collect();
        assert_eq!(
            events,
            vec![
                (NodeState::Up, "a".to_string()),
                (NodeState::Up, "b".to_string()),
                (NodeState::Down, "a".to_string()),
                (NodeState::Up, "c".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_foreign_service_events_are_ignored() {
        let (listener, mut rx) = ChannelNodeListener::new();
        let mut task = task(Arc::new(listener));

        let foreign = Node::new("game-server", "n1").with_info(INFO_IP, "10.0.0.2");
        task.apply(KvEvent::put("dc1/game-server-n1", foreign.encode().unwrap()));
        task.apply(KvEvent::delete("dc1/game-server-n1"));
        task.apply(KvEvent::put("dc1/game-x", b"garbage".to_vec()));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_backoff_respects_bounds() {
        let config = WatcherConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        let mut backoff = config.backoff();
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
