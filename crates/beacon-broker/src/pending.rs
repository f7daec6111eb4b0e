//! Outstanding client requests, keyed by correlation id

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use beacon_api::{CorrelationId, RawMessage, Rejection};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

pub(crate) type CallResult = std::result::Result<RawMessage, Rejection>;

pub(crate) struct PendingCall {
    subject: String,
    method: String,
    tx: oneshot::Sender<CallResult>,
    created_at: Instant,
}

pub(crate) struct PendingCalls {
    calls: DashMap<CorrelationId, PendingCall>,
    next_id: AtomicU64,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self {
            calls: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id and register the call under it.
    pub(crate) fn register(
        &self,
        subject: &str,
        method: &str,
    ) -> (CorrelationId, oneshot::Receiver<CallResult>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            id,
            PendingCall {
                subject: subject.to_string(),
                method: method.to_string(),
                tx,
                created_at: Instant::now(),
            },
        );
        (id, rx)
    }

    /// Complete a call. Returns false for ids that are not pending.
    pub(crate) fn resolve(&self, id: CorrelationId, result: CallResult) -> bool {
        let Some((_, call)) = self.calls.remove(&id) else {
            return false;
        };
        debug!(
            id,
            subject = %call.subject,
            method = %call.method,
            elapsed = ?call.created_at.elapsed(),
            "Request resolved"
        );
        // The caller may have given up already
        let _ = call.tx.send(result);
        true
    }

    pub(crate) fn cancel(&self, id: CorrelationId) -> bool {
        self.calls.remove(&id).is_some()
    }

    /// Fail every outstanding call with `rejection`.
    pub(crate) fn fail_all(&self, rejection: &Rejection) -> usize {
        let ids: Vec<CorrelationId> = self.calls.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.resolve(*id, Err(rejection.clone())))
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}

/// Removes its call from the table when the request future goes away, so a
/// cancelled or timed-out call leaves nothing behind.
pub(crate) struct PendingGuard {
    calls: Arc<PendingCalls>,
    id: CorrelationId,
}

impl PendingGuard {
    pub(crate) fn new(calls: Arc<PendingCalls>, id: CorrelationId) -> Self {
        Self { calls, id }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.calls.cancel(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_common::error::CONNECTION_CLOSED;

    #[tokio::test]
    async fn test_resolve_once() {
        let calls = PendingCalls::new();
        let (id, rx) = calls.register("svc", "offer");

        assert!(calls.resolve(id, Ok(RawMessage::from("yes"))));
        assert!(!calls.resolve(id, Ok(RawMessage::Null)));
        assert_eq!(rx.await.unwrap(), Ok(RawMessage::from("yes")));
        assert_eq!(calls.len(), 0);
    }

    #[test]
    fn test_ids_are_unique() {
        let calls = PendingCalls::new();
        let (a, _ra) = calls.register("svc", "m");
        let (b, _rb) = calls.register("svc", "m");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let calls = PendingCalls::new();
        let (_, rx1) = calls.register("svc", "a");
        let (_, rx2) = calls.register("svc", "b");

        assert_eq!(calls.fail_all(&Rejection::connection_closed()), 2);
        assert_eq!(rx1.await.unwrap().unwrap_err().code, CONNECTION_CLOSED.code);
        assert!(rx2.await.unwrap().is_err());
    }

    #[test]
    fn test_guard_cancels() {
        let calls = Arc::new(PendingCalls::new());
        let (id, _rx) = calls.register("svc", "m");
        drop(PendingGuard::new(calls.clone(), id));
        assert_eq!(calls.len(), 0);
    }
}
