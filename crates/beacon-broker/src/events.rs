// Protocol lifecycle events
// Per-instance observer lists; listeners run in registration order

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Lifecycle event of a protocol or broadcaster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// The connection is gone; no more messages will flow
    Close { code: i32, reason: String },
    /// A recoverable connection-level error
    Error { code: i32, reason: String },
}

impl ProtocolEvent {
    pub fn code(&self) -> i32 {
        match self {
            ProtocolEvent::Close { code, .. } | ProtocolEvent::Error { code, .. } => *code,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ProtocolEvent::Close { reason, .. } | ProtocolEvent::Error { reason, .. } => reason,
        }
    }
}

impl std::fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolEvent::Close { code, reason } => write!(f, "CLOSE [{}] {}", code, reason),
            ProtocolEvent::Error { code, reason } => write!(f, "ERROR [{}] {}", code, reason),
        }
    }
}

/// Trait for handling protocol lifecycle events
pub trait ProtocolListener: Send + Sync + 'static {
    fn on_event(&self, event: &ProtocolEvent);
}

/// A simple listener that invokes a closure.
pub struct FnProtocolListener<F>
where
    F: Fn(&ProtocolEvent) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnProtocolListener<F>
where
    F: Fn(&ProtocolEvent) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ProtocolListener for FnProtocolListener<F>
where
    F: Fn(&ProtocolEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &ProtocolEvent) {
        (self.f)(event);
    }
}

/// Handle returned on registration, used to remove the listener again
pub type ListenerId = u64;

/// Registered listeners of one protocol instance
#[derive(Default)]
pub struct EventObservers {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ProtocolListener>)>>,
    next_id: AtomicU64,
}

impl EventObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn ProtocolListener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Deliver `event` to every listener. Listeners may register or remove
    /// listeners from inside the callback.
    pub fn emit(&self, event: &ProtocolEvent) {
        let listeners: Vec<Arc<dyn ProtocolListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.on_event(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_emit_in_registration_order() {
        let observers = EventObservers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let seen = seen.clone();
            observers.subscribe(Arc::new(FnProtocolListener::new(move |event| {
                seen.lock().push(format!("{}:{}", name, event.code()));
            })));
        }

        observers.emit(&ProtocolEvent::Close {
            code: 503,
            reason: "bye".to_string(),
        });
        assert_eq!(*seen.lock(), vec!["first:503", "second:503"]);
    }

    #[test]
    fn test_unsubscribe() {
        let observers = EventObservers::new();
        let id = observers.subscribe(Arc::new(FnProtocolListener::new(|_| {})));
        assert_eq!(observers.len(), 1);
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        assert!(observers.is_empty());
    }

    #[test]
    fn test_event_display() {
        let event = ProtocolEvent::Error {
            code: 504,
            reason: "disconnected".to_string(),
        };
        assert_eq!(event.to_string(), "ERROR [504] disconnected");
        assert_eq!(event.reason(), "disconnected");
    }
}
