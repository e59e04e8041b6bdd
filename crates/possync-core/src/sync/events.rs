//! Lifecycle events and the bus that fans them out
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncEvent                                                      │
//! │  ├── Online / Offline: connectivity transitions                 │
//! │  ├── SyncStart / SyncSuccess / SyncError: cycle boundaries      │
//! │  └── ActionSynced / ActionFailed: per pending action outcome    │
//! │                                                                 │
//! │  EventBus                                                       │
//! │  ├── callbacks: called synchronously, registration order        │
//! │  └── event_tx: broadcast::Sender<SyncEvent> for async readers   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

use super::CycleReport;
use crate::types::{ActionKind, EntityKind};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the network monitor and the sync engine
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connectivity went from offline to online
    Online,
    /// Connectivity went from online to offline
    Offline,
    /// A sync cycle began
    SyncStart,
    /// A sync cycle ran to completion (individual items may still have failed)
    SyncSuccess {
        /// What the cycle did
        report: CycleReport,
    },
    /// The cycle itself could not run
    SyncError {
        /// Error message
        message: String,
    },
    /// A pending action was replayed and removed from the queue
    ActionSynced {
        sequence_id: u64,
        action_kind: ActionKind,
        entity_kind: EntityKind,
    },
    /// A pending action was dropped without being applied
    ActionFailed {
        sequence_id: u64,
        action_kind: ActionKind,
        entity_kind: EntityKind,
        /// Attempts consumed, including the last one
        retry_count: u32,
        /// Last error seen
        reason: String,
        /// Rejected outright rather than exhausting retries
        terminal: bool,
    },
}

impl SyncEvent {
    /// Wire name of the event (`"sync-start"`, `"action-failed"`, ...)
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Online => "online",
            SyncEvent::Offline => "offline",
            SyncEvent::SyncStart => "sync-start",
            SyncEvent::SyncSuccess { .. } => "sync-success",
            SyncEvent::SyncError { .. } => "sync-error",
            SyncEvent::ActionSynced { .. } => "action-synced",
            SyncEvent::ActionFailed { .. } => "action-failed",
        }
    }

    /// The pending action this event is about, if any
    pub fn sequence_id(&self) -> Option<u64> {
        match self {
            SyncEvent::ActionSynced { sequence_id, .. }
            | SyncEvent::ActionFailed { sequence_id, .. } => Some(*sequence_id),
            _ => None,
        }
    }
}

type Callback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct BusInner {
    listeners: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<SyncEvent>,
}

/// Fan-out of [`SyncEvent`]s.
///
/// Callbacks run synchronously inside [`EventBus::publish`], in the order
/// they were registered. A callback that panics is logged and skipped; the
/// remaining callbacks still run and the publisher never sees the panic.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                event_tx,
            }),
        }
    }

    /// Register a callback. Keep the returned [`Subscription`] to remove it.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(callback)));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Receiver for async consumers; lagging receivers lose old events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Deliver `event` to every callback, then to broadcast receivers
    pub fn publish(&self, event: SyncEvent) {
        // Snapshot so callbacks may subscribe/unsubscribe while running
        let listeners: Vec<Callback> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for callback in listeners {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                warn!(event = event.name(), "Event listener panicked");
            }
        }

        let _ = self.inner.event_tx.send(event);
    }

    /// Detach every callback
    pub fn clear(&self) {
        self.inner.listeners.lock().clear();
    }

    /// Number of registered callbacks
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping it leaves the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "dropping a Subscription keeps the callback registered forever"]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the callback. Returns whether it was still registered.
    pub fn unsubscribe(self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut listeners = bus.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != self.id);
        listeners.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(bus: &EventBus, tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Subscription {
        let log = log.clone();
        bus.subscribe(move |event| log.lock().push(format!("{}:{}", tag, event.name())))
    }

    #[test]
    fn test_event_names() {
        assert_eq!(SyncEvent::Online.name(), "online");
        assert_eq!(SyncEvent::SyncStart.name(), "sync-start");
        assert_eq!(
            SyncEvent::SyncError {
                message: "boom".into()
            }
            .name(),
            "sync-error"
        );
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _a = recorder(&bus, "a", &log);
        let _b = recorder(&bus, "b", &log);
        bus.publish(SyncEvent::SyncStart);

        assert_eq!(*log.lock(), vec!["a:sync-start", "b:sync-start"]);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _bad = bus.subscribe(|_| panic!("listener bug"));
        let _good = recorder(&bus, "good", &log);

        bus.publish(SyncEvent::Offline);
        bus.publish(SyncEvent::Online);

        assert_eq!(*log.lock(), vec!["good:offline", "good:online"]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let sub = recorder(&bus, "a", &log);
        assert_eq!(bus.listener_count(), 1);
        assert!(sub.unsubscribe());
        assert_eq!(bus.listener_count(), 0);

        bus.publish(SyncEvent::SyncStart);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_clear_detaches_all() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let sub = recorder(&bus, "a", &log);
        bus.clear();
        assert!(!sub.unsubscribe());

        bus.publish(SyncEvent::SyncStart);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_receivers_see_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_events();

        bus.publish(SyncEvent::Online);

        assert_eq!(rx.recv().await.unwrap(), SyncEvent::Online);
    }
}
