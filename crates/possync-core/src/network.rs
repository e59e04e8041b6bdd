//! Connectivity tracking
//!
//! The host feeds its platform connectivity signal into
//! [`NetworkMonitor::set_online`]. The monitor publishes [`SyncEvent::Online`]
//! and [`SyncEvent::Offline`] on transitions only and exposes the current
//! state through a watch channel, which the engine listens on to start a
//! cycle when the client comes back online.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::sync::{EventBus, SyncEvent};

/// Tracks whether the remote API is reachable
#[derive(Clone)]
pub struct NetworkMonitor {
    state: Arc<watch::Sender<bool>>,
    bus: EventBus,
}

impl NetworkMonitor {
    /// Create a monitor seeded with the platform's current signal
    pub fn new(initially_online: bool, bus: EventBus) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self {
            state: Arc::new(state),
            bus,
        }
    }

    /// Current connectivity
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Report the platform's connectivity.
    ///
    /// Returns `true` when this call changed the state. Repeating the current
    /// state is a no-op and publishes nothing.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            if online {
                info!("Network online");
                self.bus.publish(SyncEvent::Online);
            } else {
                info!("Network offline");
                self.bus.publish(SyncEvent::Offline);
            }
        }
        changed
    }

    /// Receiver that wakes on every state change
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Bus this monitor publishes on
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}
