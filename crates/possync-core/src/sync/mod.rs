//! Push/pull synchronization with the remote API
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncEngine::sync_cycle                                         │
//! │  ├── Pusher (push.rs)                                           │
//! │  │   └── replays PendingQueue in sequenceId order               │
//! │  ├── Puller (pull.rs)                                           │
//! │  │   ├── products, customers: replaced wholesale                │
//! │  │   └── invoices: merged, unsynced local records kept          │
//! │  └── EventBus (events.rs)                                       │
//! │      └── sync-start, action-*, sync-success / sync-error        │
//! │                                                                 │
//! │  RemoteApi (remote.rs)                                          │
//! │  └── HttpRemote: reqwest client with bearer token               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod events;
pub mod pull;
pub mod push;
pub mod remote;

use serde::Serialize;

pub use events::{EventBus, Subscription, SyncEvent};
pub use pull::PullReport;
pub use push::PushReport;
pub use remote::{HttpRemote, RemoteApi, RemoteResult, StaticToken, TokenSource};

/// What one sync cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub push: PushReport,
    pub pull: PullReport,
}
