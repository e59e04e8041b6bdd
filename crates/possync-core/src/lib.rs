//! PosSync Core Library
//!
//! Offline-first local store and sync engine for point-of-sale clients.
//!
//! ## Overview
//!
//! Sales, payments and stock adjustments are written to a local redb store and
//! appended to a durable pending-action queue. When the device is online the
//! engine replays the queue against the retail API in enqueue order, then
//! refreshes the locally cached products, customers and recent invoices.
//!
//! ## Core Principles
//!
//! - **Local-first**: every write lands locally before anything is sent
//! - **Exactly-once removal**: a queued action leaves the queue once, on
//!   success, terminal rejection or retry exhaustion
//! - **Non-destructive pull**: local invoices not yet accepted by the server
//!   are never overwritten by a remote snapshot
//!
//! ## Quick Start
//!
//! ```ignore
//! use possync_core::{EngineConfig, EventBus, HttpRemote, NetworkMonitor, StaticToken, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let remote = HttpRemote::new(Default::default(), Arc::new(StaticToken(None)))?;
//!     let network = NetworkMonitor::new(true, EventBus::new());
//!     let engine = SyncEngine::open("~/.possync/data", Arc::new(remote), network, EngineConfig::default())?;
//!     engine.init()?;
//!
//!     let id = engine.record_offline_invoice(json!({"customer": "c-1", "total": 42.5}))?;
//!     engine.record_offline_payment(&id, json!({"amount": 42.5, "method": "cash"}))?;
//!
//!     println!("{:?}", engine.force_sync().await);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod network;
pub mod queue;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use config::{EngineConfig, PosSyncConfig, RemoteConfig};
pub use engine::{SkipReason, SyncEngine, SyncOutcome, DATABASE_FILE};
pub use error::{RemoteError, SyncError, SyncResult};
pub use network::NetworkMonitor;
pub use queue::{DroppedAction, PendingQueue, RetryDecision, DEFAULT_MAX_RETRIES};
pub use storage::{Storage, StoreTxn};
pub use sync::{
    CycleReport, EventBus, HttpRemote, PullReport, PushReport, RemoteApi, RemoteResult,
    StaticToken, Subscription, SyncEvent, TokenSource,
};
pub use types::*;
