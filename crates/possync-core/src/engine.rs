//! Main SyncEngine - the entry point for hosts
//!
//! SyncEngine coordinates Storage, PendingQueue, NetworkMonitor and the remote
//! API for:
//! - Recording sales and payments while offline
//! - Replaying them once connectivity returns (push)
//! - Refreshing the cached catalog, customers and recent invoices (pull)
//!
//! # Example
//!
//! ```ignore
//! use possync_core::{EngineConfig, EventBus, NetworkMonitor, SyncEngine};
//!
//! let bus = EventBus::new();
//! let network = NetworkMonitor::new(false, bus);
//! let engine = SyncEngine::open("~/.possync/data", remote, network.clone(), EngineConfig::default())?;
//! engine.init()?;
//!
//! // Offline sale
//! let id = engine.record_offline_invoice(json!({"customer": "c1", "total": 120}))?;
//!
//! // Connectivity returns: a cycle starts on its own
//! network.set_online(true);
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::network::NetworkMonitor;
use crate::queue::PendingQueue;
use crate::storage::Storage;
use crate::sync::pull::Puller;
use crate::sync::push::Pusher;
use crate::sync::{CycleReport, EventBus, RemoteApi, Subscription, SyncEvent};
use crate::types::{
    is_synthetic_id, synthetic_id, ActionKind, Collection, EntityKind, PendingAction, SyncStatus,
};

/// File name of the local store inside the data directory
pub const DATABASE_FILE: &str = "possync.redb";

/// Shortest accepted timer period
const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Why a sync request did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadySyncing,
}

/// Result of a sync request. Never an error: failures surface here and on
/// the event bus.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The cycle ran; individual actions or fetches may still have failed
    Completed(CycleReport),
    /// The cycle could not run to completion
    Failed(String),
    /// No cycle was started
    Skipped(SkipReason),
}

/// Clears the syncing flag however the cycle ends
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct EngineInner {
    storage: Storage,
    queue: PendingQueue,
    remote: Arc<dyn RemoteApi>,
    network: NetworkMonitor,
    bus: EventBus,
    config: EngineConfig,
    /// Only one cycle in flight at a time
    is_syncing: AtomicBool,
    pending_count: AtomicUsize,
    last_sync_time: Mutex<Option<DateTime<Utc>>>,
    /// Timer and network watcher, aborted by `stop()`
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

/// Offline-first sync orchestrator.
///
/// Cheap to clone; clones share state. Construct one per running client and
/// inject its collaborators, so tests can build isolated instances.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Create an engine over existing collaborators.
    ///
    /// Events are published on the network monitor's bus.
    pub fn new(
        storage: Storage,
        remote: Arc<dyn RemoteApi>,
        network: NetworkMonitor,
        config: EngineConfig,
    ) -> Self {
        let queue = PendingQueue::new(storage.clone(), config.max_retries);
        let bus = network.bus().clone();

        Self {
            inner: Arc::new(EngineInner {
                storage,
                queue,
                remote,
                network,
                bus,
                config,
                is_syncing: AtomicBool::new(false),
                pending_count: AtomicUsize::new(0),
                last_sync_time: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Open the local store under `data_dir` and create an engine over it
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Io` if the directory cannot be created.
    /// Returns `SyncError::SchemaMismatch` if the store was written by a newer build.
    pub fn open(
        data_dir: impl AsRef<Path>,
        remote: Arc<dyn RemoteApi>,
        network: NetworkMonitor,
        config: EngineConfig,
    ) -> SyncResult<Self> {
        let data_dir = data_dir.as_ref();
        info!(?data_dir, "Opening local store");
        std::fs::create_dir_all(data_dir)?;

        let storage = Storage::open(data_dir.join(DATABASE_FILE))?;
        Ok(Self::new(storage, remote, network, config))
    }

    /// Get a reference to the storage layer
    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    /// Get a reference to the pending action queue
    pub fn queue(&self) -> &PendingQueue {
        &self.inner.queue
    }

    /// Connectivity monitor feeding the engine
    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    /// Bus that engine and push events are published on
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Tuning in effect
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Start the background triggers.
    ///
    /// Seeds `pendingCount` from the queue, starts the periodic timer and the
    /// network watcher, and runs a first cycle when already online (unless
    /// `sync_on_init` is off). Calling it again while started is a no-op.
    /// Must be called from within a tokio runtime.
    pub fn init(&self) -> SyncResult<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            debug!("Engine already started");
            return Ok(());
        }

        self.refresh_pending_count()?;

        let timer = self.spawn_timer();
        let watcher = self.spawn_network_watcher();
        self.inner.tasks.lock().extend([timer, watcher]);

        info!(
            interval_secs = self.inner.config.sync_interval.as_secs(),
            online = self.inner.network.is_online(),
            "Sync engine started"
        );

        if self.inner.config.sync_on_init && self.inner.network.is_online() {
            self.spawn_cycle("init");
        }
        Ok(())
    }

    /// Stop the timer and network watcher and detach every listener.
    ///
    /// A cycle already in flight is allowed to finish.
    pub fn stop(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.bus.clear();
        self.inner.started.store(false, Ordering::Release);
        info!("Sync engine stopped");
    }

    /// Whether `init()` has run and `stop()` has not
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    fn spawn_timer(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sync_interval.max(MIN_SYNC_INTERVAL);

        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match upgrade(&weak) {
                    Some(engine) => engine.spawn_cycle("timer"),
                    None => break,
                }
            }
        })
    }

    fn spawn_network_watcher(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let mut rx = self.inner.network.watch();

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if !online {
                    continue;
                }
                match upgrade(&weak) {
                    Some(engine) => engine.spawn_cycle("online"),
                    None => break,
                }
            }
        })
    }

    /// Run a cycle in its own task so `stop()` never cancels it midway
    fn spawn_cycle(&self, trigger: &'static str) {
        let engine = self.clone();
        tokio::spawn(async move {
            debug!(trigger, "Sync triggered");
            engine.sync_cycle().await;
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════

    /// Run a cycle now and wait for it.
    ///
    /// A no-op while offline or while another cycle is running.
    pub async fn force_sync(&self) -> SyncOutcome {
        self.sync_cycle().await
    }

    /// The host application came back to the foreground
    pub fn notify_foreground(&self) {
        self.spawn_cycle("foreground");
    }

    async fn sync_cycle(&self) -> SyncOutcome {
        let inner = &self.inner;

        if !inner.network.is_online() {
            debug!("Offline, skipping sync");
            return SyncOutcome::Skipped(SkipReason::Offline);
        }

        if inner
            .is_syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync already in progress");
            return SyncOutcome::Skipped(SkipReason::AlreadySyncing);
        }
        let guard = SyncingGuard(&inner.is_syncing);

        info!("Sync cycle started");
        inner.bus.publish(SyncEvent::SyncStart);

        let result = self.run_phases().await;

        *inner.last_sync_time.lock() = Some(Utc::now());
        drop(guard);

        match result {
            Ok(report) => {
                info!(
                    synced = report.push.synced,
                    failed = report.push.failed,
                    retried = report.push.retried,
                    deferred = report.push.deferred,
                    pull_errors = report.pull.errors.len(),
                    "Sync cycle finished"
                );
                inner.bus.publish(SyncEvent::SyncSuccess {
                    report: report.clone(),
                });
                SyncOutcome::Completed(report)
            }
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "Sync cycle failed");
                inner.bus.publish(SyncEvent::SyncError {
                    message: message.clone(),
                });
                SyncOutcome::Failed(message)
            }
        }
    }

    async fn run_phases(&self) -> SyncResult<CycleReport> {
        let inner = &self.inner;

        self.refresh_pending_count()?;
        let push = Pusher {
            storage: &inner.storage,
            queue: &inner.queue,
            remote: inner.remote.as_ref(),
            bus: &inner.bus,
        }
        .run()
        .await?;
        self.refresh_pending_count()?;

        let pull = Puller {
            storage: &inner.storage,
            remote: inner.remote.as_ref(),
            config: &inner.config,
        }
        .run()
        .await;

        Ok(CycleReport { push, pull })
    }

    fn refresh_pending_count(&self) -> SyncResult<usize> {
        let count = self.inner.queue.len()?;
        self.inner.pending_count.store(count, Ordering::Relaxed);
        Ok(count)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Status & Events
    // ═══════════════════════════════════════════════════════════════════════

    /// Point-in-time snapshot for the UI
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.inner.network.is_online(),
            is_syncing: self.inner.is_syncing.load(Ordering::Acquire),
            last_sync_time: *self.inner.last_sync_time.lock(),
            pending_count: self.inner.pending_count.load(Ordering::Relaxed),
        }
    }

    /// Register a callback for every engine and network event
    pub fn add_listener<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(callback)
    }

    /// Subscribe to events as an async stream
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut events = engine.subscribe_events();
    /// tokio::spawn(async move {
    ///     while let Ok(event) = events.recv().await {
    ///         if let SyncEvent::ActionFailed { sequence_id, reason, .. } = event {
    ///             eprintln!("dropped #{}: {}", sequence_id, reason);
    ///         }
    ///     }
    /// });
    /// ```
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.bus.subscribe_events()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Offline Writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Queue a raw mutation. Returns its `sequenceId`.
    pub fn enqueue(
        &self,
        action_kind: ActionKind,
        entity_kind: EntityKind,
        payload: Value,
    ) -> SyncResult<u64> {
        let seq = self.inner.queue.enqueue(action_kind, entity_kind, payload)?;
        self.inner.pending_count.fetch_add(1, Ordering::Relaxed);
        Ok(seq)
    }

    /// Queued invoice mutations
    pub fn get_pending_invoices(&self) -> SyncResult<Vec<PendingAction>> {
        self.inner.queue.get_pending_invoices()
    }

    /// Record a sale made while offline.
    ///
    /// The invoice is stored under a synthetic id with `synced = false` and its
    /// create action is queued in the same transaction. Returns the synthetic
    /// id. An invoice that already carries a canonical id is rejected.
    pub fn record_offline_invoice(&self, mut invoice: Value) -> SyncResult<String> {
        let obj = invoice.as_object_mut().ok_or_else(|| SyncError::InvalidRecord {
            collection: Collection::Invoices.name(),
            reason: "invoice must be a JSON object".into(),
        })?;

        let id = match obj.get("id").and_then(Value::as_str) {
            Some(id) if is_synthetic_id(id) => id.to_string(),
            Some(id) => {
                return Err(SyncError::InvalidOperation(format!(
                    "invoice {} already has a server id",
                    id
                )))
            }
            None => synthetic_id(),
        };
        obj.insert("id".to_string(), json!(id));
        obj.insert("synced".to_string(), json!(false));
        obj.entry("createdAt")
            .or_insert_with(|| json!(Utc::now().to_rfc3339()));

        let seq = self.inner.storage.write(|txn| {
            txn.put(Collection::Invoices, &invoice)?;
            PendingQueue::push_in(
                txn,
                PendingAction::new(ActionKind::Create, EntityKind::Invoice, invoice.clone()),
            )
        })?;
        self.inner.pending_count.fetch_add(1, Ordering::Relaxed);

        info!(%id, sequence_id = seq, "Recorded offline invoice");
        Ok(id)
    }

    /// Record a payment against an invoice while offline.
    ///
    /// If the invoice's own create action is still queued, the payment is
    /// made to depend on it.
    pub fn record_offline_payment(&self, invoice_id: &str, payment: Value) -> SyncResult<u64> {
        let mut payload = match payment {
            Value::Object(obj) => obj,
            _ => {
                return Err(SyncError::InvalidOperation(
                    "payment must be a JSON object".into(),
                ))
            }
        };
        payload.insert("invoiceId".to_string(), json!(invoice_id));

        let depends_on = self
            .inner
            .queue
            .find_create(EntityKind::Invoice, invoice_id)?
            .map(|a| a.sequence_id);

        let payload = Value::Object(payload);
        let seq = match depends_on {
            Some(create) => self.inner.queue.enqueue_after(
                ActionKind::Pay,
                EntityKind::Payment,
                payload,
                create,
            )?,
            None => self
                .inner
                .queue
                .enqueue(ActionKind::Pay, EntityKind::Payment, payload)?,
        };
        self.inner.pending_count.fetch_add(1, Ordering::Relaxed);

        debug!(invoice_id, sequence_id = seq, ?depends_on, "Recorded offline payment");
        Ok(seq)
    }

    /// Record a stock adjustment while offline.
    ///
    /// `stock` fields are merged into the cached product right away and the
    /// patch is queued in the same transaction.
    pub fn record_stock_change(&self, product_id: &str, stock: Value) -> SyncResult<u64> {
        let fields = stock.as_object().cloned().ok_or_else(|| {
            SyncError::InvalidOperation("stock change must be a JSON object".into())
        })?;

        let mut payload = fields.clone();
        payload.insert("id".to_string(), json!(product_id));

        let seq = self.inner.storage.write(|txn| {
            if let Some(mut product) = txn.get_by_id(Collection::Products, product_id)? {
                if let Some(obj) = product.as_object_mut() {
                    obj.extend(fields);
                }
                txn.put(Collection::Products, &product)?;
            }
            PendingQueue::push_in(
                txn,
                PendingAction::new(ActionKind::UpdateStock, EntityKind::Product, Value::Object(payload)),
            )
        })?;
        self.inner.pending_count.fetch_add(1, Ordering::Relaxed);
        Ok(seq)
    }
}

fn upgrade(weak: &Weak<EngineInner>) -> Option<SyncEngine> {
    weak.upgrade().map(|inner| SyncEngine { inner })
}
