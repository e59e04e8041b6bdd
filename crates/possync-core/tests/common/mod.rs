//! Shared fixtures: an in-memory retail API and engine builders

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;

use possync_core::{
    EngineConfig, EventBus, NetworkMonitor, RemoteApi, RemoteError, RemoteResult, Storage,
    SyncEngine, SyncEvent,
};

/// Server state behind [`MockRemote`]
#[derive(Default)]
pub struct MockState {
    pub products: Vec<Value>,
    pub customers: Vec<Value>,
    /// Canonical invoices by id
    pub invoices: HashMap<String, Value>,
    /// Calls in order, e.g. `create_invoice`, `pay_invoice:inv-1`
    pub calls: Vec<String>,
    /// Errors returned by the next mutating calls, front first
    pub scripted: VecDeque<RemoteError>,
    /// Error returned by every mutating call while set
    pub fail_mutations: Option<RemoteError>,
    /// Error returned by `fetch_customers` while set
    pub fail_customers: Option<RemoteError>,
    /// Delay applied to `fetch_products`
    pub fetch_delay: Option<Duration>,
    /// Idempotency key → created invoice id
    pub created: HashMap<String, String>,
    /// Run before every mutating call, outside the state lock
    pub before_mutation: Option<Arc<dyn Fn() + Send + Sync>>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct MockRemote {
    pub state: Arc<Mutex<MockState>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_products(self, products: Vec<Value>) -> Self {
        self.state.lock().products = products;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn calls_to(&self, name: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.split(':').next() == Some(name))
            .count()
    }

    pub fn script(&self, err: RemoteError) {
        self.state.lock().scripted.push_back(err);
    }

    pub fn fail_mutations(&self, err: Option<RemoteError>) {
        self.state.lock().fail_mutations = err;
    }

    pub fn before_mutation(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.state.lock().before_mutation = Some(Arc::new(hook));
    }

    /// Record a call and return a failure if one is due
    fn mutation(&self, call: String) -> RemoteResult<()> {
        let hook = self.state.lock().before_mutation.clone();
        if let Some(hook) = hook {
            hook();
        }

        let mut state = self.state.lock();
        state.calls.push(call);
        if let Some(err) = state.scripted.pop_front() {
            return Err(err);
        }
        match &state.fail_mutations {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn not_found(what: &str) -> RemoteError {
    RemoteError::Status {
        status: 404,
        body: format!("{} not found", what),
    }
}

fn merge(target: &mut Value, patch: &Value) {
    if let (Some(target), Some(patch)) = (target.as_object_mut(), patch.as_object()) {
        for (k, v) in patch {
            target.insert(k.clone(), v.clone());
        }
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn create_invoice(&self, invoice: &Value, idempotency_key: &str) -> RemoteResult<Value> {
        self.mutation("create_invoice".to_string())?;
        let mut state = self.state.lock();

        if let Some(id) = state.created.get(idempotency_key).cloned() {
            return state.invoices.get(&id).cloned().ok_or_else(|| not_found(&id));
        }

        state.next_id += 1;
        let id = format!("64f0{:020x}", state.next_id);
        let mut canonical = invoice.clone();
        merge(&mut canonical, &json!({"id": id, "status": "pending"}));

        state.created.insert(idempotency_key.to_string(), id.clone());
        state.invoices.insert(id, canonical.clone());
        Ok(canonical)
    }

    async fn update_invoice(&self, id: &str, invoice: &Value) -> RemoteResult<Value> {
        self.mutation(format!("update_invoice:{}", id))?;
        let mut state = self.state.lock();
        let existing = state.invoices.get_mut(id).ok_or_else(|| not_found(id))?;
        merge(existing, invoice);
        Ok(existing.clone())
    }

    async fn delete_invoice(&self, id: &str) -> RemoteResult<()> {
        self.mutation(format!("delete_invoice:{}", id))?;
        match self.state.lock().invoices.remove(id) {
            Some(_) => Ok(()),
            None => Err(not_found(id)),
        }
    }

    async fn pay_invoice(&self, id: &str, payment: &Value) -> RemoteResult<Value> {
        self.mutation(format!("pay_invoice:{}", id))?;
        let mut state = self.state.lock();
        let existing = state.invoices.get_mut(id).ok_or_else(|| not_found(id))?;
        merge(existing, &json!({"status": "paid", "lastPayment": payment}));
        Ok(existing.clone())
    }

    async fn update_stock(&self, id: &str, stock: &Value) -> RemoteResult<Value> {
        self.mutation(format!("update_stock:{}", id))?;
        let mut state = self.state.lock();
        let product = state
            .products
            .iter_mut()
            .find(|p| p.get("id").and_then(Value::as_str) == Some(id))
            .ok_or_else(|| not_found(id))?;
        merge(product, stock);
        Ok(product.clone())
    }

    async fn fetch_products(&self) -> RemoteResult<Vec<Value>> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push("fetch_products".to_string());
            state.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state.lock().products.clone())
    }

    async fn fetch_customers(&self) -> RemoteResult<Vec<Value>> {
        let mut state = self.state.lock();
        state.calls.push("fetch_customers".to_string());
        match &state.fail_customers {
            Some(err) => Err(err.clone()),
            None => Ok(state.customers.clone()),
        }
    }

    async fn fetch_invoices(&self, _since: DateTime<Utc>, limit: u32) -> RemoteResult<Vec<Value>> {
        let mut state = self.state.lock();
        state.calls.push("fetch_invoices".to_string());
        let mut invoices: Vec<Value> = state.invoices.values().cloned().collect();
        invoices.truncate(limit as usize);
        Ok(invoices)
    }
}

/// Engine over a fresh temp store. Background triggers are not started.
pub struct TestEngine {
    pub engine: SyncEngine,
    pub remote: MockRemote,
    pub network: NetworkMonitor,
    pub events: Arc<Mutex<Vec<SyncEvent>>>,
    _dir: TempDir,
}

impl TestEngine {
    pub fn new(online: bool) -> Self {
        Self::with(online, MockRemote::new(), EngineConfig::default())
    }

    pub fn with(online: bool, remote: MockRemote, config: EngineConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("test.redb")).unwrap();
        let network = NetworkMonitor::new(online, EventBus::new());
        let engine = SyncEngine::new(storage, Arc::new(remote.clone()), network.clone(), config);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _ = engine.add_listener(move |e| sink.lock().push(e.clone()));

        Self {
            engine,
            remote,
            network,
            events,
            _dir: dir,
        }
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(SyncEvent::name).collect()
    }

    pub fn events_for(&self, sequence_id: u64) -> Vec<SyncEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.sequence_id() == Some(sequence_id))
            .cloned()
            .collect()
    }
}

pub fn product(id: &str, stock: i64) -> Value {
    json!({
        "id": id,
        "name": format!("Product {}", id),
        "barcode": format!("800{}", id),
        "category": "grocery",
        "isActive": true,
        "stock": stock,
    })
}
