//! Core types for the offline store and sync engine

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::error::SyncError;

/// Prefix reserved for ids minted while offline
pub const SYNTHETIC_ID_PREFIX: &str = "offline-";

/// Named collection in the local store.
///
/// Each collection declares its key field and the secondary indices the
/// store maintains for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Products,
    Customers,
    Invoices,
    PendingActions,
    Settings,
    SyncMetadata,
}

impl Collection {
    /// Every collection, in schema order
    pub const ALL: [Collection; 6] = [
        Collection::Products,
        Collection::Customers,
        Collection::Invoices,
        Collection::PendingActions,
        Collection::Settings,
        Collection::SyncMetadata,
    ];

    /// Name used for the backing table and on the command line
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Products => "products",
            Collection::Customers => "customers",
            Collection::Invoices => "invoices",
            Collection::PendingActions => "pending-actions",
            Collection::Settings => "settings",
            Collection::SyncMetadata => "sync-metadata",
        }
    }

    /// Record field holding the primary key
    pub fn key_field(&self) -> &'static str {
        match self {
            Collection::Products | Collection::Customers | Collection::Invoices => "id",
            Collection::PendingActions => "sequenceId",
            Collection::Settings => "key",
            Collection::SyncMetadata => "entityName",
        }
    }

    /// Record fields with a secondary index
    pub fn indexes(&self) -> &'static [&'static str] {
        match self {
            Collection::Products => &["barcode", "category", "isActive"],
            Collection::Customers => &["phone", "tier"],
            Collection::Invoices => &["invoiceNumber", "customer", "status", "createdAt", "synced"],
            Collection::PendingActions => &["actionKind", "entityKind", "enqueuedAt"],
            Collection::Settings | Collection::SyncMetadata => &[],
        }
    }

    /// Whether the store assigns keys from a monotonic counter
    pub fn is_auto_keyed(&self) -> bool {
        matches!(self, Collection::PendingActions)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| SyncError::UnknownCollection(s.to_string()))
    }
}

/// Kind of mutation a pending action replays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    UpdateStock,
    Pay,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
            ActionKind::UpdateStock => "update-stock",
            ActionKind::Pay => "pay",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ActionKind::Create),
            "update" => Ok(ActionKind::Update),
            "delete" => Ok(ActionKind::Delete),
            "update-stock" => Ok(ActionKind::UpdateStock),
            "pay" => Ok(ActionKind::Pay),
            other => Err(SyncError::InvalidOperation(format!(
                "unknown action kind '{}'",
                other
            ))),
        }
    }
}

/// Kind of entity a pending action targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Invoice,
    Payment,
    Product,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Invoice => "invoice",
            EntityKind::Payment => "payment",
            EntityKind::Product => "product",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoice" => Ok(EntityKind::Invoice),
            "payment" => Ok(EntityKind::Payment),
            "product" => Ok(EntityKind::Product),
            other => Err(SyncError::InvalidOperation(format!(
                "unknown entity kind '{}'",
                other
            ))),
        }
    }
}

/// A queued mutation waiting to be replayed against the remote API.
///
/// Serialized in camelCase so the record shape matches the indices declared
/// on [`Collection::PendingActions`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    /// Ordering key, assigned by the store at enqueue time
    #[serde(default)]
    pub sequence_id: u64,
    pub action_kind: ActionKind,
    pub entity_kind: EntityKind,
    /// Everything needed to replay the mutation
    pub payload: Value,
    /// Unix millis
    pub enqueued_at: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_retry_at: Option<i64>,
    /// Action that must be replayed before this one
    #[serde(default)]
    pub depends_on: Option<u64>,
    /// Sent with creates so the server can dedupe replays
    pub idempotency_key: String,
}

impl PendingAction {
    /// Build a fresh action; `sequence_id` is filled in by the store
    pub fn new(action_kind: ActionKind, entity_kind: EntityKind, payload: Value) -> Self {
        Self {
            sequence_id: 0,
            action_kind,
            entity_kind,
            payload,
            enqueued_at: Utc::now().timestamp_millis(),
            retry_count: 0,
            last_retry_at: None,
            depends_on: None,
            idempotency_key: Ulid::new().to_string(),
        }
    }

    /// The `id` the payload targets, if any
    pub fn target_id(&self) -> Option<&str> {
        self.payload.get("id").and_then(Value::as_str)
    }

    /// Whether this action creates an offline invoice under a synthetic id
    pub fn creates_synthetic(&self) -> bool {
        self.action_kind == ActionKind::Create
            && self.entity_kind == EntityKind::Invoice
            && self.target_id().is_some_and(is_synthetic_id)
    }
}

/// Bookkeeping written after each successful pull of a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub entity_name: String,
    pub last_synced_at: DateTime<Utc>,
    pub record_count: usize,
}

/// Point-in-time view of the engine, as rendered by the UI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Refreshed at the start of each push phase
    pub pending_count: usize,
}

/// Mint a synthetic id: `offline-<unix seconds>-<5 lowercase alphanumerics>`
pub fn synthetic_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    let suffix: String = (0..5)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{}{}-{}", SYNTHETIC_ID_PREFIX, Utc::now().timestamp(), suffix)
}

/// Whether an id was minted offline
pub fn is_synthetic_id(id: &str) -> bool {
    id.starts_with(SYNTHETIC_ID_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_roundtrip_by_name() {
        for collection in Collection::ALL {
            let parsed: Collection = collection.name().parse().unwrap();
            assert_eq!(parsed, collection);
        }
        assert!("orders".parse::<Collection>().is_err());
    }

    #[test]
    fn test_only_pending_actions_are_auto_keyed() {
        let auto: Vec<_> = Collection::ALL
            .into_iter()
            .filter(Collection::is_auto_keyed)
            .collect();
        assert_eq!(auto, vec![Collection::PendingActions]);
    }

    #[test]
    fn test_synthetic_id_shape() {
        let id = synthetic_id();
        assert!(is_synthetic_id(&id));

        let rest = id.strip_prefix(SYNTHETIC_ID_PREFIX).unwrap();
        let (secs, suffix) = rest.split_once('-').unwrap();
        assert!(secs.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 5);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_canonical_id_is_not_synthetic() {
        assert!(!is_synthetic_id("64f0c2a1b9e4d3f2a1b0c9d8"));
    }

    #[test]
    fn test_pending_action_serializes_camel_case() {
        let action = PendingAction::new(
            ActionKind::UpdateStock,
            EntityKind::Product,
            json!({"id": "p1", "quantity": 3}),
        );
        let value = serde_json::to_value(&action).unwrap();

        assert_eq!(value["actionKind"], "update-stock");
        assert_eq!(value["entityKind"], "product");
        assert_eq!(value["retryCount"], 0);
        assert!(value["lastRetryAt"].is_null());
        assert!(value.get("idempotencyKey").is_some());
    }

    #[test]
    fn test_creates_synthetic() {
        let action = PendingAction::new(
            ActionKind::Create,
            EntityKind::Invoice,
            json!({"id": "offline-1700000000-abc12"}),
        );
        assert!(action.creates_synthetic());

        let update = PendingAction::new(
            ActionKind::Update,
            EntityKind::Invoice,
            json!({"id": "offline-1700000000-abc12"}),
        );
        assert!(!update.creates_synthetic());

        let payment = PendingAction::new(
            ActionKind::Create,
            EntityKind::Payment,
            json!({"id": "offline-1700000000-abc12"}),
        );
        assert!(!payment.creates_synthetic());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("pay".parse::<ActionKind>().unwrap(), ActionKind::Pay);
        assert_eq!(
            "update-stock".parse::<ActionKind>().unwrap(),
            ActionKind::UpdateStock
        );
        assert_eq!("payment".parse::<EntityKind>().unwrap(), EntityKind::Payment);
        assert!("refund".parse::<ActionKind>().is_err());
    }
}
