//! Pending action queue
//!
//! Mutations made while offline are appended to the `pending-actions`
//! collection. The store assigns each one a monotonically increasing
//! `sequenceId`, so iterating the collection yields enqueue order.
//!
//! An action leaves the queue exactly once: after a successful replay, after a
//! terminal rejection, or when its retry budget runs out. Actions dropped
//! without being applied are appended to an audit log kept in `settings`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::storage::{sequence_key, Storage, StoreTxn};
use crate::types::{ActionKind, Collection, EntityKind, PendingAction};

/// Default number of failed attempts before an action is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Settings key holding the dropped-action audit log
pub const DROPPED_ACTIONS_KEY: &str = "dropped-actions";

/// Entries kept in the audit log
const DROPPED_ACTIONS_LIMIT: usize = 100;

/// Payload fields that may reference another entity's id
const REFERENCE_FIELDS: [&str; 2] = ["id", "invoiceId"];

/// What [`PendingQueue::increment_retry`] did with the action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Still queued with this many failed attempts
    Retry(u32),
    /// Ceiling reached; the action was removed
    Exhausted(u32),
    /// The action was no longer queued
    Gone,
}

/// Audit entry for an action dropped without being applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroppedAction {
    pub action: PendingAction,
    pub reason: String,
    /// Unix millis
    pub dropped_at: i64,
}

/// FIFO log of mutations waiting to be replayed remotely
#[derive(Clone)]
pub struct PendingQueue {
    storage: Storage,
    max_retries: u32,
}

impl PendingQueue {
    pub fn new(storage: Storage, max_retries: u32) -> Self {
        Self {
            storage,
            max_retries: max_retries.max(1),
        }
    }

    /// Retry ceiling in effect
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Append an action. Returns its `sequenceId`.
    pub fn enqueue(
        &self,
        action_kind: ActionKind,
        entity_kind: EntityKind,
        payload: Value,
    ) -> SyncResult<u64> {
        self.push(PendingAction::new(action_kind, entity_kind, payload))
    }

    /// Append an action that must not be replayed before `depends_on`
    pub fn enqueue_after(
        &self,
        action_kind: ActionKind,
        entity_kind: EntityKind,
        payload: Value,
        depends_on: u64,
    ) -> SyncResult<u64> {
        let mut action = PendingAction::new(action_kind, entity_kind, payload);
        action.depends_on = Some(depends_on);
        self.push(action)
    }

    /// Append a fully built action
    pub fn push(&self, action: PendingAction) -> SyncResult<u64> {
        self.storage.write(|txn| Self::push_in(txn, action))
    }

    /// Append inside an existing transaction
    pub fn push_in(txn: &mut StoreTxn<'_>, action: PendingAction) -> SyncResult<u64> {
        let seq = txn.insert_auto(Collection::PendingActions, serde_json::to_value(&action)?)?;
        debug!(
            sequence_id = seq,
            action = %action.action_kind,
            entity = %action.entity_kind,
            "Enqueued pending action"
        );
        Ok(seq)
    }

    /// Every queued action, ascending by `sequenceId`
    pub fn list_all(&self) -> SyncResult<Vec<PendingAction>> {
        decode_all(self.storage.get_all(Collection::PendingActions)?)
    }

    /// Load a single action
    pub fn get(&self, sequence_id: u64) -> SyncResult<Option<PendingAction>> {
        match self
            .storage
            .get_by_id(Collection::PendingActions, &sequence_key(sequence_id))?
        {
            Some(record) => Ok(Some(serde_json::from_value(record)?)),
            None => Ok(None),
        }
    }

    /// Whether the action is still queued
    pub fn contains(&self, sequence_id: u64) -> SyncResult<bool> {
        Ok(self.get(sequence_id)?.is_some())
    }

    /// Remove an action. Returns `false` if it was already gone.
    pub fn remove(&self, sequence_id: u64) -> SyncResult<bool> {
        self.storage
            .delete(Collection::PendingActions, &sequence_key(sequence_id))
    }

    /// Record a failed attempt.
    ///
    /// Bumps `retryCount` and stamps `lastRetryAt`. Once the count reaches the
    /// ceiling the action is removed, logged as dropped, and
    /// [`RetryDecision::Exhausted`] is returned. An action removed in the
    /// meantime yields [`RetryDecision::Gone`].
    pub fn increment_retry(&self, sequence_id: u64, reason: &str) -> SyncResult<RetryDecision> {
        let max_retries = self.max_retries;
        self.storage.write(|txn| {
            let key = sequence_key(sequence_id);
            let Some(record) = txn.get_by_id(Collection::PendingActions, &key)? else {
                debug!(sequence_id, "Retry skipped, action no longer queued");
                return Ok(RetryDecision::Gone);
            };
            let mut action: PendingAction = serde_json::from_value(record)?;

            action.retry_count += 1;
            action.last_retry_at = Some(Utc::now().timestamp_millis());

            if action.retry_count >= max_retries {
                txn.delete(Collection::PendingActions, &key)?;
                let retries = action.retry_count;
                Self::record_dropped_in(txn, action, reason)?;
                warn!(sequence_id, retries, reason, "Pending action exhausted retries");
                Ok(RetryDecision::Exhausted(retries))
            } else {
                txn.put(Collection::PendingActions, &serde_json::to_value(&action)?)?;
                Ok(RetryDecision::Retry(action.retry_count))
            }
        })
    }

    /// Remove an action the server will never accept and log it as dropped
    pub fn drop_terminal(&self, action: &PendingAction, reason: &str) -> SyncResult<bool> {
        self.storage.write(|txn| {
            let removed =
                txn.delete(Collection::PendingActions, &sequence_key(action.sequence_id))?;
            if removed {
                let mut dropped = action.clone();
                dropped.retry_count += 1;
                Self::record_dropped_in(txn, dropped, reason)?;
            }
            Ok(removed)
        })
    }

    /// Number of queued actions
    pub fn len(&self) -> SyncResult<usize> {
        self.storage.count(Collection::PendingActions)
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of queued actions targeting `entity_kind`
    pub fn count_by_entity(&self, entity_kind: EntityKind) -> SyncResult<usize> {
        Ok(self.list_by_entity(entity_kind)?.len())
    }

    /// Queued actions targeting `entity_kind`, in enqueue order
    pub fn list_by_entity(&self, entity_kind: EntityKind) -> SyncResult<Vec<PendingAction>> {
        decode_all(self.storage.get_by_index(
            Collection::PendingActions,
            "entityKind",
            &json!(entity_kind.as_str()),
        )?)
    }

    /// Queued invoice mutations, used by the UI to badge unsent sales
    pub fn get_pending_invoices(&self) -> SyncResult<Vec<PendingAction>> {
        self.list_by_entity(EntityKind::Invoice)
    }

    /// Queued action that creates the entity with id `id`, if any
    pub fn find_create(&self, entity_kind: EntityKind, id: &str) -> SyncResult<Option<PendingAction>> {
        Ok(self.list_by_entity(entity_kind)?.into_iter().find(|a| {
            a.action_kind == ActionKind::Create && a.target_id() == Some(id)
        }))
    }

    /// Audit log of actions dropped without being applied, oldest first
    pub fn dropped_actions(&self) -> SyncResult<Vec<DroppedAction>> {
        Ok(self
            .storage
            .get_setting(DROPPED_ACTIONS_KEY)?
            .unwrap_or_default())
    }

    /// Point queued actions at `canonical` instead of `synthetic`.
    ///
    /// Runs inside the transaction that replaces the synthetic record, so no
    /// reader sees the new record while actions still reference the old id.
    /// Returns how many actions were rewritten.
    pub fn rewrite_references(
        txn: &mut StoreTxn<'_>,
        synthetic: &str,
        canonical: &str,
    ) -> SyncResult<usize> {
        let mut rewritten = 0;
        for record in txn.get_all(Collection::PendingActions)? {
            let mut action: PendingAction = serde_json::from_value(record)?;
            let mut touched = false;

            if let Some(payload) = action.payload.as_object_mut() {
                for field in REFERENCE_FIELDS {
                    if payload.get(field).and_then(Value::as_str) == Some(synthetic) {
                        payload.insert(field.to_string(), json!(canonical));
                        touched = true;
                    }
                }
            }

            if touched {
                txn.put(Collection::PendingActions, &serde_json::to_value(&action)?)?;
                rewritten += 1;
            }
        }
        Ok(rewritten)
    }

    fn record_dropped_in(
        txn: &mut StoreTxn<'_>,
        action: PendingAction,
        reason: &str,
    ) -> SyncResult<()> {
        let mut log: Vec<DroppedAction> = txn.get_setting(DROPPED_ACTIONS_KEY)?.unwrap_or_default();
        log.push(DroppedAction {
            action,
            reason: reason.to_string(),
            dropped_at: Utc::now().timestamp_millis(),
        });
        if log.len() > DROPPED_ACTIONS_LIMIT {
            let excess = log.len() - DROPPED_ACTIONS_LIMIT;
            log.drain(..excess);
        }
        txn.set_setting(DROPPED_ACTIONS_KEY, &log)
    }
}

fn decode_all(records: Vec<Value>) -> SyncResult<Vec<PendingAction>> {
    records
        .into_iter()
        .map(|r| serde_json::from_value(r).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_queue() -> (PendingQueue, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path().join("test.redb")).unwrap();
        (PendingQueue::new(storage, DEFAULT_MAX_RETRIES), temp_dir)
    }

    #[test]
    fn test_enqueue_assigns_increasing_ids() {
        let (queue, _temp) = create_test_queue();

        let a = queue
            .enqueue(ActionKind::Create, EntityKind::Invoice, json!({"id": "offline-1-aaaaa"}))
            .unwrap();
        let b = queue
            .enqueue(ActionKind::Pay, EntityKind::Payment, json!({"invoiceId": "x"}))
            .unwrap();
        assert!(b > a);

        let listed: Vec<_> = queue.list_all().unwrap().iter().map(|a| a.sequence_id).collect();
        assert_eq!(listed, vec![a, b]);
    }

    #[test]
    fn test_new_action_defaults() {
        let (queue, _temp) = create_test_queue();

        let seq = queue
            .enqueue(ActionKind::Delete, EntityKind::Invoice, json!({"id": "inv-1"}))
            .unwrap();
        let action = queue.get(seq).unwrap().unwrap();

        assert_eq!(action.sequence_id, seq);
        assert_eq!(action.retry_count, 0);
        assert_eq!(action.last_retry_at, None);
        assert_eq!(action.depends_on, None);
        assert!(!action.idempotency_key.is_empty());
    }

    #[test]
    fn test_enqueue_after_records_dependency() {
        let (queue, _temp) = create_test_queue();

        let create = queue
            .enqueue(ActionKind::Create, EntityKind::Invoice, json!({"id": "offline-1-aaaaa"}))
            .unwrap();
        let pay = queue
            .enqueue_after(
                ActionKind::Pay,
                EntityKind::Payment,
                json!({"invoiceId": "offline-1-aaaaa"}),
                create,
            )
            .unwrap();

        let action = queue.get(pay).unwrap().unwrap();
        assert_eq!(action.depends_on, Some(create));
        assert_eq!(action.action_kind, ActionKind::Pay);
    }

    #[test]
    fn test_remove_happens_once() {
        let (queue, _temp) = create_test_queue();

        let seq = queue
            .enqueue(ActionKind::Delete, EntityKind::Invoice, json!({"id": "inv-1"}))
            .unwrap();

        assert!(queue.remove(seq).unwrap());
        assert!(!queue.remove(seq).unwrap());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_increment_retry_until_exhausted() {
        let (queue, _temp) = create_test_queue();

        let seq = queue
            .enqueue(ActionKind::UpdateStock, EntityKind::Product, json!({"id": "p1"}))
            .unwrap();

        for attempt in 1..DEFAULT_MAX_RETRIES {
            assert_eq!(
                queue.increment_retry(seq, "HTTP 503").unwrap(),
                RetryDecision::Retry(attempt)
            );
            let action = queue.get(seq).unwrap().unwrap();
            assert_eq!(action.retry_count, attempt);
            assert!(action.last_retry_at.is_some());
        }

        assert_eq!(
            queue.increment_retry(seq, "HTTP 503").unwrap(),
            RetryDecision::Exhausted(DEFAULT_MAX_RETRIES)
        );
        assert!(!queue.contains(seq).unwrap());

        let dropped = queue.dropped_actions().unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].action.sequence_id, seq);
        assert_eq!(dropped[0].reason, "HTTP 503");
    }

    #[test]
    fn test_increment_retry_on_missing_action() {
        let (queue, _temp) = create_test_queue();

        assert_eq!(queue.increment_retry(99, "timeout").unwrap(), RetryDecision::Gone);
        assert!(queue.dropped_actions().unwrap().is_empty());
    }

    #[test]
    fn test_drop_terminal_logs_once() {
        let (queue, _temp) = create_test_queue();

        let seq = queue
            .enqueue(ActionKind::Update, EntityKind::Invoice, json!({"id": "inv-1"}))
            .unwrap();
        let action = queue.get(seq).unwrap().unwrap();

        assert!(queue.drop_terminal(&action, "HTTP 422").unwrap());
        assert!(!queue.drop_terminal(&action, "HTTP 422").unwrap());
        assert_eq!(queue.dropped_actions().unwrap().len(), 1);
    }

    #[test]
    fn test_pending_invoices_and_entity_counts() {
        let (queue, _temp) = create_test_queue();

        queue
            .enqueue(ActionKind::Create, EntityKind::Invoice, json!({"id": "offline-1-aaaaa"}))
            .unwrap();
        queue
            .enqueue(ActionKind::Pay, EntityKind::Payment, json!({"invoiceId": "offline-1-aaaaa"}))
            .unwrap();
        queue
            .enqueue(ActionKind::Update, EntityKind::Invoice, json!({"id": "inv-2"}))
            .unwrap();

        assert_eq!(queue.get_pending_invoices().unwrap().len(), 2);
        assert_eq!(queue.count_by_entity(EntityKind::Payment).unwrap(), 1);
        assert_eq!(queue.count_by_entity(EntityKind::Product).unwrap(), 0);
        assert!(queue
            .find_create(EntityKind::Invoice, "offline-1-aaaaa")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_rewrite_references() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path().join("test.redb")).unwrap();
        let queue = PendingQueue::new(storage.clone(), DEFAULT_MAX_RETRIES);

        let pay = queue
            .enqueue(ActionKind::Pay, EntityKind::Payment, json!({"invoiceId": "offline-1-aaaaa", "amount": 50}))
            .unwrap();
        let other = queue
            .enqueue(ActionKind::Update, EntityKind::Invoice, json!({"id": "inv-9"}))
            .unwrap();

        let rewritten = storage
            .write(|txn| PendingQueue::rewrite_references(txn, "offline-1-aaaaa", "64f0aa"))
            .unwrap();
        assert_eq!(rewritten, 1);

        let pay = queue.get(pay).unwrap().unwrap();
        assert_eq!(pay.payload["invoiceId"], "64f0aa");
        assert_eq!(pay.payload["amount"], 50);
        let other = queue.get(other).unwrap().unwrap();
        assert_eq!(other.payload["id"], "inv-9");
    }

    #[test]
    fn test_dropped_log_is_bounded() {
        let (queue, _temp) = create_test_queue();

        for i in 0..(DROPPED_ACTIONS_LIMIT + 5) {
            let seq = queue
                .enqueue(ActionKind::Delete, EntityKind::Invoice, json!({"id": format!("inv-{}", i)}))
                .unwrap();
            let action = queue.get(seq).unwrap().unwrap();
            queue.drop_terminal(&action, "HTTP 404").unwrap();
        }

        let log = queue.dropped_actions().unwrap();
        assert_eq!(log.len(), DROPPED_ACTIONS_LIMIT);
        assert_eq!(log[0].action.payload["id"], "inv-5");
    }
}
