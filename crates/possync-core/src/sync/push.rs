//! Push phase: replay queued mutations against the remote API
//!
//! Actions are attempted one at a time in `sequenceId` order. Each outcome is
//! contained to its action:
//!
//! - success: the action is removed and the server's answer is written back
//!   in the same store transaction
//! - terminal rejection: removed at once, `action-failed`
//! - retryable failure: retry budget consumed, removed with `action-failed`
//!   once exhausted
//! - dependency still queued: skipped until a later cycle, no budget consumed

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::events::{EventBus, SyncEvent};
use super::remote::{RemoteApi, RemoteResult};
use crate::error::{RemoteError, SyncResult};
use crate::queue::{PendingQueue, RetryDecision};
use crate::storage::{sequence_key, Storage};
use crate::types::{is_synthetic_id, ActionKind, Collection, EntityKind, PendingAction};

/// Tally of one push phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    /// Actions sent to the remote API
    pub attempted: usize,
    /// Replayed and removed
    pub synced: usize,
    /// Failed but still queued
    pub retried: usize,
    /// Dropped without being applied
    pub failed: usize,
    /// Skipped because a dependency is still queued
    pub deferred: usize,
}

/// Local effect of a successful replay
#[derive(Debug)]
enum Applied {
    /// Canonical invoice to store, replacing a synthetic one if set
    Invoice {
        replaces: Option<String>,
        canonical: Value,
    },
    InvoiceDeleted(String),
    Product(Value),
}

pub(crate) struct Pusher<'a> {
    pub storage: &'a Storage,
    pub queue: &'a PendingQueue,
    pub remote: &'a dyn RemoteApi,
    pub bus: &'a EventBus,
}

impl Pusher<'_> {
    /// Drain the queue once.
    ///
    /// Only store failures escape; every remote failure is handled per action.
    pub async fn run(&self) -> SyncResult<PushReport> {
        let mut report = PushReport::default();
        let listed = self.queue.list_all()?;

        if listed.is_empty() {
            debug!("No pending actions to push");
            return Ok(report);
        }
        info!(count = listed.len(), "Pushing pending actions");

        for entry in listed {
            // Reload: an earlier replay in this cycle may have rewritten it
            let Some(action) = self.queue.get(entry.sequence_id)? else {
                continue;
            };

            if self.is_blocked(&action)? {
                debug!(sequence_id = action.sequence_id, "Dependency still queued, deferring");
                report.deferred += 1;
                continue;
            }

            report.attempted += 1;
            match replay(self.remote, &action).await {
                Ok(applied) => {
                    if self.apply(&action, applied)? {
                        debug!(
                            sequence_id = action.sequence_id,
                            action = %action.action_kind,
                            entity = %action.entity_kind,
                            "Pending action synced"
                        );
                        self.bus.publish(SyncEvent::ActionSynced {
                            sequence_id: action.sequence_id,
                            action_kind: action.action_kind,
                            entity_kind: action.entity_kind,
                        });
                        report.synced += 1;
                    }
                }
                Err(err) => self.fail(&action, err, &mut report)?,
            }
        }

        Ok(report)
    }

    /// Whether a prerequisite of `action` has not been replayed yet
    fn is_blocked(&self, action: &PendingAction) -> SyncResult<bool> {
        if let Some(dep) = action.depends_on {
            if self.queue.contains(dep)? {
                return Ok(true);
            }
        }

        // Actions enqueued without an explicit dependency still must not
        // reach the server before the offline invoice they reference
        if let Some(synthetic) = synthetic_reference(action) {
            if let Some(create) = self.queue.find_create(EntityKind::Invoice, synthetic)? {
                return Ok(create.sequence_id != action.sequence_id);
            }
        }

        Ok(false)
    }

    /// Remove the action and write the server's answer locally, atomically.
    /// Returns whether the action was still queued.
    fn apply(&self, action: &PendingAction, applied: Applied) -> SyncResult<bool> {
        self.storage.write(|txn| {
            let removed =
                txn.delete(Collection::PendingActions, &sequence_key(action.sequence_id))?;

            match applied {
                Applied::Invoice {
                    replaces,
                    mut canonical,
                } => {
                    let canonical_id = canonical.get("id").and_then(Value::as_str).map(str::to_string);

                    if let (Some(synthetic), Some(canonical_id)) = (&replaces, &canonical_id) {
                        txn.delete(Collection::Invoices, synthetic)?;
                        let rewritten =
                            PendingQueue::rewrite_references(txn, synthetic, canonical_id)?;
                        info!(
                            %synthetic,
                            canonical = %canonical_id,
                            rewritten,
                            "Replaced offline invoice with canonical record"
                        );
                    }

                    if canonical_id.is_some() {
                        if let Some(obj) = canonical.as_object_mut() {
                            obj.insert("synced".to_string(), Value::Bool(true));
                        }
                        txn.put(Collection::Invoices, &canonical)?;
                    }
                }
                Applied::InvoiceDeleted(id) => {
                    txn.delete(Collection::Invoices, &id)?;
                }
                Applied::Product(product) => {
                    if product.get("id").and_then(Value::as_str).is_some() {
                        txn.put(Collection::Products, &product)?;
                    }
                }
            }

            Ok(removed)
        })
    }

    fn fail(
        &self,
        action: &PendingAction,
        err: RemoteError,
        report: &mut PushReport,
    ) -> SyncResult<()> {
        let reason = err.to_string();
        let sequence_id = action.sequence_id;

        if err.is_terminal() {
            warn!(sequence_id, %reason, "Pending action rejected, dropping");
            if self.queue.drop_terminal(action, &reason)? {
                self.publish_failed(action, action.retry_count + 1, reason, true);
                report.failed += 1;
            }
            return Ok(());
        }

        match self.queue.increment_retry(sequence_id, &reason)? {
            RetryDecision::Retry(retries) => {
                warn!(sequence_id, retries, %reason, "Pending action failed, will retry");
                report.retried += 1;
            }
            RetryDecision::Exhausted(retries) => {
                self.publish_failed(action, retries, reason, false);
                report.failed += 1;
            }
            RetryDecision::Gone => {
                debug!(sequence_id, %reason, "Failed action was removed mid-flight");
            }
        }
        Ok(())
    }

    fn publish_failed(&self, action: &PendingAction, retry_count: u32, reason: String, terminal: bool) {
        self.bus.publish(SyncEvent::ActionFailed {
            sequence_id: action.sequence_id,
            action_kind: action.action_kind,
            entity_kind: action.entity_kind,
            retry_count,
            reason,
            terminal,
        });
    }
}

/// Synthetic invoice id referenced by an action other than its own create
fn synthetic_reference(action: &PendingAction) -> Option<&str> {
    if action.creates_synthetic() {
        return None;
    }
    ["invoiceId", "id"]
        .into_iter()
        .filter_map(|field| action.payload.get(field).and_then(Value::as_str))
        .find(|id| is_synthetic_id(id))
}

/// Issue the remote call for one action
async fn replay(remote: &dyn RemoteApi, action: &PendingAction) -> RemoteResult<Applied> {
    let payload = &action.payload;

    match (action.action_kind, action.entity_kind) {
        (ActionKind::Create, EntityKind::Invoice) => {
            let local_id = action.target_id().filter(|_| action.creates_synthetic());
            let body = without(payload, &["synced"], local_id);

            let canonical = remote.create_invoice(&body, &action.idempotency_key).await?;
            if canonical.get("id").and_then(Value::as_str).is_none() {
                return Err(RemoteError::Decode("created invoice has no id".into()));
            }

            Ok(Applied::Invoice {
                replaces: local_id.map(str::to_string),
                canonical,
            })
        }
        (ActionKind::Update, EntityKind::Invoice) => {
            let id = canonical_field(payload, "id")?;
            let body = without(payload, &["id", "synced"], None);
            let canonical = remote.update_invoice(id, &body).await?;
            Ok(Applied::Invoice {
                replaces: None,
                canonical,
            })
        }
        (ActionKind::Delete, EntityKind::Invoice) => {
            let id = canonical_field(payload, "id")?;
            match remote.delete_invoice(id).await {
                // Already gone is the state we wanted
                Ok(()) | Err(RemoteError::Status { status: 404, .. }) => {
                    Ok(Applied::InvoiceDeleted(id.to_string()))
                }
                Err(e) => Err(e),
            }
        }
        (ActionKind::Pay, EntityKind::Payment | EntityKind::Invoice)
        | (ActionKind::Create, EntityKind::Payment) => {
            let field = if payload.get("invoiceId").is_some() { "invoiceId" } else { "id" };
            let invoice_id = canonical_field(payload, field)?;
            let body = without(payload, &["invoiceId", "id"], None);
            let canonical = remote.pay_invoice(invoice_id, &body).await?;
            Ok(Applied::Invoice {
                replaces: None,
                canonical,
            })
        }
        (ActionKind::UpdateStock | ActionKind::Update, EntityKind::Product) => {
            let field = if payload.get("productId").is_some() { "productId" } else { "id" };
            let product_id = canonical_field(payload, field)?;
            let body = without(payload, &["productId", "id"], None);
            let product = remote.update_stock(product_id, &body).await?;
            Ok(Applied::Product(product))
        }
        (kind, entity) => Err(RemoteError::Rejected(format!(
            "unsupported action {} on {}",
            kind, entity
        ))),
    }
}

/// A string id field that the server can resolve
fn canonical_field<'a>(payload: &'a Value, field: &str) -> RemoteResult<&'a str> {
    match payload.get(field).and_then(Value::as_str) {
        Some(id) if is_synthetic_id(id) => Err(RemoteError::Rejected(format!(
            "{} '{}' was never synced",
            field, id
        ))),
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(RemoteError::Rejected(format!("payload has no '{}'", field))),
    }
}

/// Copy of an object payload without `fields` (and `id` if it is `drop_id`)
fn without(payload: &Value, fields: &[&str], drop_id: Option<&str>) -> Value {
    let mut body: Map<String, Value> = payload.as_object().cloned().unwrap_or_default();
    for field in fields {
        body.remove(*field);
    }
    if drop_id.is_some() {
        body.remove("id");
    }
    json!(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(kind: ActionKind, entity: EntityKind, payload: Value) -> PendingAction {
        PendingAction::new(kind, entity, payload)
    }

    #[test]
    fn test_synthetic_reference() {
        let pay = action(
            ActionKind::Pay,
            EntityKind::Payment,
            json!({"invoiceId": "offline-1700000000-abc12"}),
        );
        assert_eq!(synthetic_reference(&pay), Some("offline-1700000000-abc12"));

        let create = action(
            ActionKind::Create,
            EntityKind::Invoice,
            json!({"id": "offline-1700000000-abc12"}),
        );
        assert_eq!(synthetic_reference(&create), None);

        let update = action(ActionKind::Update, EntityKind::Invoice, json!({"id": "64f0"}));
        assert_eq!(synthetic_reference(&update), None);
    }

    #[test]
    fn test_canonical_field() {
        let payload = json!({"id": "64f0", "invoiceId": "offline-1-aaaaa", "empty": ""});
        assert_eq!(canonical_field(&payload, "id").unwrap(), "64f0");
        assert!(canonical_field(&payload, "invoiceId").unwrap_err().is_terminal());
        assert!(canonical_field(&payload, "empty").unwrap_err().is_terminal());
        assert!(canonical_field(&payload, "missing").unwrap_err().is_terminal());
    }

    #[test]
    fn test_without_strips_fields() {
        let payload = json!({"id": "offline-1-aaaaa", "synced": false, "total": 10});

        let body = without(&payload, &["synced"], Some("offline-1-aaaaa"));
        assert_eq!(body, json!({"total": 10}));

        let body = without(&payload, &["synced"], None);
        assert_eq!(body, json!({"id": "offline-1-aaaaa", "total": 10}));
    }
}
