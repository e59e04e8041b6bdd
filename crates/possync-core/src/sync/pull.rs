//! Pull phase: refresh the canonical read collections
//!
//! Products and customers belong to the server, so each pull replaces them
//! wholesale. Invoices are merged one by one: the pull window only covers
//! recent invoices, and local invoices still marked `synced = false` must
//! survive a snapshot that does not know about them yet.
//!
//! Each fetch is independent. A failure is logged and recorded in the
//! [`PullReport`]; the other fetches still run.

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::remote::RemoteApi;
use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::storage::{record_key, Storage};
use crate::types::Collection;

/// Tally of one pull phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    /// Products stored, `None` if the refresh failed
    pub products: Option<usize>,
    /// Customers stored, `None` if the refresh failed
    pub customers: Option<usize>,
    /// Invoices merged, `None` if the refresh failed
    pub invoices: Option<usize>,
    /// Remote invoices skipped because a local unsynced edit exists
    pub preserved_local: usize,
    /// Records without a usable id
    pub skipped_invalid: usize,
    /// One message per failed fetch
    pub errors: Vec<String>,
}

impl PullReport {
    /// Whether every fetch succeeded
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

pub(crate) struct Puller<'a> {
    pub storage: &'a Storage,
    pub remote: &'a dyn RemoteApi,
    pub config: &'a EngineConfig,
}

impl Puller<'_> {
    /// Run every fetch. Never fails as a whole.
    pub async fn run(&self) -> PullReport {
        let mut report = PullReport::default();

        match self.remote.fetch_products().await {
            Ok(records) => {
                let records = self.keyed(Collection::Products, records, &mut report);
                report.products = self.settle(
                    Collection::Products,
                    self.replace(Collection::Products, &records),
                    &mut report,
                );
            }
            Err(e) => Self::record_error(Collection::Products, e.to_string(), &mut report),
        }

        match self.remote.fetch_customers().await {
            Ok(records) => {
                let records = self.keyed(Collection::Customers, records, &mut report);
                report.customers = self.settle(
                    Collection::Customers,
                    self.replace(Collection::Customers, &records),
                    &mut report,
                );
            }
            Err(e) => Self::record_error(Collection::Customers, e.to_string(), &mut report),
        }

        let window = self.config.invoice_window_days;
        let since = Duration::try_days(window).and_then(|days| Utc::now().checked_sub_signed(days));
        match since {
            Some(since) => match self
                .remote
                .fetch_invoices(since, self.config.invoice_pull_limit)
                .await
            {
                Ok(records) => {
                    let records = self.keyed(Collection::Invoices, records, &mut report);
                    let merged = self.merge_invoices(records);
                    let merged = merged.map(|(stored, preserved)| {
                        report.preserved_local += preserved;
                        stored
                    });
                    report.invoices = self.settle(Collection::Invoices, merged, &mut report);
                }
                Err(e) => Self::record_error(Collection::Invoices, e.to_string(), &mut report),
            },
            None => Self::record_error(
                Collection::Invoices,
                format!("invoice window of {} days is out of range", window),
                &mut report,
            ),
        }

        if report.is_complete() {
            info!(
                products = ?report.products,
                customers = ?report.customers,
                invoices = ?report.invoices,
                "Pull complete"
            );
        } else {
            warn!(errors = report.errors.len(), "Pull finished with errors");
        }
        report
    }

    /// Drop records the store could not key, so one bad row does not
    /// discard the whole snapshot
    fn keyed(&self, collection: Collection, records: Vec<Value>, report: &mut PullReport) -> Vec<Value> {
        let total = records.len();
        let valid: Vec<Value> = records
            .into_iter()
            .filter(|r| record_key(collection, r).is_ok())
            .collect();

        let skipped = total - valid.len();
        if skipped > 0 {
            warn!(%collection, skipped, "Ignoring remote records without an id");
            report.skipped_invalid += skipped;
        }
        valid
    }

    fn replace(&self, collection: Collection, records: &[Value]) -> SyncResult<usize> {
        self.storage.write(|txn| {
            let stored = txn.replace_all(collection, records)?;
            txn.record_sync_metadata(collection.name(), stored)?;
            Ok(stored)
        })
    }

    /// Upsert remote invoices as synced, leaving unsynced local ones alone.
    /// Returns `(stored, preserved)`.
    fn merge_invoices(&self, records: Vec<Value>) -> SyncResult<(usize, usize)> {
        self.storage.write(|txn| {
            let mut stored = 0;
            let mut preserved = 0;

            for mut record in records {
                let Ok(id) = record_key(Collection::Invoices, &record) else {
                    continue;
                };

                let local_unsynced = txn
                    .get_by_id(Collection::Invoices, &id)?
                    .is_some_and(|local| local.get("synced") == Some(&Value::Bool(false)));
                if local_unsynced {
                    debug!(%id, "Keeping local unsynced invoice over remote copy");
                    preserved += 1;
                    continue;
                }

                if let Some(obj) = record.as_object_mut() {
                    obj.insert("synced".to_string(), Value::Bool(true));
                }
                txn.put(Collection::Invoices, &record)?;
                stored += 1;
            }

            txn.record_sync_metadata(Collection::Invoices.name(), stored)?;
            Ok((stored, preserved))
        })
    }

    fn settle(
        &self,
        collection: Collection,
        result: SyncResult<usize>,
        report: &mut PullReport,
    ) -> Option<usize> {
        match result {
            Ok(count) => {
                debug!(%collection, count, "Refreshed collection");
                Some(count)
            }
            Err(e) => {
                Self::record_error(collection, e.to_string(), report);
                None
            }
        }
    }

    fn record_error(collection: Collection, message: String, report: &mut PullReport) {
        warn!(%collection, error = %message, "Pull failed for collection");
        report.errors.push(format!("{}: {}", collection, message));
    }
}
