//! Persistent local store using redb.
//!
//! Every [`Collection`] is a redb table of JSON documents keyed by the
//! collection's key field, paired with a multimap table holding its secondary
//! indices (`"<field>\x1f<json value>" → primary key`).
//!
//! Writes made through a single call are one redb transaction, so a bulk put
//! lands entirely or not at all. [`Storage::write`] exposes the same
//! transaction to callers that must touch several collections at once.

use crate::error::{SyncError, SyncResult};
use crate::types::Collection;
use parking_lot::RwLock;
use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable,
    ReadableTableMetadata, TableDefinition, WriteTransaction,
};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// Submodules
mod index;
mod settings;

/// Schema version compiled into this build.
///
/// Bumps are additive: a newer version may add collections or indices but
/// never rewrites stored records.
pub const SCHEMA_VERSION: u64 = 1;

// Bookkeeping table (schema version, sequence counters)
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");
const SCHEMA_VERSION_KEY: &str = "schema_version";

// Record tables
const PRODUCTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("products");
const CUSTOMERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("customers");
const INVOICES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("invoices");
const PENDING_ACTIONS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("pending-actions");
const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");
const SYNC_METADATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sync-metadata");

// Index tables
const PRODUCTS_INDEX: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("products_index");
const CUSTOMERS_INDEX: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("customers_index");
const INVOICES_INDEX: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("invoices_index");
const PENDING_ACTIONS_INDEX: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("pending-actions_index");
const SETTINGS_INDEX: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("settings_index");
const SYNC_METADATA_INDEX: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("sync-metadata_index");

fn records_table(collection: Collection) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match collection {
        Collection::Products => PRODUCTS_TABLE,
        Collection::Customers => CUSTOMERS_TABLE,
        Collection::Invoices => INVOICES_TABLE,
        Collection::PendingActions => PENDING_ACTIONS_TABLE,
        Collection::Settings => SETTINGS_TABLE,
        Collection::SyncMetadata => SYNC_METADATA_TABLE,
    }
}

fn index_table(
    collection: Collection,
) -> MultimapTableDefinition<'static, &'static str, &'static str> {
    match collection {
        Collection::Products => PRODUCTS_INDEX,
        Collection::Customers => CUSTOMERS_INDEX,
        Collection::Invoices => INVOICES_INDEX,
        Collection::PendingActions => PENDING_ACTIONS_INDEX,
        Collection::Settings => SETTINGS_INDEX,
        Collection::SyncMetadata => SYNC_METADATA_INDEX,
    }
}

/// Storage key for an auto-assigned sequence number.
///
/// Zero-padded so lexicographic key order matches numeric order.
pub fn sequence_key(seq: u64) -> String {
    format!("{:020}", seq)
}

fn sequence_counter_key(collection: Collection) -> String {
    format!("{}.next_seq", collection.name())
}

fn invalid(collection: Collection, reason: impl Into<String>) -> SyncError {
    SyncError::InvalidRecord {
        collection: collection.name(),
        reason: reason.into(),
    }
}

/// Extract the storage key of a record
pub(crate) fn record_key(collection: Collection, record: &Value) -> SyncResult<String> {
    let obj = record
        .as_object()
        .ok_or_else(|| invalid(collection, "record must be a JSON object"))?;
    let field = collection.key_field();

    match obj.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(seq) if collection.is_auto_keyed() => Ok(sequence_key(seq)),
            _ => Ok(n.to_string()),
        },
        _ => Err(invalid(collection, format!("missing key field '{}'", field))),
    }
}

/// Map a caller-facing id to its storage key (`"7"` → padded for auto keys)
fn normalize_id(collection: Collection, id: &str) -> String {
    match id.parse::<u64>() {
        Ok(seq) if collection.is_auto_keyed() => sequence_key(seq),
        _ => id.to_string(),
    }
}

fn check_index(collection: Collection, index: &str) -> SyncResult<()> {
    if collection.indexes().contains(&index) {
        Ok(())
    } else {
        Err(SyncError::UnknownIndex {
            collection: collection.name(),
            index: index.to_string(),
        })
    }
}

fn read_one<T>(table: &T, id: &str) -> SyncResult<Option<Value>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(id)? {
        Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        None => Ok(None),
    }
}

fn read_all<T>(table: &T) -> SyncResult<Vec<Value>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut records = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        records.push(serde_json::from_slice(value.value())?);
    }
    Ok(records)
}

fn read_indexed<T, I>(table: &T, index: &I, lookup: &str) -> SyncResult<Vec<Value>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
    I: ReadableMultimapTable<&'static str, &'static str>,
{
    let mut records = Vec::new();
    for key in index.get(lookup)? {
        let key = key?;
        if let Some(record) = read_one(table, key.value())? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Local store using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Open (or create) the local store at the given path.
    ///
    /// This will:
    /// - Create the parent directory if it doesn't exist
    /// - Create every collection and index table when the stored schema
    ///   version is absent or older than [`SCHEMA_VERSION`]
    /// - Record the running schema version
    ///
    /// Opening an up-to-date store touches nothing. A store written by a newer
    /// build fails with [`SyncError::SchemaMismatch`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let stored = meta.get(SCHEMA_VERSION_KEY)?.map(|v| v.value());

            match stored {
                Some(stored) if stored > SCHEMA_VERSION => {
                    return Err(SyncError::SchemaMismatch {
                        stored: stored as u32,
                        running: SCHEMA_VERSION as u32,
                    });
                }
                Some(stored) if stored == SCHEMA_VERSION => {
                    debug!(version = stored, "Local store schema up to date");
                }
                stored => {
                    for collection in Collection::ALL {
                        let _ = write_txn.open_table(records_table(collection))?;
                        let _ = write_txn.open_multimap_table(index_table(collection))?;
                    }
                    meta.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION)?;
                    info!(
                        from = ?stored,
                        to = SCHEMA_VERSION,
                        "Initialized local store schema"
                    );
                }
            }
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Schema version recorded in the database
    pub fn schema_version(&self) -> SyncResult<u64> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let meta = read_txn.open_table(META_TABLE)?;
        Ok(meta.get(SCHEMA_VERSION_KEY)?.map(|v| v.value()).unwrap_or(0))
    }

    /// Run `f` inside one write transaction.
    ///
    /// Everything `f` writes, across any number of collections, commits
    /// together when it returns `Ok` and is discarded when it returns `Err`.
    pub fn write<T>(&self, f: impl FnOnce(&mut StoreTxn<'_>) -> SyncResult<T>) -> SyncResult<T> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;

        let result = {
            let mut txn = StoreTxn { txn: &write_txn };
            f(&mut txn)
        };

        match result {
            Ok(value) => {
                write_txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                write_txn.abort()?;
                Err(e)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Record Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert or overwrite a single record. Returns its storage key.
    pub fn put(&self, collection: Collection, record: &Value) -> SyncResult<String> {
        self.write(|txn| txn.put(collection, record))
    }

    /// Insert or overwrite many records atomically
    pub fn put_all(&self, collection: Collection, records: &[Value]) -> SyncResult<usize> {
        self.write(|txn| {
            for record in records {
                txn.put(collection, record)?;
            }
            Ok(records.len())
        })
    }

    /// Clear a collection and bulk insert `records` in one transaction
    pub fn replace_all(&self, collection: Collection, records: &[Value]) -> SyncResult<usize> {
        self.write(|txn| txn.replace_all(collection, records))
    }

    /// Load every record in a collection, ordered by key
    pub fn get_all(&self, collection: Collection) -> SyncResult<Vec<Value>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(records_table(collection))?;
        read_all(&table)
    }

    /// Load the records of a collection matching `predicate`
    pub fn get_all_where(
        &self,
        collection: Collection,
        predicate: impl Fn(&Value) -> bool,
    ) -> SyncResult<Vec<Value>> {
        Ok(self
            .get_all(collection)?
            .into_iter()
            .filter(|r| predicate(r))
            .collect())
    }

    /// Load a single record by primary key.
    ///
    /// Returns `None` if no record with the given key exists.
    pub fn get_by_id(&self, collection: Collection, id: &str) -> SyncResult<Option<Value>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(records_table(collection))?;
        read_one(&table, &normalize_id(collection, id))
    }

    /// Load every record whose `index` field equals `value`
    pub fn get_by_index(
        &self,
        collection: Collection,
        index: &str,
        value: &Value,
    ) -> SyncResult<Vec<Value>> {
        check_index(collection, index)?;

        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(records_table(collection))?;
        let idx = read_txn.open_multimap_table(index_table(collection))?;
        read_indexed(&table, &idx, &index::entry_key(index, value))
    }

    /// Delete a record. Returns whether it existed.
    pub fn delete(&self, collection: Collection, id: &str) -> SyncResult<bool> {
        self.write(|txn| txn.delete(collection, id))
    }

    /// Remove every record of a collection. Returns how many were removed.
    pub fn clear(&self, collection: Collection) -> SyncResult<usize> {
        self.write(|txn| txn.clear(collection))
    }

    /// Number of records in a collection
    pub fn count(&self, collection: Collection) -> SyncResult<usize> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(records_table(collection))?;
        Ok(table.len()? as usize)
    }
}

/// Handle to an open write transaction; see [`Storage::write`]
pub struct StoreTxn<'a> {
    txn: &'a WriteTransaction,
}

impl StoreTxn<'_> {
    /// Insert or overwrite a record, keeping its index entries in step
    pub fn put(&mut self, collection: Collection, record: &Value) -> SyncResult<String> {
        let key = record_key(collection, record)?;
        let bytes = serde_json::to_vec(record)?;

        let mut table = self.txn.open_table(records_table(collection))?;
        let mut idx = self.txn.open_multimap_table(index_table(collection))?;

        let previous = table
            .insert(key.as_str(), bytes.as_slice())?
            .map(|old| old.value().to_vec());
        if let Some(previous) = previous {
            let previous: Value = serde_json::from_slice(&previous)?;
            index::remove_entries(&mut idx, collection, &key, &previous)?;
        }
        index::insert_entries(&mut idx, collection, &key, record)?;

        Ok(key)
    }

    /// Insert a record under the next sequence number of an auto-keyed
    /// collection. Sequence numbers are never reused.
    pub fn insert_auto(&mut self, collection: Collection, mut record: Value) -> SyncResult<u64> {
        if !collection.is_auto_keyed() {
            return Err(SyncError::InvalidOperation(format!(
                "{} does not assign keys",
                collection
            )));
        }

        let seq = {
            let mut meta = self.txn.open_table(META_TABLE)?;
            let counter = sequence_counter_key(collection);
            let next = meta.get(counter.as_str())?.map(|v| v.value()).unwrap_or(0) + 1;
            meta.insert(counter.as_str(), next)?;
            next
        };

        record
            .as_object_mut()
            .ok_or_else(|| invalid(collection, "record must be a JSON object"))?
            .insert(collection.key_field().to_string(), Value::from(seq));
        self.put(collection, &record)?;

        Ok(seq)
    }

    /// Load a record by primary key, seeing this transaction's writes
    pub fn get_by_id(&self, collection: Collection, id: &str) -> SyncResult<Option<Value>> {
        let table = self.txn.open_table(records_table(collection))?;
        read_one(&table, &normalize_id(collection, id))
    }

    /// Load every record of a collection, seeing this transaction's writes
    pub fn get_all(&self, collection: Collection) -> SyncResult<Vec<Value>> {
        let table = self.txn.open_table(records_table(collection))?;
        read_all(&table)
    }

    /// Delete a record and its index entries. Returns whether it existed.
    pub fn delete(&mut self, collection: Collection, id: &str) -> SyncResult<bool> {
        let key = normalize_id(collection, id);

        let mut table = self.txn.open_table(records_table(collection))?;
        let removed = table.remove(key.as_str())?.map(|old| old.value().to_vec());

        match removed {
            Some(bytes) => {
                let old: Value = serde_json::from_slice(&bytes)?;
                let mut idx = self.txn.open_multimap_table(index_table(collection))?;
                index::remove_entries(&mut idx, collection, &key, &old)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop every record and index entry of a collection
    pub fn clear(&mut self, collection: Collection) -> SyncResult<usize> {
        let count = {
            let table = self.txn.open_table(records_table(collection))?;
            table.len()? as usize
        };

        self.txn.delete_table(records_table(collection))?;
        self.txn.delete_multimap_table(index_table(collection))?;
        let _ = self.txn.open_table(records_table(collection))?;
        let _ = self.txn.open_multimap_table(index_table(collection))?;

        Ok(count)
    }

    /// Clear a collection and put `records` in its place
    pub fn replace_all(&mut self, collection: Collection, records: &[Value]) -> SyncResult<usize> {
        self.clear(collection)?;
        for record in records {
            self.put(collection, record)?;
        }
        Ok(records.len())
    }
}
