//! Settings and sync metadata
//!
//! Settings are `{ "key": ..., "value": ... }` documents in the `settings`
//! collection. Sync metadata records live in `sync-metadata`, one per pulled
//! collection, keyed by `entityName`.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use super::{Storage, StoreTxn};
use crate::error::SyncResult;
use crate::types::{Collection, SyncMetadata};

fn setting_value<T: DeserializeOwned>(record: Option<Value>) -> SyncResult<Option<T>> {
    match record.and_then(|mut r| r.get_mut("value").map(Value::take)) {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Settings
    // ═══════════════════════════════════════════════════════════════════════

    /// Load a typed setting. Returns `None` if it was never set.
    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<T>> {
        setting_value(self.get_by_id(Collection::Settings, key)?)
    }

    /// Store a typed setting, replacing any previous value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> SyncResult<()> {
        self.write(|txn| txn.set_setting(key, value))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync Metadata
    // ═══════════════════════════════════════════════════════════════════════

    /// Metadata of the last successful pull of `entity`
    pub fn sync_metadata(&self, entity: &str) -> SyncResult<Option<SyncMetadata>> {
        match self.get_by_id(Collection::SyncMetadata, entity)? {
            Some(record) => Ok(Some(serde_json::from_value(record)?)),
            None => Ok(None),
        }
    }

    /// Metadata of every collection pulled so far
    pub fn list_sync_metadata(&self) -> SyncResult<Vec<SyncMetadata>> {
        self.get_all(Collection::SyncMetadata)?
            .into_iter()
            .map(|r| serde_json::from_value(r).map_err(Into::into))
            .collect()
    }
}

impl StoreTxn<'_> {
    /// Load a typed setting inside this transaction
    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<T>> {
        setting_value(self.get_by_id(Collection::Settings, key)?)
    }

    /// Store a typed setting inside this transaction
    pub fn set_setting<T: Serialize>(&mut self, key: &str, value: &T) -> SyncResult<()> {
        let record = json!({ "key": key, "value": serde_json::to_value(value)? });
        self.put(Collection::Settings, &record)?;
        Ok(())
    }

    /// Stamp `entity` as pulled now with `record_count` records
    pub fn record_sync_metadata(
        &mut self,
        entity: &str,
        record_count: usize,
    ) -> SyncResult<SyncMetadata> {
        let meta = SyncMetadata {
            entity_name: entity.to_string(),
            last_synced_at: Utc::now(),
            record_count,
        };
        self.put(Collection::SyncMetadata, &serde_json::to_value(&meta)?)?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path().join("test.redb")).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_settings_roundtrip_and_overwrite() {
        let (storage, _temp) = create_test_storage();

        assert_eq!(storage.get_setting::<String>("store-name").unwrap(), None);

        storage.set_setting("store-name", &"Main Street").unwrap();
        storage.set_setting("store-name", &"Harbor").unwrap();

        assert_eq!(
            storage.get_setting::<String>("store-name").unwrap(),
            Some("Harbor".to_string())
        );
    }

    #[test]
    fn test_sync_metadata_recorded_per_entity() {
        let (storage, _temp) = create_test_storage();

        assert!(storage.sync_metadata("products").unwrap().is_none());

        storage
            .write(|txn| {
                txn.record_sync_metadata("products", 10)?;
                txn.record_sync_metadata("customers", 4)
            })
            .unwrap();

        let products = storage.sync_metadata("products").unwrap().unwrap();
        assert_eq!(products.record_count, 10);
        assert_eq!(storage.list_sync_metadata().unwrap().len(), 2);
    }
}
