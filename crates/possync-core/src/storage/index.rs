//! Secondary index maintenance.
//!
//! An index entry maps `"<field>\x1f<compact json of value>"` to the primary
//! key of every record carrying that value. Encoding the value as JSON keeps
//! `true`, `"true"` and `1` distinct. Missing and `null` fields are not
//! indexed.

use crate::error::SyncResult;
use crate::types::Collection;
use redb::MultimapTable;
use serde_json::Value;

const SEPARATOR: char = '\u{1f}';

/// Lookup key for `field == value`
pub(crate) fn entry_key(field: &str, value: &Value) -> String {
    format!("{}{}{}", field, SEPARATOR, value)
}

fn indexed_values<'r>(
    collection: Collection,
    record: &'r Value,
) -> impl Iterator<Item = (&'static str, &'r Value)> {
    collection
        .indexes()
        .iter()
        .filter_map(move |field| match record.get(*field) {
            Some(Value::Null) | None => None,
            Some(value) => Some((*field, value)),
        })
}

pub(crate) fn insert_entries(
    index: &mut MultimapTable<'_, &'static str, &'static str>,
    collection: Collection,
    key: &str,
    record: &Value,
) -> SyncResult<()> {
    for (field, value) in indexed_values(collection, record) {
        index.insert(entry_key(field, value).as_str(), key)?;
    }
    Ok(())
}

pub(crate) fn remove_entries(
    index: &mut MultimapTable<'_, &'static str, &'static str>,
    collection: Collection,
    key: &str,
    record: &Value,
) -> SyncResult<()> {
    for (field, value) in indexed_values(collection, record) {
        index.remove(entry_key(field, value).as_str(), key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_key_distinguishes_types() {
        assert_ne!(entry_key("synced", &json!(true)), entry_key("synced", &json!("true")));
        assert_ne!(entry_key("tier", &json!(1)), entry_key("tier", &json!("1")));
    }

    #[test]
    fn test_null_and_missing_fields_are_skipped() {
        let record = json!({"id": "c1", "phone": null});
        let fields: Vec<_> = indexed_values(Collection::Customers, &record)
            .map(|(f, _)| f)
            .collect();
        assert!(fields.is_empty());

        let record = json!({"id": "c1", "phone": "555", "tier": "gold"});
        let fields: Vec<_> = indexed_values(Collection::Customers, &record)
            .map(|(f, _)| f)
            .collect();
        assert_eq!(fields, vec!["phone", "tier"]);
    }
}
