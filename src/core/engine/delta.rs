//! Realtime delta reducer
//!
//! Folds one change notification into a source's record set. The reducer is
//! pure: it never touches the cache or the published state, and returns
//! `Delta::Unchanged` when the notification leaves the set as it was.

use thiserror::Error;

use crate::core::record::IndexedRecord;
use crate::core::remote::{ChangeKind, ChangeNotification};
use crate::core::source::{DecodeError, SourceConfig};

/// Result of folding one notification
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Unchanged,
    Changed(Vec<IndexedRecord>),
}

/// A notification the reducer cannot apply
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("{kind} notification carries no '{side}' row")]
    MissingRow { kind: ChangeKind, side: &'static str },

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Fold `change` into `records` under `config`'s inclusion rule
pub fn reduce(
    config: &SourceConfig,
    records: &[IndexedRecord],
    change: &ChangeNotification,
) -> Result<Delta, DeltaError> {
    match change.event_type {
        ChangeKind::Insert => {
            let row = change.new.as_ref().ok_or(DeltaError::MissingRow {
                kind: ChangeKind::Insert,
                side: "new",
            })?;
            let record = config.decode(row)?;

            // A repeated insert for a key we already hold behaves like an update
            if records.iter().any(|r| r.id == record.id) {
                return Ok(upsert(config, records, record));
            }
            if !config.index_rule.matches(&record) {
                return Ok(Delta::Unchanged);
            }

            let mut next = records.to_vec();
            next.push(record);
            Ok(Delta::Changed(next))
        }
        ChangeKind::Update => {
            let row = change.new.as_ref().ok_or(DeltaError::MissingRow {
                kind: ChangeKind::Update,
                side: "new",
            })?;
            let record = config.decode(row)?;
            Ok(upsert(config, records, record))
        }
        ChangeKind::Delete => {
            // Deletes usually carry only the key columns of the old row
            let row = change
                .old
                .as_ref()
                .or(change.new.as_ref())
                .ok_or(DeltaError::MissingRow {
                    kind: ChangeKind::Delete,
                    side: "old",
                })?;
            let key = config.key_of(row)?;

            match records.iter().position(|r| r.id == key) {
                Some(index) => {
                    let mut next = records.to_vec();
                    next.remove(index);
                    Ok(Delta::Changed(next))
                }
                None => Ok(Delta::Unchanged),
            }
        }
    }
}

/// Replace, remove or append `record` depending on presence and the index rule
fn upsert(config: &SourceConfig, records: &[IndexedRecord], record: IndexedRecord) -> Delta {
    let passes = config.index_rule.matches(&record);

    match (records.iter().position(|r| r.id == record.id), passes) {
        (Some(index), true) => {
            if records[index] == record {
                return Delta::Unchanged;
            }
            let mut next = records.to_vec();
            next[index] = record;
            Delta::Changed(next)
        }
        (Some(index), false) => {
            let mut next = records.to_vec();
            next.remove(index);
            Delta::Changed(next)
        }
        // Recovers from a missed insert notification
        (None, true) => {
            let mut next = records.to_vec();
            next.push(record);
            Delta::Changed(next)
        }
        (None, false) => Delta::Unchanged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::RecordKey;
    use crate::core::source::{InclusionRule, Row};
    use serde_json::{json, Value};

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn config() -> SourceConfig {
        SourceConfig::new("inea", "public.inea_assets")
            .with_index_rule(InclusionRule::status_not("retired"))
    }

    fn fold(records: Vec<IndexedRecord>, changes: &[ChangeNotification]) -> Vec<IndexedRecord> {
        changes.iter().fold(records, |acc, change| {
            match reduce(&config(), &acc, change).unwrap() {
                Delta::Unchanged => acc,
                Delta::Changed(next) => next,
            }
        })
    }

    fn ids(records: &[IndexedRecord]) -> Vec<RecordKey> {
        records.iter().map(|r| r.id.clone()).collect()
    }

    #[test]
    fn test_insert_passing_record_appends() {
        let out = fold(
            vec![IndexedRecord::new(1)],
            &[ChangeNotification::insert(row(json!({"id": 2, "status": "active"})))],
        );
        assert_eq!(ids(&out), vec![RecordKey::Int(1), RecordKey::Int(2)]);
    }

    #[test]
    fn test_insert_excluded_record_is_ignored() {
        let change = ChangeNotification::insert(row(json!({"id": 2, "status": "retired"})));
        assert_eq!(reduce(&config(), &[], &change).unwrap(), Delta::Unchanged);
    }

    #[test]
    fn test_update_replaces_in_place() {
        let records = vec![
            IndexedRecord::new(1).with_custodian("Ana"),
            IndexedRecord::new(2),
        ];
        let out = fold(
            records,
            &[ChangeNotification::update(
                None,
                row(json!({"id": 1, "custodian": "Luis"})),
            )],
        );
        assert_eq!(ids(&out), vec![RecordKey::Int(1), RecordKey::Int(2)]);
        assert_eq!(out[0].custodian.as_deref(), Some("Luis"));
    }

    #[test]
    fn test_update_out_of_visible_set_removes() {
        let out = fold(
            vec![IndexedRecord::new(1), IndexedRecord::new(2)],
            &[ChangeNotification::update(
                None,
                row(json!({"id": 1, "status": "retired"})),
            )],
        );
        assert_eq!(ids(&out), vec![RecordKey::Int(2)]);
    }

    #[test]
    fn test_update_of_unknown_record_recovers_missed_insert() {
        let out = fold(
            vec![],
            &[ChangeNotification::update(None, row(json!({"id": 5})))],
        );
        assert_eq!(ids(&out), vec![RecordKey::Int(5)]);

        let ignored = ChangeNotification::update(None, row(json!({"id": 6, "status": "retired"})));
        assert_eq!(reduce(&config(), &[], &ignored).unwrap(), Delta::Unchanged);
    }

    #[test]
    fn test_identical_update_is_unchanged() {
        let record = IndexedRecord::new(1).with_status("active");
        let change = ChangeNotification::update(None, row(json!({"id": 1, "status": "active"})));
        assert_eq!(reduce(&config(), &[record], &change).unwrap(), Delta::Unchanged);
    }

    #[test]
    fn test_delete_absent_is_noop() {
        let change = ChangeNotification::delete(row(json!({"id": 3})));
        assert_eq!(
            reduce(&config(), &[IndexedRecord::new(1)], &change).unwrap(),
            Delta::Unchanged
        );
    }

    #[test]
    fn test_insert_update_delete_converges_to_empty() {
        let insert = ChangeNotification::insert(row(json!({"id": 7, "status": "active"})));
        let retire = ChangeNotification::update(None, row(json!({"id": 7, "status": "retired"})));
        let delete = ChangeNotification::delete(row(json!({"id": 7})));

        assert!(fold(vec![], &[insert.clone(), retire, delete.clone()]).is_empty());
        // Same result when the middle event is never observed
        assert!(fold(vec![], &[insert, delete]).is_empty());
    }

    #[test]
    fn test_malformed_notifications() {
        let no_row = ChangeNotification {
            event_type: ChangeKind::Update,
            new: None,
            old: None,
        };
        assert_eq!(
            reduce(&config(), &[], &no_row).unwrap_err(),
            DeltaError::MissingRow {
                kind: ChangeKind::Update,
                side: "new"
            }
        );

        let no_key = ChangeNotification::insert(row(json!({"status": "active"})));
        assert!(matches!(
            reduce(&config(), &[], &no_key).unwrap_err(),
            DeltaError::Decode(DecodeError::MissingPrimaryKey { .. })
        ));
    }
}
