//! Per-source configuration
//!
//! Every tracked table runs through the same engine; what differs between
//! sources lives here: the table name, how rows map onto [`IndexedRecord`],
//! and the inclusion rules applied at indexing time and at merge time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::record::{EntityRef, IndexedRecord, RecordKey};

/// A raw row as returned by the backing store
pub type Row = Map<String, Value>;

/// Inclusion predicate over records
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum InclusionRule {
    /// Every record is included
    #[default]
    All,
    /// Records whose field equals `value` (case-insensitive) are excluded
    FieldNotEq { field: String, value: String },
}

impl InclusionRule {
    /// Shorthand for the common "status is not X" rule
    pub fn status_not(value: impl Into<String>) -> Self {
        InclusionRule::FieldNotEq {
            field: "status".to_string(),
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &IndexedRecord) -> bool {
        match self {
            InclusionRule::All => true,
            InclusionRule::FieldNotEq { field, value } => match record.field(field) {
                Some(actual) => !actual.as_text().trim().eq_ignore_ascii_case(value.trim()),
                None => true,
            },
        }
    }
}

/// Filter pushed to the backing store during indexing (`column <> value`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludeClause {
    pub column: String,
    pub value: String,
}

impl ExcludeClause {
    /// Whether a raw row survives the clause; rows without the column survive
    pub fn admits(&self, row: &Row) -> bool {
        match row.get(&self.column) {
            Some(Value::String(s)) => !s.trim().eq_ignore_ascii_case(self.value.trim()),
            Some(Value::Number(n)) => n.to_string() != self.value.trim(),
            _ => true,
        }
    }
}

/// Column names feeding a reference field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefColumns {
    /// Column holding the embedded `{id, name}` object
    pub column: String,
    pub id: String,
    pub name: String,
}

impl RefColumns {
    fn named(column: &str) -> Self {
        Self {
            column: column.to_string(),
            id: "id".to_string(),
            name: "name".to_string(),
        }
    }
}

impl Default for RefColumns {
    fn default() -> Self {
        Self::named("")
    }
}

/// Mapping from row columns to typed record fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMap {
    pub primary_key: String,
    pub tag: String,
    pub description: String,
    pub status: String,
    pub value: String,
    pub custodian: String,
    pub area: RefColumns,
    pub director: RefColumns,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            primary_key: "id".to_string(),
            tag: "tag".to_string(),
            description: "description".to_string(),
            status: "status".to_string(),
            value: "value".to_string(),
            custodian: "custodian".to_string(),
            area: RefColumns::named("area"),
            director: RefColumns::named("director"),
        }
    }
}

impl FieldMap {
    /// Row column backing a record field name
    pub fn column_for<'a>(&'a self, field: &'a str) -> &'a str {
        match field {
            "id" => &self.primary_key,
            "tag" => &self.tag,
            "description" => &self.description,
            "status" => &self.status,
            "value" => &self.value,
            "custodian" => &self.custodian,
            other => other,
        }
    }
}

/// Errors decoding a row into a record
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Row is missing primary key column '{column}'")]
    MissingPrimaryKey { column: String },

    #[error("Column '{column}' has an unusable value: {message}")]
    InvalidColumn { column: String, message: String },
}

/// Configuration of one tracked source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source name, used for cache keys and merge tags
    pub name: String,

    /// Schema-qualified table name in the backing store
    pub table: String,

    #[serde(default)]
    pub fields: FieldMap,

    /// Applied at the indexing layer and by the realtime reducer
    #[serde(default)]
    pub index_rule: InclusionRule,

    /// Applied only when merging sources
    #[serde(default)]
    pub merge_rule: InclusionRule,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            fields: FieldMap::default(),
            index_rule: InclusionRule::All,
            merge_rule: InclusionRule::All,
        }
    }

    pub fn with_index_rule(mut self, rule: InclusionRule) -> Self {
        self.index_rule = rule;
        self
    }

    pub fn with_merge_rule(mut self, rule: InclusionRule) -> Self {
        self.merge_rule = rule;
        self
    }

    /// Server-side form of the index rule, in row columns
    pub fn exclude_clause(&self) -> Option<ExcludeClause> {
        match &self.index_rule {
            InclusionRule::All => None,
            InclusionRule::FieldNotEq { field, value } => Some(ExcludeClause {
                column: self.fields.column_for(field).to_string(),
                value: value.clone(),
            }),
        }
    }

    /// Extract the primary key from a raw row
    pub fn key_of(&self, row: &Row) -> Result<RecordKey, DecodeError> {
        row.get(&self.fields.primary_key)
            .and_then(RecordKey::from_value)
            .ok_or_else(|| DecodeError::MissingPrimaryKey {
                column: self.fields.primary_key.clone(),
            })
    }

    /// Decode a raw row into a record
    pub fn decode(&self, row: &Row) -> Result<IndexedRecord, DecodeError> {
        let map = &self.fields;
        let id = self.key_of(row)?;

        let text = |column: &str| -> Option<String> {
            match row.get(column) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            }
        };

        let value = match row.get(&map.value) {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => {
                Some(s.trim().parse::<f64>().map_err(|e| DecodeError::InvalidColumn {
                    column: map.value.clone(),
                    message: e.to_string(),
                })?)
            }
            Some(other) => {
                return Err(DecodeError::InvalidColumn {
                    column: map.value.clone(),
                    message: format!("expected number, got {}", other),
                })
            }
        };

        let consumed = [
            map.primary_key.as_str(),
            map.tag.as_str(),
            map.description.as_str(),
            map.status.as_str(),
            map.value.as_str(),
            map.custodian.as_str(),
            map.area.column.as_str(),
            map.director.column.as_str(),
        ];
        let fields: BTreeMap<String, Value> = row
            .iter()
            .filter(|(k, _)| !consumed.contains(&k.as_str()))
            .filter(|(_, v)| !v.is_object() && !v.is_array())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(IndexedRecord {
            id,
            tag: text(&map.tag),
            description: text(&map.description),
            status: text(&map.status),
            value,
            custodian: text(&map.custodian),
            area: decode_ref(row, &map.area),
            director: decode_ref(row, &map.director),
            fields,
        })
    }
}

/// Decode an embedded `{id, name}` object; a missing or partial object yields `None`
fn decode_ref(row: &Row, columns: &RefColumns) -> Option<EntityRef> {
    let obj = row.get(&columns.column)?.as_object()?;
    let id = obj.get(&columns.id).and_then(RecordKey::from_value)?;
    let name = obj.get(&columns.name)?.as_str()?.to_string();
    Some(EntityRef { id, name })
}
