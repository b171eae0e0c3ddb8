//! Indexed record types - the rows a source snapshot is made of

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque primary key of a remote row
///
/// Sources decide whether their keys are integers or strings. Equality across
/// the two forms goes through [`RecordKey::canonical`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Int(i64),
    Text(String),
}

impl RecordKey {
    /// Build a key from a JSON value (integers and non-empty strings only)
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RecordKey::Int),
            Value::String(s) if !s.trim().is_empty() => Some(RecordKey::Text(s.trim().to_string())),
            _ => None,
        }
    }

    /// Canonical string form, shared by integer and text keys
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKey::Int(n) => write!(f, "{}", n),
            RecordKey::Text(s) => write!(f, "{}", s),
        }
    }
}

impl std::str::FromStr for RecordKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("Empty record key".to_string());
        }
        Ok(trimmed
            .parse::<i64>()
            .map(RecordKey::Int)
            .unwrap_or_else(|_| RecordKey::Text(trimmed.to_string())))
    }
}

impl From<i64> for RecordKey {
    fn from(n: i64) -> Self {
        RecordKey::Int(n)
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        RecordKey::Text(s.to_string())
    }
}

/// Denormalized snapshot of a referenced entity (area, responsible director)
///
/// This is a copy, not a pointer: it goes stale when the referenced entity is
/// renamed until propagation rewrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: RecordKey,
    pub name: String,
}

impl EntityRef {
    pub fn new(id: impl Into<RecordKey>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// One row of a source table, as held in snapshots and in the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRecord {
    pub id: RecordKey,

    /// Inventory tag printed on the asset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Status code as stored by the source (e.g. "active", "retired")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    /// Person currently holding the asset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custodian: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<EntityRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub director: Option<EntityRef>,

    /// Remaining scalar columns, preserved verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
}

impl IndexedRecord {
    /// Create a record with only a primary key set
    pub fn new(id: impl Into<RecordKey>) -> Self {
        Self {
            id: id.into(),
            tag: None,
            description: None,
            status: None,
            value: None,
            custodian: None,
            area: None,
            director: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_custodian(mut self, custodian: impl Into<String>) -> Self {
        self.custodian = Some(custodian.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_area(mut self, area: EntityRef) -> Self {
        self.area = Some(area);
        self
    }

    pub fn with_director(mut self, director: EntityRef) -> Self {
        self.director = Some(director);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Look up a field by name for filtering and sorting
    ///
    /// Typed fields answer to their own names; reference fields answer with
    /// their display name. Anything else is read from `fields`.
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "id" => Some(match &self.id {
                RecordKey::Int(n) => FieldValue::Number(*n as f64),
                RecordKey::Text(s) => FieldValue::Text(s.clone()),
            }),
            "tag" => self.tag.clone().map(FieldValue::Text),
            "description" => self.description.clone().map(FieldValue::Text),
            "status" => self.status.clone().map(FieldValue::Text),
            "value" => self.value.map(FieldValue::Number),
            "custodian" => self.custodian.clone().map(FieldValue::Text),
            "area" => self.area.as_ref().map(|a| FieldValue::Text(a.name.clone())),
            "director" => self.director.as_ref().map(|d| FieldValue::Text(d.name.clone())),
            other => self.fields.get(other).and_then(FieldValue::from_json),
        }
    }
}

/// Scalar view of a record field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Bool(bool),
}

impl FieldValue {
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(FieldValue::Text(s.clone())),
            Value::Number(n) => n.as_f64().map(FieldValue::Number),
            Value::Bool(b) => Some(FieldValue::Bool(*b)),
            _ => None,
        }
    }

    /// Text form used for equality checks in inclusion rules
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Bool(b) => b.to_string(),
        }
    }

    /// Ordering used by the merge sort: numbers numerically, text case-insensitively
    pub fn compare(&self, other: &FieldValue) -> Ordering {
        match (self, other) {
            (FieldValue::Number(a), FieldValue::Number(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a.cmp(b),
            (a, b) => a.as_text().to_lowercase().cmp(&b.as_text().to_lowercase()),
        }
    }
}

/// Complete record set for one source at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub records: Vec<IndexedRecord>,
    pub timestamp: DateTime<Utc>,
    /// False until a full index (or a fresh cache read) has produced it
    #[serde(default)]
    pub complete: bool,
}

impl SourceSnapshot {
    /// Empty, incomplete snapshot
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            timestamp: Utc::now(),
            complete: false,
        }
    }

    /// Complete snapshot built from a full record set
    pub fn complete(records: Vec<IndexedRecord>, timestamp: DateTime<Utc>) -> Self {
        Self {
            records,
            timestamp,
            complete: true,
        }
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn position(&self, key: &RecordKey) -> Option<usize> {
        self.records.iter().position(|r| &r.id == key)
    }

    pub fn get(&self, key: &RecordKey) -> Option<&IndexedRecord> {
        self.records.iter().find(|r| &r.id == key)
    }

    /// Derive the next snapshot with a new record set, keeping completeness
    pub fn with_records(&self, records: Vec<IndexedRecord>) -> Arc<SourceSnapshot> {
        Arc::new(SourceSnapshot {
            records,
            timestamp: Utc::now(),
            complete: self.complete,
        })
    }
}
