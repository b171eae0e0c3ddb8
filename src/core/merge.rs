//! Cross-source merge and filter
//!
//! Combines the snapshots of several sources into one candidate working set.
//! Each source keeps its own merge-time inclusion rule; records already taken
//! by the exclusion source are removed; the result is stable-sorted on the
//! requested field.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::record::{FieldValue, IndexedRecord, RecordKey, SourceSnapshot};
use crate::core::source::{InclusionRule, SourceConfig};

/// Where exclusion keys come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionConfig {
    /// Source whose records mark candidate keys as taken
    pub source: SourceConfig,

    /// Field of the exclusion record holding the taken key
    pub key_field: String,

    /// Only records passing this rule take a key (e.g. folios that are still open)
    #[serde(default)]
    pub active_rule: InclusionRule,
}

/// Keys that must be removed from the merged set
///
/// Keys are held in canonical string form so that `2` and `"2"` match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    keys: BTreeSet<String>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the taken keys from the exclusion source's current snapshot
    pub fn from_snapshot(snapshot: &SourceSnapshot, config: &ExclusionConfig) -> Self {
        let keys = snapshot
            .records
            .iter()
            .filter(|r| config.active_rule.matches(r))
            .filter_map(|r| r.field(&config.key_field))
            .map(|v| v.as_text().trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keys }
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.keys.contains(&key.canonical())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<K: Into<RecordKey>> FromIterator<K> for ExclusionSet {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().map(|k| k.into().canonical()).collect(),
        }
    }
}

/// One source's contribution to a merge
#[derive(Debug, Clone)]
pub struct SourceView {
    pub name: String,
    pub rule: InclusionRule,
    pub snapshot: Arc<SourceSnapshot>,
}

impl SourceView {
    pub fn new(config: &SourceConfig, snapshot: Arc<SourceSnapshot>) -> Self {
        Self {
            name: config.name.clone(),
            rule: config.merge_rule.clone(),
            snapshot,
        }
    }
}

/// A record tagged with the source it came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRecord {
    pub source: String,
    #[serde(flatten)]
    pub record: IndexedRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Field and direction for the merged ordering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }

    /// Records missing the field sort last in either direction
    fn compare(&self, a: &IndexedRecord, b: &IndexedRecord) -> Ordering {
        match (a.field(&self.field), b.field(&self.field)) {
            (Some(x), Some(y)) => {
                let ord = x.compare(&y);
                match self.direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                }
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

/// Merge source snapshots into one filtered, tagged, sorted working set
pub fn merge(
    sources: &[SourceView],
    exclusions: &ExclusionSet,
    sort: Option<&SortSpec>,
) -> Vec<MergedRecord> {
    let mut merged: Vec<MergedRecord> = sources
        .iter()
        .flat_map(|view| {
            view.snapshot
                .records
                .iter()
                .filter(|r| view.rule.matches(r))
                .map(|r| MergedRecord {
                    source: view.name.clone(),
                    record: r.clone(),
                })
        })
        .filter(|m| !exclusions.contains(&m.record.id))
        .collect();

    if let Some(spec) = sort {
        // sort_by is stable: equal keys keep source order
        merged.sort_by(|a, b| spec.compare(&a.record, &b.record));
    }
    merged
}

/// Case-insensitive text match over the fields a list view shows
pub fn matches_query(record: &MergedRecord, query: &str) -> bool {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    ["tag", "description", "custodian", "area", "director", "status"]
        .iter()
        .filter_map(|f| record.record.field(f))
        .map(|v: FieldValue| v.as_text().to_lowercase())
        .any(|text| text.contains(&needle))
}

struct MemoKey {
    sources: Vec<(String, Arc<SourceSnapshot>)>,
    exclusions: Arc<ExclusionSet>,
    sort: Option<SortSpec>,
}

impl MemoKey {
    fn same_inputs(
        &self,
        sources: &[SourceView],
        exclusions: &Arc<ExclusionSet>,
        sort: Option<&SortSpec>,
    ) -> bool {
        self.sources.len() == sources.len()
            && self
                .sources
                .iter()
                .zip(sources)
                .all(|((name, snap), view)| {
                    name == &view.name && Arc::ptr_eq(snap, &view.snapshot)
                })
            && Arc::ptr_eq(&self.exclusions, exclusions)
            && self.sort.as_ref() == sort
    }
}

/// Remembers the last merge, keyed on the identity of its inputs
///
/// Snapshots are never mutated in place, so an unchanged `Arc` means an
/// unchanged input.
#[derive(Default)]
pub struct MergeMemo {
    last: Option<(MemoKey, Arc<Vec<MergedRecord>>)>,
}

impl MergeMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(
        &mut self,
        sources: &[SourceView],
        exclusions: &Arc<ExclusionSet>,
        sort: Option<&SortSpec>,
    ) -> Arc<Vec<MergedRecord>> {
        if let Some((key, merged)) = &self.last {
            if key.same_inputs(sources, exclusions, sort) {
                return merged.clone();
            }
        }

        let merged = Arc::new(merge(sources, exclusions, sort));
        let key = MemoKey {
            sources: sources
                .iter()
                .map(|v| (v.name.clone(), v.snapshot.clone()))
                .collect(),
            exclusions: exclusions.clone(),
            sort: sort.cloned(),
        };
        self.last = Some((key, merged.clone()));
        merged
    }
}
