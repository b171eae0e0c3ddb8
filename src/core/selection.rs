//! Constrained multi-select over the merged working set
//!
//! The first selected record locks the custodian and the area. Additions that
//! disagree with either lock are rejected with a named conflict. Locks are
//! derived from the first member on demand, so an empty selection has none.

use thiserror::Error;

use crate::core::merge::MergedRecord;
use crate::core::record::{EntityRef, IndexedRecord, RecordKey};

/// An addition rejected by the selection locks
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionConflict {
    #[error("Record {key} is held by '{found}', but the selection is locked to custodian '{locked}'")]
    Custodian {
        key: String,
        locked: String,
        found: String,
    },

    #[error("Record {key} is in area '{found}', but the selection is locked to area '{locked}'")]
    Area {
        key: String,
        locked: String,
        found: String,
    },
}

impl SelectionConflict {
    /// Short machine-readable name of the conflict
    pub fn kind(&self) -> &'static str {
        match self {
            SelectionConflict::Custodian { .. } => "custodian-conflict",
            SelectionConflict::Area { .. } => "area-conflict",
        }
    }
}

/// One selected record and its per-item override
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedItem {
    pub source: String,
    pub record: IndexedRecord,
    pub override_value: Option<String>,
}

impl SelectedItem {
    fn is(&self, source: &str, key: &RecordKey) -> bool {
        self.source == source && &self.record.id == key
    }
}

/// Outcome of a toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggled {
    Added,
    Removed,
}

fn custodian_key(record: &IndexedRecord) -> Option<String> {
    record
        .custodian
        .as_deref()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
}

/// Areas compare by id; the embedded name may be a stale copy
fn area_key(record: &IndexedRecord) -> Option<String> {
    record.area.as_ref().map(|a| a.id.canonical())
}

fn display(value: Option<&str>) -> String {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("(none)")
        .to_string()
}

/// Check `candidate` against the locks taken from `anchor`
fn check_against(
    anchor: &IndexedRecord,
    candidate: &IndexedRecord,
) -> Result<(), SelectionConflict> {
    if custodian_key(anchor) != custodian_key(candidate) {
        return Err(SelectionConflict::Custodian {
            key: candidate.id.canonical(),
            locked: display(anchor.custodian.as_deref()),
            found: display(candidate.custodian.as_deref()),
        });
    }
    if area_key(anchor) != area_key(candidate) {
        let name = |r: &IndexedRecord| display(r.area.as_ref().map(|a| a.name.as_str()));
        return Err(SelectionConflict::Area {
            key: candidate.id.canonical(),
            locked: name(anchor),
            found: name(candidate),
        });
    }
    Ok(())
}

/// Ordered selection with custodian and area locks
#[derive(Debug, Clone, Default)]
pub struct SelectionSet {
    items: Vec<SelectedItem>,
}

impl SelectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[SelectedItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, source: &str, key: &RecordKey) -> bool {
        self.items.iter().any(|i| i.is(source, key))
    }

    /// Custodian every member must share, taken from the first member
    pub fn locked_custodian(&self) -> Option<&str> {
        self.items.first()?.record.custodian.as_deref()
    }

    /// Area every member must share, taken from the first member
    pub fn locked_area(&self) -> Option<&EntityRef> {
        self.items.first()?.record.area.as_ref()
    }

    /// Whether `record` could join the selection as it stands
    pub fn check(&self, record: &IndexedRecord) -> Result<(), SelectionConflict> {
        match self.items.first() {
            Some(anchor) => check_against(&anchor.record, record),
            None => Ok(()),
        }
    }

    /// Add the record, or remove it if already selected
    pub fn toggle(&mut self, item: &MergedRecord) -> Result<Toggled, SelectionConflict> {
        if let Some(index) = self
            .items
            .iter()
            .position(|i| i.is(&item.source, &item.record.id))
        {
            self.items.remove(index);
            return Ok(Toggled::Removed);
        }

        self.check(&item.record)?;
        self.items.push(SelectedItem {
            source: item.source.clone(),
            record: item.record.clone(),
            override_value: None,
        });
        Ok(Toggled::Added)
    }

    /// Add every visible record not yet selected, or none of them
    ///
    /// Returns the number of records added. The first conflicting record is
    /// reported and the selection is left as it was.
    pub fn select_all_visible(
        &mut self,
        visible: &[MergedRecord],
    ) -> Result<usize, SelectionConflict> {
        let candidates: Vec<&MergedRecord> = visible
            .iter()
            .filter(|m| !self.contains(&m.source, &m.record.id))
            .collect();

        let anchor = match (self.items.first(), candidates.first()) {
            (Some(first), _) => &first.record,
            (None, Some(first)) => &first.record,
            (None, None) => return Ok(0),
        };
        for candidate in &candidates {
            check_against(anchor, &candidate.record)?;
        }

        let added = candidates.len();
        let new_items: Vec<SelectedItem> = candidates
            .into_iter()
            .map(|m| SelectedItem {
                source: m.source.clone(),
                record: m.record.clone(),
                override_value: None,
            })
            .collect();
        self.items.extend(new_items);
        Ok(added)
    }

    /// Set or clear the override carried by one selected record
    ///
    /// Returns false if the record is not selected.
    pub fn update_per_item_override(
        &mut self,
        source: &str,
        key: &RecordKey,
        value: Option<String>,
    ) -> bool {
        match self.items.iter_mut().find(|i| i.is(source, key)) {
            Some(item) => {
                item.override_value = value.filter(|v| !v.trim().is_empty());
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Hand the selection to the batch operation it backs and empty it
    pub fn submit(&mut self) -> Vec<SelectedItem> {
        std::mem::take(&mut self.items)
    }
}
