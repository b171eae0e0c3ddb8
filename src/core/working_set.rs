//! Live merged working set
//!
//! Follows the published state of every source engine and of the exclusion
//! engine. The exclusion keys are rebuilt only when the exclusion snapshot
//! changes, and the merge is memoized on snapshot identity, so reading the
//! working set after an unrelated change costs a pointer comparison.

use std::sync::Arc;

use tokio::sync::watch;

use crate::core::engine::{SourceEngine, SourceState};
use crate::core::merge::{ExclusionConfig, ExclusionSet, MergeMemo, MergedRecord, SortSpec, SourceView};
use crate::core::record::SourceSnapshot;
use crate::core::source::SourceConfig;

struct Input {
    config: SourceConfig,
    state: watch::Receiver<SourceState>,
}

/// Merged candidate set recomputed from live engine state
pub struct WorkingSet {
    sources: Vec<Input>,
    exclusion: ExclusionConfig,
    exclusion_state: watch::Receiver<SourceState>,
    /// Exclusion snapshot the current key set was derived from
    exclusion_snapshot: Option<Arc<SourceSnapshot>>,
    exclusions: Arc<ExclusionSet>,
    memo: MergeMemo,
}

impl WorkingSet {
    pub fn new(
        sources: &[Arc<SourceEngine>],
        exclusion_engine: &SourceEngine,
        exclusion: ExclusionConfig,
    ) -> Self {
        Self {
            sources: sources
                .iter()
                .map(|engine| Input {
                    config: engine.config().clone(),
                    state: engine.watch(),
                })
                .collect(),
            exclusion,
            exclusion_state: exclusion_engine.watch(),
            exclusion_snapshot: None,
            exclusions: Arc::new(ExclusionSet::new()),
            memo: MergeMemo::new(),
        }
    }

    /// Whether any input published a new state since the last read
    pub fn has_changed(&self) -> bool {
        self.sources
            .iter()
            .map(|input| &input.state)
            .chain(std::iter::once(&self.exclusion_state))
            .any(|rx| rx.has_changed().unwrap_or(false))
    }

    /// Current exclusion keys
    pub fn exclusions(&mut self) -> Arc<ExclusionSet> {
        let snapshot = self.exclusion_state.borrow_and_update().data.clone();
        let unchanged = self
            .exclusion_snapshot
            .as_ref()
            .is_some_and(|seen| Arc::ptr_eq(seen, &snapshot));

        if !unchanged {
            self.exclusions = Arc::new(ExclusionSet::from_snapshot(&snapshot, &self.exclusion));
            self.exclusion_snapshot = Some(snapshot);
        }
        self.exclusions.clone()
    }

    /// Merged records as of the latest published snapshots
    pub fn current(&mut self, sort: Option<&SortSpec>) -> Arc<Vec<MergedRecord>> {
        let exclusions = self.exclusions();
        let views: Vec<SourceView> = self
            .sources
            .iter_mut()
            .map(|input| {
                let snapshot = input.state.borrow_and_update().data.clone();
                SourceView::new(&input.config, snapshot)
            })
            .collect();

        self.memo.merge(&views, &exclusions, sort)
    }
}
