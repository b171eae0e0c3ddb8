//! Generic per-source indexing engine
//!
//! One `SourceEngine` is instantiated per tracked table. It owns the source's
//! published read model and is the only writer of that source's cache entry:
//! - on activation it reads the cache if fresh, otherwise runs the full indexer
//! - once ready it opens the change channel and folds notifications in
//! - every mutation publishes a new `Arc<SourceSnapshot>` and writes it through
//!
//! Consumers observe state through a `watch` channel, so they always see
//! either the previous or the next snapshot, never a partial one.

mod delta;
mod indexer;
mod live;

pub use delta::{reduce, Delta, DeltaError};
pub use indexer::{IndexError, IndexOutcome};
pub use live::LiveSource;

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::cache::CacheStore;
use crate::core::record::{EntityRef, IndexedRecord, RecordKey, SourceSnapshot};
use crate::core::remote::{has_session, ChangeFeed, ChangeNotification, RemoteStore, SessionGate};
use crate::core::source::SourceConfig;

/// Rows requested per page by the full indexer
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Lifecycle phase of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    /// Session gate said no; nothing runs until the next activation
    Idle,
    Indexing,
    Ready,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Uninitialized => write!(f, "uninitialized"),
            Phase::Idle => write!(f, "idle"),
            Phase::Indexing => write!(f, "indexing"),
            Phase::Ready => write!(f, "ready"),
        }
    }
}

/// Whether the source currently holds an open change channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeStatus {
    Disconnected,
    Subscribed,
}

/// Which embedded reference a propagation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Area,
    Director,
}

impl ReferenceKind {
    pub fn of(self, record: &IndexedRecord) -> Option<&EntityRef> {
        match self {
            ReferenceKind::Area => record.area.as_ref(),
            ReferenceKind::Director => record.director.as_ref(),
        }
    }

    fn of_mut(self, record: &mut IndexedRecord) -> Option<&mut EntityRef> {
        match self {
            ReferenceKind::Area => record.area.as_mut(),
            ReferenceKind::Director => record.director.as_mut(),
        }
    }
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceKind::Area => write!(f, "area"),
            ReferenceKind::Director => write!(f, "director"),
        }
    }
}

/// Read model exposed to the presentation layer
#[derive(Debug, Clone)]
pub struct SourceState {
    pub phase: Phase,
    pub data: Arc<SourceSnapshot>,
    pub is_indexing: bool,
    pub is_complete: bool,
    /// Records fetched so far in the current (or last) indexing run
    pub progress: usize,
    /// Estimated total for the current (or last) indexing run
    pub total: usize,
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub realtime: RealtimeStatus,
    /// Records whose embedded references are being rewritten
    pub syncing: BTreeSet<RecordKey>,
}

impl SourceState {
    fn initial() -> Self {
        Self {
            phase: Phase::Uninitialized,
            data: Arc::new(SourceSnapshot::empty()),
            is_indexing: false,
            is_complete: false,
            progress: 0,
            total: 0,
            error: None,
            last_updated: None,
            realtime: RealtimeStatus::Disconnected,
            syncing: BTreeSet::new(),
        }
    }

    /// Fraction of the estimated total fetched so far, in `0.0..=1.0`
    pub fn progress_ratio(&self) -> f64 {
        if self.total == 0 {
            return if self.is_complete { 1.0 } else { 0.0 };
        }
        (self.progress as f64 / self.total as f64).min(1.0)
    }
}

/// Outcome of applying one change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Unchanged,
    /// Malformed notification, logged and discarded
    Dropped,
}

/// Indexing, caching and realtime engine for one source
pub struct SourceEngine {
    config: SourceConfig,
    remote: Arc<dyn RemoteStore>,
    cache: Arc<CacheStore>,
    page_size: usize,
    state: watch::Sender<SourceState>,
    indexing: AtomicBool,
    /// Notifications applied while a full index is in flight
    queued: Mutex<Vec<ChangeNotification>>,
}

impl SourceEngine {
    pub fn new(config: SourceConfig, remote: Arc<dyn RemoteStore>, cache: Arc<CacheStore>) -> Self {
        let (state, _) = watch::channel(SourceState::initial());
        Self {
            config,
            remote,
            cache,
            page_size: DEFAULT_PAGE_SIZE,
            state,
            indexing: AtomicBool::new(false),
            queued: Mutex::new(Vec::new()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current read model
    pub fn state(&self) -> SourceState {
        self.state.borrow().clone()
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<SourceSnapshot> {
        self.state.borrow().data.clone()
    }

    /// Receiver notified on every state change
    pub fn watch(&self) -> watch::Receiver<SourceState> {
        self.state.subscribe()
    }

    /// Adopt the cached snapshot if one is fresh
    pub fn load_cached(&self) -> bool {
        let Some(snapshot) = self.cache.read(self.name()) else {
            return false;
        };

        let count = snapshot.count();
        let saved_at = snapshot.timestamp;
        self.state.send_modify(|s| {
            s.data = Arc::new(snapshot);
            s.phase = Phase::Ready;
            s.is_complete = true;
            s.error = None;
            s.progress = count;
            s.total = count;
            s.last_updated = Some(saved_at);
        });
        debug!(source = self.name(), records = count, "loaded snapshot from cache");
        true
    }

    /// Bring the source to `Ready` and open its change channel
    ///
    /// Returns `None` when there is no session, when indexing failed, or when
    /// the channel could not be opened; the reason is left in the state.
    pub async fn activate(
        self: &Arc<Self>,
        session: &dyn SessionGate,
        feed: &dyn ChangeFeed,
    ) -> Option<LiveSource> {
        if !has_session(session).await {
            self.state.send_modify(|s| s.phase = Phase::Idle);
            debug!(source = self.name(), "no session; source stays idle");
            return None;
        }

        if !self.load_cached() {
            match self.index_all().await {
                IndexOutcome::Indexed { .. } => {}
                IndexOutcome::AlreadyRunning | IndexOutcome::Failed(_) => return None,
            }
        }

        match feed.subscribe(&self.config.table) {
            Ok(subscription) => Some(LiveSource::new(self.clone(), subscription)),
            Err(e) => {
                warn!(source = self.name(), error = %e, "failed to open change channel");
                self.state
                    .send_modify(|s| s.error = Some(format!("Realtime unavailable: {}", e)));
                None
            }
        }
    }

    /// Drop the cache entry and rebuild from the backing store
    pub async fn reindex(&self) -> IndexOutcome {
        if self.is_indexing() {
            return IndexOutcome::AlreadyRunning;
        }
        self.cache.clear(self.name());
        self.index_all().await
    }

    /// Drop the cache entry and reset to an empty, incomplete snapshot
    pub fn clear_cache(&self) {
        self.cache.clear(self.name());
        self.state.send_modify(|s| {
            let realtime = s.realtime;
            *s = SourceState::initial();
            s.realtime = realtime;
        });
        info!(source = self.name(), "cache cleared");
    }

    /// Fold one change notification into the snapshot and write it through
    ///
    /// While a full index runs the change is also queued, and replayed onto
    /// the fetched rows before they are published.
    pub fn apply_change(&self, change: &ChangeNotification) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::Unchanged;

        self.state.send_if_modified(|s| {
            let delta = match reduce(&self.config, &s.data.records, change) {
                Ok(delta) => delta,
                Err(e) => {
                    warn!(
                        source = self.name(),
                        event = %change.event_type,
                        error = %e,
                        "dropping malformed change notification"
                    );
                    outcome = ApplyOutcome::Dropped;
                    return false;
                }
            };

            // Pages already read may predate this change
            if self.is_indexing() {
                self.queued().push(change.clone());
            }

            match delta {
                Delta::Unchanged => false,
                Delta::Changed(records) => {
                    let next = s.data.with_records(records);
                    // An incomplete snapshot must never be persisted as if it were whole
                    if next.complete {
                        self.cache.write(self.name(), &next);
                    }
                    s.last_updated = Some(next.timestamp);
                    s.data = next;
                    outcome = ApplyOutcome::Applied;
                    true
                }
            }
        });

        outcome
    }

    /// Keys of records embedding reference `id` under a name other than `name`
    pub fn stale_references(&self, kind: ReferenceKind, id: &RecordKey, name: &str) -> Vec<RecordKey> {
        self.snapshot()
            .records
            .iter()
            .filter(|r| kind.of(r).is_some_and(|e| &e.id == id && e.name != name))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Flag records as being synchronized
    pub fn mark_syncing(&self, keys: &[RecordKey]) {
        if keys.is_empty() {
            return;
        }
        self.state.send_modify(|s| s.syncing.extend(keys.iter().cloned()));
    }

    /// Rewrite the embedded reference on `keys` in one state update
    ///
    /// Clears the syncing mark of every key in the batch. Returns the number
    /// of records rewritten.
    pub fn rewrite_references(
        &self,
        kind: ReferenceKind,
        id: &RecordKey,
        name: &str,
        keys: &[RecordKey],
    ) -> usize {
        let batch: BTreeSet<&RecordKey> = keys.iter().collect();
        let mut rewritten = 0;

        self.state.send_modify(|s| {
            let mut records = s.data.records.clone();
            for record in records.iter_mut().filter(|r| batch.contains(&r.id)) {
                if let Some(reference) = kind.of_mut(record) {
                    if &reference.id == id && reference.name != name {
                        reference.name = name.to_string();
                        rewritten += 1;
                    }
                }
            }

            if rewritten > 0 {
                let next = s.data.with_records(records);
                if next.complete {
                    self.cache.write(self.name(), &next);
                }
                s.last_updated = Some(next.timestamp);
                s.data = next;
            }
            s.syncing.retain(|k| !batch.contains(k));
        });

        rewritten
    }

    pub fn is_indexing(&self) -> bool {
        self.indexing.load(std::sync::atomic::Ordering::Acquire)
    }

    fn queued(&self) -> MutexGuard<'_, Vec<ChangeNotification>> {
        self.queued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_realtime(&self, status: RealtimeStatus) {
        self.state.send_modify(|s| s.realtime = status);
    }
}

#[cfg(test)]
mod tests;
