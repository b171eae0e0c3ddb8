//! Relational propagation
//!
//! Records embed a copy of their area and responsible director. When one of
//! those reference rows is renamed, every cached record holding the old copy
//! is rewritten in bounded batches, yielding between batches. Affected keys
//! are flagged as syncing before the first batch and unflagged as soon as
//! their batch lands. The backing store is never written.

use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::engine::{ReferenceKind, SourceEngine};
use crate::core::record::RecordKey;
use crate::core::remote::{ChangeFeed, ChangeKind, ChangeNotification, RemoteError, Subscription};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_YIELD_MS: u64 = 10;

fn default_id_column() -> String {
    "id".to_string()
}

fn default_name_column() -> String {
    "name".to_string()
}

/// A reference table whose renames are propagated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceTable {
    pub kind: ReferenceKind,
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_name_column")]
    pub name_column: String,
}

impl ReferenceTable {
    pub fn new(kind: ReferenceKind, table: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
            id_column: default_id_column(),
            name_column: default_name_column(),
        }
    }

    /// Extract a rename from an update notification on this table
    ///
    /// When the notification carries the old row, an unchanged name is not a
    /// rename. Without it every update is treated as a possible rename; only
    /// records holding a different name are touched either way.
    pub fn detect(&self, change: &ChangeNotification) -> Option<ReferenceChange> {
        if change.event_type != ChangeKind::Update {
            return None;
        }
        let new = change.new.as_ref()?;
        let id = new.get(&self.id_column).and_then(RecordKey::from_value)?;
        let name = new.get(&self.name_column)?.as_str()?.to_string();

        let old_name = change
            .old
            .as_ref()
            .and_then(|old| old.get(&self.name_column))
            .and_then(|v| v.as_str());
        if old_name == Some(name.as_str()) {
            return None;
        }

        Some(ReferenceChange {
            kind: self.kind,
            id,
            name,
        })
    }
}

/// A renamed reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceChange {
    pub kind: ReferenceKind,
    pub id: RecordKey,
    pub name: String,
}

/// What one propagation rewrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropagationReport {
    pub kind: ReferenceKind,
    pub id: RecordKey,
    pub name: String,
    /// Records holding a stale copy when the rename arrived
    pub affected: usize,
    /// Records actually rewritten (fewer if some changed in between)
    pub rewritten: usize,
    pub batches: usize,
}

/// Rewrites denormalized references across source engines
pub struct PropagationEngine {
    engines: Vec<Arc<SourceEngine>>,
    tables: Vec<ReferenceTable>,
    batch_size: usize,
    batch_yield: Duration,
}

impl PropagationEngine {
    pub fn new(engines: Vec<Arc<SourceEngine>>, tables: Vec<ReferenceTable>) -> Self {
        Self {
            engines,
            tables,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_yield: Duration::from_millis(DEFAULT_BATCH_YIELD_MS),
        }
    }

    pub fn with_batching(mut self, batch_size: usize, batch_yield: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.batch_yield = batch_yield;
        self
    }

    pub fn tables(&self) -> &[ReferenceTable] {
        &self.tables
    }

    /// Propagate a notification from `table`; `None` if it renames nothing
    pub async fn handle(
        &self,
        table: &str,
        change: &ChangeNotification,
    ) -> Option<PropagationReport> {
        let reference = self
            .tables
            .iter()
            .filter(|t| t.table == table)
            .find_map(|t| t.detect(change))?;
        Some(self.propagate(&reference).await)
    }

    /// Rewrite every stale copy of `change`'s reference
    pub async fn propagate(&self, change: &ReferenceChange) -> PropagationReport {
        let affected: Vec<(usize, RecordKey)> = self
            .engines
            .iter()
            .enumerate()
            .flat_map(|(index, engine)| {
                engine
                    .stale_references(change.kind, &change.id, &change.name)
                    .into_iter()
                    .map(move |key| (index, key))
            })
            .collect();

        for (index, engine) in self.engines.iter().enumerate() {
            let keys: Vec<RecordKey> = affected
                .iter()
                .filter(|(i, _)| *i == index)
                .map(|(_, k)| k.clone())
                .collect();
            engine.mark_syncing(&keys);
        }

        let batches: Vec<&[(usize, RecordKey)]> = affected.chunks(self.batch_size).collect();
        let mut rewritten = 0;

        for (n, batch) in batches.iter().enumerate() {
            if n > 0 {
                tokio::time::sleep(self.batch_yield).await;
            }

            for (index, engine) in self.engines.iter().enumerate() {
                let keys: Vec<RecordKey> = batch
                    .iter()
                    .filter(|(i, _)| *i == index)
                    .map(|(_, k)| k.clone())
                    .collect();
                if !keys.is_empty() {
                    rewritten +=
                        engine.rewrite_references(change.kind, &change.id, &change.name, &keys);
                }
            }
            debug!(
                kind = %change.kind,
                id = %change.id,
                batch = n + 1,
                records = batch.len(),
                "propagation batch applied"
            );
        }

        info!(
            kind = %change.kind,
            id = %change.id,
            name = %change.name,
            affected = affected.len(),
            batches = batches.len(),
            "reference rename propagated"
        );

        PropagationReport {
            kind: change.kind,
            id: change.id.clone(),
            name: change.name.clone(),
            affected: affected.len(),
            rewritten,
            batches: batches.len(),
        }
    }

    /// Open one change channel per reference table
    pub fn watch(&self, feed: &dyn ChangeFeed) -> Result<ReferenceWatch, RemoteError> {
        let subscriptions = self
            .tables
            .iter()
            .map(|t| feed.subscribe(&t.table))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ReferenceWatch::new(subscriptions))
    }

    /// Handle every notification already delivered to `watch`
    pub async fn apply_pending(&self, watch: &mut ReferenceWatch) -> Vec<PropagationReport> {
        let mut reports = Vec::new();
        while let Some((table, change)) = watch.try_next() {
            if let Some(report) = self.handle(&table, &change).await {
                reports.push(report);
            }
        }
        reports
    }

    /// Handle notifications until every reference channel closes
    pub async fn run(&self, mut watch: ReferenceWatch) {
        while let Some((table, change)) = watch.next().await {
            self.handle(&table, &change).await;
        }
    }
}

/// Open channels on the reference tables, released on drop
///
/// Polling starts after the channel that delivered last, so a busy table
/// cannot starve the others.
#[derive(Debug)]
pub struct ReferenceWatch {
    subscriptions: Vec<Subscription>,
    cursor: usize,
}

impl ReferenceWatch {
    fn new(subscriptions: Vec<Subscription>) -> Self {
        Self {
            subscriptions,
            cursor: 0,
        }
    }

    /// Subscription indices in polling order for this round
    fn order(&self) -> impl Iterator<Item = usize> {
        let len = self.subscriptions.len();
        let start = self.cursor;
        (0..len).map(move |n| (start + n) % len)
    }

    fn delivered(&mut self, index: usize, change: ChangeNotification) -> (String, ChangeNotification) {
        self.cursor = (index + 1) % self.subscriptions.len();
        (self.subscriptions[index].table().to_string(), change)
    }

    /// Next notification from any reference table; `None` once all are closed
    pub async fn next(&mut self) -> Option<(String, ChangeNotification)> {
        poll_fn(|cx| {
            let mut open = 0;
            for index in self.order().collect::<Vec<_>>() {
                match self.subscriptions[index].poll_recv(cx) {
                    Poll::Ready(Some(change)) => {
                        return Poll::Ready(Some(self.delivered(index, change)))
                    }
                    Poll::Ready(None) => {}
                    Poll::Pending => open += 1,
                }
            }
            if open == 0 {
                Poll::Ready(None)
            } else {
                Poll::Pending
            }
        })
        .await
    }

    /// Next already-delivered notification, if any
    pub fn try_next(&mut self) -> Option<(String, ChangeNotification)> {
        for index in self.order().collect::<Vec<_>>() {
            if let Some(change) = self.subscriptions[index].try_recv() {
                return Some(self.delivered(index, change));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::CacheStore;
    use crate::core::record::EntityRef;
    use crate::core::remote::MemoryBackend;
    use crate::core::source::{Row, SourceConfig};
    use serde_json::{json, Value};

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    async fn indexed_engine(
        backend: &MemoryBackend,
        cache: &Arc<CacheStore>,
        name: &str,
        rows: Vec<Row>,
    ) -> Arc<SourceEngine> {
        let table = format!("public.{}", name);
        backend.put_table(&table, rows);
        let engine = Arc::new(SourceEngine::new(
            SourceConfig::new(name, table),
            Arc::new(backend.clone()),
            cache.clone(),
        ));
        assert!(engine.index_all().await.is_indexed());
        engine
    }

    fn area_rows(ids: std::ops::RangeInclusive<i64>, area: i64, name: &str) -> Vec<Row> {
        ids.map(|id| row(json!({"id": id, "area": {"id": area, "name": name}})))
            .collect()
    }

    fn areas() -> ReferenceTable {
        ReferenceTable::new(ReferenceKind::Area, "public.areas")
    }

    #[test]
    fn test_detect_rename() {
        let rename = ChangeNotification::update(
            Some(row(json!({"id": 9, "name": "Finance"}))),
            row(json!({"id": 9, "name": "Treasury"})),
        );
        assert_eq!(
            areas().detect(&rename),
            Some(ReferenceChange {
                kind: ReferenceKind::Area,
                id: RecordKey::Int(9),
                name: "Treasury".to_string(),
            })
        );

        let same = ChangeNotification::update(
            Some(row(json!({"id": 9, "name": "Finance"}))),
            row(json!({"id": 9, "name": "Finance", "floor": 3})),
        );
        assert_eq!(areas().detect(&same), None);

        let insert = ChangeNotification::insert(row(json!({"id": 10, "name": "Legal"})));
        assert_eq!(areas().detect(&insert), None);

        let no_old = ChangeNotification::update(None, row(json!({"id": 9, "name": "Finance"})));
        assert!(areas().detect(&no_old).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_rename_runs_in_bounded_batches() {
        let backend = MemoryBackend::new();
        let cache = Arc::new(CacheStore::in_memory());
        let mut rows = area_rows(1..=250, 9, "Finance");
        rows.extend(area_rows(251..=260, 4, "Legal"));
        let engine = indexed_engine(&backend, &cache, "inea", rows).await;

        let propagation = PropagationEngine::new(vec![engine.clone()], vec![areas()]);
        let mut rx = engine.watch();
        let _ = rx.borrow_and_update();

        let observe = async {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let syncing = rx.borrow_and_update().syncing.len();
                seen.push(syncing);
                if syncing == 0 {
                    break;
                }
            }
            seen
        };

        let change = ReferenceChange {
            kind: ReferenceKind::Area,
            id: RecordKey::Int(9),
            name: "Treasury".to_string(),
        };
        let (report, seen) = tokio::join!(propagation.propagate(&change), observe);

        assert_eq!(report.affected, 250);
        assert_eq!(report.rewritten, 250);
        assert_eq!(report.batches, 3);
        // The UI sees the syncing set shrink one batch at a time
        assert_eq!(seen, vec![150, 50, 0]);

        let state = engine.state();
        assert!(state.syncing.is_empty());
        let renamed = state
            .data
            .records
            .iter()
            .filter(|r| r.area == Some(EntityRef::new(9, "Treasury")))
            .count();
        assert_eq!(renamed, 250);
        assert_eq!(
            state.data.get(&RecordKey::Int(255)).unwrap().area,
            Some(EntityRef::new(4, "Legal"))
        );

        // Every batch was written through
        let cached = cache.read("inea").unwrap();
        assert!(cached
            .records
            .iter()
            .filter(|r| r.area.as_ref().is_some_and(|a| a.id == RecordKey::Int(9)))
            .all(|r| r.area.as_ref().is_some_and(|a| a.name == "Treasury")));
    }

    #[tokio::test]
    async fn test_small_rename_is_one_update_across_sources() {
        let backend = MemoryBackend::new();
        let cache = Arc::new(CacheStore::in_memory());
        let inea = indexed_engine(&backend, &cache, "inea", area_rows(1..=3, 9, "Finance")).await;
        let itea = indexed_engine(&backend, &cache, "itea", area_rows(4..=5, 9, "Finance")).await;

        let propagation = PropagationEngine::new(vec![inea.clone(), itea.clone()], vec![areas()]);
        let change = ChangeNotification::update(None, row(json!({"id": 9, "name": "Treasury"})));

        let report = propagation.handle("public.areas", &change).await.unwrap();
        assert_eq!(report.affected, 5);
        assert_eq!(report.batches, 1);
        assert!(inea.state().syncing.is_empty());
        assert!(itea.state().syncing.is_empty());
        assert_eq!(
            itea.snapshot().get(&RecordKey::Int(4)).unwrap().area,
            Some(EntityRef::new(9, "Treasury"))
        );

        // Notifications from other tables are not reference renames
        assert!(propagation.handle("public.directors", &change).await.is_none());
    }

    #[tokio::test]
    async fn test_director_rename_leaves_areas_alone() {
        let backend = MemoryBackend::new();
        let cache = Arc::new(CacheStore::in_memory());
        let engine = indexed_engine(
            &backend,
            &cache,
            "inea",
            vec![row(json!({
                "id": 1,
                "area": {"id": 7, "name": "Finance"},
                "director": {"id": 7, "name": "Luis"}
            }))],
        )
        .await;

        let propagation = PropagationEngine::new(
            vec![engine.clone()],
            vec![areas(), ReferenceTable::new(ReferenceKind::Director, "public.directors")],
        );
        let change = ChangeNotification::update(None, row(json!({"id": 7, "name": "Marta"})));
        let report = propagation.handle("public.directors", &change).await.unwrap();

        assert_eq!(report.kind, ReferenceKind::Director);
        let record = engine.snapshot().get(&RecordKey::Int(1)).cloned().unwrap();
        assert_eq!(record.director, Some(EntityRef::new(7, "Marta")));
        assert_eq!(record.area, Some(EntityRef::new(7, "Finance")));
    }

    #[tokio::test]
    async fn test_watch_receives_reference_updates() {
        let backend = MemoryBackend::new();
        let cache = Arc::new(CacheStore::in_memory());
        backend.put_table("public.areas", vec![row(json!({"id": 9, "name": "Finance"}))]);
        let engine = indexed_engine(&backend, &cache, "inea", area_rows(1..=2, 9, "Finance")).await;

        let propagation = PropagationEngine::new(vec![engine.clone()], vec![areas()]);
        let mut watch = propagation.watch(&backend).unwrap();
        assert_eq!(backend.open_channels("public.areas"), 1);

        backend
            .update("public.areas", "id", row(json!({"id": 9, "name": "Treasury"})))
            .unwrap();

        let (table, change) = watch.next().await.unwrap();
        assert_eq!(table, "public.areas");
        let report = propagation.handle(&table, &change).await.unwrap();
        assert_eq!(report.affected, 2);

        backend
            .update("public.areas", "id", row(json!({"id": 9, "name": "Audit"})))
            .unwrap();
        let reports = propagation.apply_pending(&mut watch).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(
            engine.snapshot().get(&RecordKey::Int(2)).unwrap().area,
            Some(EntityRef::new(9, "Audit"))
        );

        drop(watch);
        assert_eq!(backend.open_channels("public.areas"), 0);
    }

    #[tokio::test]
    async fn test_watch_alternates_between_busy_tables() {
        let backend = MemoryBackend::new();
        let propagation = PropagationEngine::new(
            Vec::new(),
            vec![
                areas(),
                ReferenceTable::new(ReferenceKind::Director, "public.directors"),
            ],
        );
        let mut watch = propagation.watch(&backend).unwrap();

        let rename = |id: i64, name: &str| {
            ChangeNotification::update(None, row(json!({"id": id, "name": name})))
        };
        for n in 0..3 {
            backend.emit("public.areas", rename(n, "Area"));
        }
        backend.emit("public.directors", rename(1, "Luis"));
        backend.emit("public.directors", rename(2, "Eva"));

        let mut tables = Vec::new();
        for _ in 0..3 {
            tables.push(watch.next().await.unwrap().0);
        }
        while let Some((table, _)) = watch.try_next() {
            tables.push(table);
        }

        assert_eq!(
            tables,
            vec![
                "public.areas",
                "public.directors",
                "public.areas",
                "public.directors",
                "public.areas",
            ]
        );
    }
}
