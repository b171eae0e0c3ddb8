use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use super::*;
use crate::core::record::EntityRef;
use crate::core::remote::{MemoryBackend, PageRequest, RemoteError, StaticSession};
use crate::core::source::{ExcludeClause, InclusionRule, Row};

const TABLE: &str = "public.inea_assets";

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn asset_rows(count: i64) -> Vec<Row> {
    (1..=count)
        .map(|id| {
            row(json!({
                "id": id,
                "tag": format!("INV-{:04}", id),
                "status": if id % 10 == 0 { "retired" } else { "active" },
                "custodian": "Ana Ruiz",
                "area": {"id": 1, "name": "Finance"}
            }))
        })
        .collect()
}

fn config() -> SourceConfig {
    SourceConfig::new("inea", TABLE).with_index_rule(InclusionRule::status_not("retired"))
}

fn setup(rows: Vec<Row>) -> (MemoryBackend, Arc<CacheStore>, Arc<SourceEngine>) {
    let backend = MemoryBackend::new();
    backend.put_table(TABLE, rows);
    let cache = Arc::new(CacheStore::in_memory());
    let engine = Arc::new(
        SourceEngine::new(config(), Arc::new(backend.clone()), cache.clone()).with_page_size(100),
    );
    (backend, cache, engine)
}

#[tokio::test]
async fn test_activate_indexes_when_cache_is_empty() {
    let (backend, cache, engine) = setup(asset_rows(250));

    let live = engine
        .activate(&backend, &backend)
        .await
        .expect("source should go live");

    let state = engine.state();
    assert_eq!(state.phase, Phase::Ready);
    assert!(state.is_complete);
    assert!(!state.is_indexing);
    assert_eq!(state.data.count(), 225);
    assert_eq!(state.realtime, RealtimeStatus::Subscribed);
    // 225 rows pass the server-side filter: pages of 100, 100, 25
    assert_eq!(backend.page_requests(), 3);
    assert_eq!(state.progress, state.total);
    assert_eq!(cache.read("inea").unwrap().count(), 225);

    drop(live);
    assert_eq!(engine.state().realtime, RealtimeStatus::Disconnected);
    assert_eq!(backend.open_channels(TABLE), 0);
}

#[tokio::test]
async fn test_activate_prefers_fresh_cache() {
    let (backend, cache, engine) = setup(asset_rows(50));
    let cached = SourceSnapshot::complete(vec![IndexedRecord::new(99)], Utc::now());
    assert!(cache.write("inea", &cached));

    let _live = engine.activate(&backend, &backend).await.unwrap();

    assert_eq!(backend.page_requests(), 0);
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.count(), 1);
    assert!(snapshot.complete);
}

#[tokio::test]
async fn test_activate_without_session_stays_idle() {
    let (backend, _cache, engine) = setup(asset_rows(10));

    assert!(engine
        .activate(&StaticSession(false), &backend)
        .await
        .is_none());
    assert_eq!(engine.state().phase, Phase::Idle);
    assert_eq!(backend.page_requests(), 0);

    backend.set_session_reachable(false);
    assert!(engine.activate(&backend, &backend).await.is_none());
    assert_eq!(engine.state().phase, Phase::Idle);
    assert_eq!(backend.open_channels(TABLE), 0);
}

#[tokio::test]
async fn test_failed_page_keeps_previous_snapshot() {
    let (backend, cache, engine) = setup(asset_rows(250));
    assert!(engine.index_all().await.is_indexed());
    let before = engine.snapshot();
    let cached_before = cache.read("inea").unwrap();

    backend.fail_after_pages(1);
    let outcome = engine.index_all().await;

    assert!(matches!(
        outcome,
        IndexOutcome::Failed(IndexError::Page { offset: 100, .. })
    ));
    let state = engine.state();
    assert!(Arc::ptr_eq(&before, &state.data));
    assert!(state.error.is_some());
    assert!(!state.is_indexing);
    assert_eq!(state.phase, Phase::Ready);
    assert_eq!(cache.read("inea").unwrap(), cached_before);

    backend.heal();
    assert!(engine.reindex().await.is_indexed());
    assert!(engine.state().error.is_none());
}

#[tokio::test]
async fn test_failed_first_index_leaves_source_uninitialized() {
    let (backend, cache, engine) = setup(asset_rows(10));
    backend.fail_after_pages(0);

    assert!(engine.activate(&backend, &backend).await.is_none());
    let state = engine.state();
    assert_eq!(state.phase, Phase::Uninitialized);
    assert!(!state.is_complete);
    assert!(state.error.is_some());
    assert!(cache.read("inea").is_none());
}

/// Store whose reads take a while, so two runs can overlap
struct SlowStore {
    rows: Vec<Row>,
}

#[async_trait]
impl RemoteStore for SlowStore {
    async fn count(&self, _table: &str, _filter: Option<&ExcludeClause>) -> Result<usize, RemoteError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(self.rows.len())
    }

    async fn fetch_page(&self, request: PageRequest<'_>) -> Result<Vec<Row>, RemoteError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(self
            .rows
            .iter()
            .skip(request.offset)
            .take(request.limit)
            .cloned()
            .collect())
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_index_is_rejected() {
    let store = Arc::new(SlowStore {
        rows: asset_rows(30),
    });
    let engine = SourceEngine::new(config(), store, Arc::new(CacheStore::in_memory()))
        .with_page_size(10);

    let (first, second) = tokio::join!(engine.index_all(), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        engine.index_all().await
    });

    assert!(first.is_indexed());
    assert!(matches!(second, IndexOutcome::AlreadyRunning));
    assert_eq!(engine.snapshot().count(), 27);
    assert!(!engine.is_indexing());

    // The flag is released once the first run finishes
    assert!(engine.index_all().await.is_indexed());
}

#[tokio::test]
async fn test_reindex_is_idempotent() {
    let (_backend, _cache, engine) = setup(asset_rows(250));

    assert!(engine.index_all().await.is_indexed());
    let first = engine.snapshot();
    assert!(engine.reindex().await.is_indexed());
    let second = engine.snapshot();

    assert!(!Arc::ptr_eq(&first, &second));
    let sorted = |snapshot: &SourceSnapshot| {
        let mut records = snapshot.records.clone();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    };
    assert_eq!(sorted(&first), sorted(&second));
    assert_eq!(second.count(), 225);
}

/// Store that parks the page at `offset` until released
struct GatedStore {
    rows: Vec<Row>,
    offset: usize,
    reached: Notify,
    release: Notify,
}

#[async_trait]
impl RemoteStore for GatedStore {
    async fn count(&self, _table: &str, _filter: Option<&ExcludeClause>) -> Result<usize, RemoteError> {
        Ok(self.rows.len())
    }

    async fn fetch_page(&self, request: PageRequest<'_>) -> Result<Vec<Row>, RemoteError> {
        if request.offset == self.offset {
            self.reached.notify_one();
            self.release.notified().await;
        }
        Ok(self
            .rows
            .iter()
            .skip(request.offset)
            .take(request.limit)
            .cloned()
            .collect())
    }
}

#[tokio::test]
async fn test_change_during_index_survives_the_run() {
    let store = Arc::new(GatedStore {
        rows: vec![
            row(json!({"id": 1, "custodian": "Ana"})),
            row(json!({"id": 2, "custodian": "Ana"})),
        ],
        offset: 1,
        reached: Notify::new(),
        release: Notify::new(),
    });
    let cache = Arc::new(CacheStore::in_memory());
    let engine = SourceEngine::new(config(), store.clone(), cache.clone()).with_page_size(1);

    // Row 1 was already read when the update is committed
    let change = async {
        store.reached.notified().await;
        let outcome = engine.apply_change(&ChangeNotification::update(
            Some(row(json!({"id": 1, "custodian": "Ana"}))),
            row(json!({"id": 1, "custodian": "Luis"})),
        ));
        store.release.notify_one();
        outcome
    };
    let (indexed, applied) = tokio::join!(engine.reindex(), change);

    assert_eq!(applied, ApplyOutcome::Applied);
    assert!(matches!(indexed, IndexOutcome::Indexed { records: 2 }));

    let custodian = |snapshot: &SourceSnapshot| {
        snapshot
            .get(&RecordKey::Int(1))
            .and_then(|r| r.custodian.clone())
    };
    assert_eq!(custodian(&engine.snapshot()).as_deref(), Some("Luis"));
    assert_eq!(custodian(&cache.read("inea").unwrap()).as_deref(), Some("Luis"));
    assert_eq!(engine.snapshot().count(), 2);

    // The queue is spent; a later run starts from the backend alone
    store.release.notify_one();
    assert!(engine.index_all().await.is_indexed());
    assert_eq!(custodian(&engine.snapshot()).as_deref(), Some("Ana"));
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_monotonic() {
    let store = Arc::new(SlowStore {
        rows: asset_rows(45),
    });
    let engine = SourceEngine::new(config(), store, Arc::new(CacheStore::in_memory()))
        .with_page_size(10);
    let mut rx = engine.watch();

    let observe = async {
        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            seen.push((state.progress, state.total));
            if state.is_complete && !state.is_indexing {
                break;
            }
        }
        seen
    };

    let (outcome, seen) = tokio::join!(engine.index_all(), observe);

    assert!(outcome.is_indexed());
    assert!(seen.len() > 2);
    assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    assert!(seen.iter().all(|(progress, total)| progress <= total));
    assert_eq!(seen.last(), Some(&(45, 45)));
}

#[tokio::test]
async fn test_realtime_changes_write_through() {
    let (backend, cache, engine) = setup(asset_rows(5));
    let mut live = engine.activate(&backend, &backend).await.unwrap();

    backend.insert(TABLE, row(json!({"id": 6, "status": "active"})));
    backend
        .update(TABLE, "id", row(json!({"id": 2, "status": "retired"})))
        .unwrap();
    backend.delete(TABLE, "id", &RecordKey::Int(3)).unwrap();

    assert_eq!(live.apply_pending(), 3);

    let keys: Vec<RecordKey> = engine.snapshot().records.iter().map(|r| r.id.clone()).collect();
    assert_eq!(
        keys,
        vec![
            RecordKey::Int(1),
            RecordKey::Int(4),
            RecordKey::Int(5),
            RecordKey::Int(6)
        ]
    );
    assert_eq!(cache.read("inea").unwrap().count(), 4);
}

#[tokio::test]
async fn test_malformed_notification_is_dropped() {
    let (backend, _cache, engine) = setup(asset_rows(3));
    let _live = engine.activate(&backend, &backend).await.unwrap();
    let before = engine.snapshot();

    let outcome = engine.apply_change(&ChangeNotification::insert(row(json!({"tag": "X"}))));

    assert_eq!(outcome, ApplyOutcome::Dropped);
    assert!(Arc::ptr_eq(&before, &engine.snapshot()));
}

#[tokio::test]
async fn test_clear_cache_resets_without_refetch() {
    let (backend, cache, engine) = setup(asset_rows(5));
    let _live = engine.activate(&backend, &backend).await.unwrap();
    let requests = backend.page_requests();

    engine.clear_cache();

    let state = engine.state();
    assert!(state.data.is_empty());
    assert!(!state.is_complete);
    assert_eq!(state.phase, Phase::Uninitialized);
    assert_eq!(state.realtime, RealtimeStatus::Subscribed);
    assert!(cache.read("inea").is_none());
    assert_eq!(backend.page_requests(), requests);

    // Realtime changes keep flowing but an incomplete set is never persisted
    engine.apply_change(&ChangeNotification::insert(row(json!({"id": 8}))));
    assert_eq!(engine.snapshot().count(), 1);
    assert!(cache.read("inea").is_none());
}

#[tokio::test]
async fn test_live_source_next_applies_notification() {
    let (backend, _cache, engine) = setup(asset_rows(2));
    let mut live = engine.activate(&backend, &backend).await.unwrap();

    backend.insert(TABLE, row(json!({"id": 3})));
    assert_eq!(live.next().await, Some(ApplyOutcome::Applied));
    assert_eq!(engine.snapshot().count(), 3);
}

#[tokio::test]
async fn test_rewrite_references_clears_syncing() {
    let (_backend, _cache, engine) = setup(vec![
        row(json!({"id": 1, "area": {"id": 1, "name": "Finance"}})),
        row(json!({"id": 2, "area": {"id": 2, "name": "Legal"}})),
        row(json!({"id": 3, "area": {"id": 1, "name": "Finance"}})),
    ]);
    assert!(engine.index_all().await.is_indexed());

    let stale = engine.stale_references(ReferenceKind::Area, &RecordKey::Int(1), "Treasury");
    assert_eq!(stale, vec![RecordKey::Int(1), RecordKey::Int(3)]);

    engine.mark_syncing(&stale);
    assert_eq!(engine.state().syncing.len(), 2);

    let rewritten =
        engine.rewrite_references(ReferenceKind::Area, &RecordKey::Int(1), "Treasury", &stale);
    assert_eq!(rewritten, 2);

    let state = engine.state();
    assert!(state.syncing.is_empty());
    let snapshot = state.data;
    assert_eq!(
        snapshot.get(&RecordKey::Int(1)).unwrap().area,
        Some(EntityRef::new(1, "Treasury"))
    );
    assert_eq!(
        snapshot.get(&RecordKey::Int(2)).unwrap().area,
        Some(EntityRef::new(2, "Legal"))
    );
}
