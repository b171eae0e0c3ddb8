//! In-process backing store
//!
//! Holds tables as row vectors, answers counts and paged reads, and fans
//! committed changes out to open channels in commit order. Failure injection
//! hooks let callers simulate a page request failing mid-scan or an
//! unreachable session endpoint.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{
    ChangeFeed, ChangeKind, ChangeNotification, PageRequest, RemoteError, RemoteStore,
    SessionGate, Subscription,
};
use crate::core::record::RecordKey;
use crate::core::source::{ExcludeClause, Row};

/// Stem of the optional session file in a fixture directory
const SESSION_FILE_STEM: &str = "session";

struct Channel {
    id: u64,
    table: String,
    sender: mpsc::UnboundedSender<ChangeNotification>,
}

#[derive(Default)]
struct BackendState {
    tables: BTreeMap<String, Vec<Row>>,
    channels: Vec<Channel>,
    next_channel: u64,
    authenticated: bool,
    session_reachable: bool,
    /// Page requests still allowed to succeed (None = unlimited)
    page_budget: Option<usize>,
    page_requests: usize,
}

/// Shared in-process backend; clones refer to the same tables
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Mutex<BackendState>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Empty backend with an authenticated session
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BackendState {
                authenticated: true,
                session_reachable: true,
                ..Default::default()
            })),
        }
    }

    /// Load every `<table>.json` row array in `dir`
    ///
    /// An optional `session.json` (`{"authenticated": false}`) controls the
    /// session gate.
    pub fn load_dir(dir: &Path) -> Result<Self, RemoteError> {
        let backend = Self::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let content = fs::read_to_string(&path)?;
            if stem == SESSION_FILE_STEM {
                let session: Value = serde_json::from_str(&content)?;
                let authenticated = session
                    .get("authenticated")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                backend.set_authenticated(authenticated);
                continue;
            }

            let rows: Vec<Row> = serde_json::from_str(&content)?;
            backend.put_table(stem, rows);
        }

        Ok(backend)
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace a table's rows without emitting notifications
    pub fn put_table(&self, table: &str, rows: Vec<Row>) {
        self.lock().tables.insert(table.to_string(), rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.lock().authenticated = authenticated;
    }

    pub fn set_session_reachable(&self, reachable: bool) {
        self.lock().session_reachable = reachable;
    }

    /// Let the next `pages` page requests succeed, then fail the rest
    pub fn fail_after_pages(&self, pages: usize) {
        self.lock().page_budget = Some(pages);
    }

    /// Remove any injected page failure
    pub fn heal(&self) {
        self.lock().page_budget = None;
    }

    pub fn page_requests(&self) -> usize {
        self.lock().page_requests
    }

    /// Channels currently open on `table`
    pub fn open_channels(&self, table: &str) -> usize {
        self.lock()
            .channels
            .iter()
            .filter(|c| c.table == table && !c.sender.is_closed())
            .count()
    }

    /// Commit an insert and notify
    pub fn insert(&self, table: &str, row: Row) {
        let mut state = self.lock();
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Self::notify(&mut state, table, ChangeNotification::insert(row));
    }

    /// Commit an update of the row whose `key_column` matches `row`'s
    pub fn update(&self, table: &str, key_column: &str, row: Row) -> Result<(), RemoteError> {
        let key = key_in(&row, key_column, table)?;
        let mut state = self.lock();
        let rows = state
            .tables
            .get_mut(table)
            .ok_or_else(|| RemoteError::UnknownTable {
                table: table.to_string(),
            })?;
        let slot = rows
            .iter_mut()
            .find(|r| r.get(key_column).and_then(RecordKey::from_value).as_ref() == Some(&key))
            .ok_or_else(|| RemoteError::RowNotFound {
                table: table.to_string(),
                key: key.to_string(),
            })?;

        let old = std::mem::replace(slot, row.clone());
        Self::notify(&mut state, table, ChangeNotification::update(Some(old), row));
        Ok(())
    }

    /// Commit a delete by key and notify
    pub fn delete(&self, table: &str, key_column: &str, key: &RecordKey) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let rows = state
            .tables
            .get_mut(table)
            .ok_or_else(|| RemoteError::UnknownTable {
                table: table.to_string(),
            })?;
        let position = rows
            .iter()
            .position(|r| r.get(key_column).and_then(RecordKey::from_value).as_ref() == Some(key))
            .ok_or_else(|| RemoteError::RowNotFound {
                table: table.to_string(),
                key: key.to_string(),
            })?;

        let old = rows.remove(position);
        Self::notify(&mut state, table, ChangeNotification::delete(old));
        Ok(())
    }

    /// Commit a change described as a notification
    ///
    /// Updates of unknown rows become upserts so replayed logs stay usable.
    pub fn commit(
        &self,
        table: &str,
        key_column: &str,
        change: &ChangeNotification,
    ) -> Result<(), RemoteError> {
        let missing = |side: &str| RemoteError::Request {
            table: table.to_string(),
            message: format!("{} change has no '{}' row", change.event_type, side),
        };

        match change.event_type {
            ChangeKind::Insert => {
                let row = change.new.clone().ok_or_else(|| missing("new"))?;
                self.insert(table, row);
                Ok(())
            }
            ChangeKind::Update => {
                let row = change.new.clone().ok_or_else(|| missing("new"))?;
                match self.update(table, key_column, row.clone()) {
                    Err(RemoteError::RowNotFound { .. }) | Err(RemoteError::UnknownTable { .. }) => {
                        let mut state = self.lock();
                        state
                            .tables
                            .entry(table.to_string())
                            .or_default()
                            .push(row.clone());
                        Self::notify(&mut state, table, ChangeNotification::update(None, row));
                        Ok(())
                    }
                    other => other,
                }
            }
            ChangeKind::Delete => {
                let old = change.old.as_ref().ok_or_else(|| missing("old"))?;
                let key = key_in(old, key_column, table)?;
                self.delete(table, key_column, &key)
            }
        }
    }

    /// Deliver a notification without touching table data
    pub fn emit(&self, table: &str, change: ChangeNotification) {
        let mut state = self.lock();
        Self::notify(&mut state, table, change);
    }

    fn notify(state: &mut BackendState, table: &str, change: ChangeNotification) {
        state
            .channels
            .retain(|c| c.table != table || c.sender.send(change.clone()).is_ok());
    }

    fn filtered<'a>(rows: &'a [Row], filter: Option<&ExcludeClause>) -> Vec<&'a Row> {
        rows.iter()
            .filter(|row| filter.map_or(true, |f| f.admits(row)))
            .collect()
    }
}

fn key_in(row: &Row, key_column: &str, table: &str) -> Result<RecordKey, RemoteError> {
    row.get(key_column)
        .and_then(RecordKey::from_value)
        .ok_or_else(|| RemoteError::Request {
            table: table.to_string(),
            message: format!("row has no '{}' key", key_column),
        })
}

#[async_trait]
impl RemoteStore for MemoryBackend {
    async fn count(&self, table: &str, filter: Option<&ExcludeClause>) -> Result<usize, RemoteError> {
        let state = self.lock();
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| RemoteError::UnknownTable {
                table: table.to_string(),
            })?;
        Ok(Self::filtered(rows, filter).len())
    }

    async fn fetch_page(&self, request: PageRequest<'_>) -> Result<Vec<Row>, RemoteError> {
        let mut state = self.lock();
        state.page_requests += 1;

        if let Some(budget) = state.page_budget.as_mut() {
            if *budget == 0 {
                return Err(RemoteError::Request {
                    table: request.table.to_string(),
                    message: format!("page at offset {} failed", request.offset),
                });
            }
            *budget -= 1;
        }

        let rows = state
            .tables
            .get(request.table)
            .ok_or_else(|| RemoteError::UnknownTable {
                table: request.table.to_string(),
            })?;

        let mut matching = Self::filtered(rows, request.filter);
        matching.sort_by_key(|row| row.get(request.order_by).and_then(RecordKey::from_value));

        Ok(matching
            .into_iter()
            .skip(request.offset)
            .take(request.limit)
            .cloned()
            .collect())
    }
}

impl ChangeFeed for MemoryBackend {
    fn subscribe(&self, table: &str) -> Result<Subscription, RemoteError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.lock();
            let id = state.next_channel;
            state.next_channel += 1;
            state.channels.push(Channel {
                id,
                table: table.to_string(),
                sender,
            });
            id
        };

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(table, receiver, move || {
            if let Some(inner) = inner.upgrade() {
                let mut state = inner
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                state.channels.retain(|c| c.id != id);
            }
        }))
    }
}

#[async_trait]
impl SessionGate for MemoryBackend {
    async fn is_authenticated(&self) -> Result<bool, RemoteError> {
        let state = self.lock();
        if !state.session_reachable {
            return Err(RemoteError::Unavailable("session endpoint unreachable".to_string()));
        }
        Ok(state.authenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn backend_with(n: i64) -> MemoryBackend {
        let backend = MemoryBackend::new();
        let rows = (1..=n)
            .rev()
            .map(|i| {
                let status = if i % 2 == 0 { "retired" } else { "active" };
                row(json!({"id": i, "status": status}))
            })
            .collect();
        backend.put_table("assets", rows);
        backend
    }

    #[tokio::test]
    async fn test_pages_are_key_ordered() {
        let backend = backend_with(5);
        let page = backend
            .fetch_page(PageRequest {
                table: "assets",
                filter: None,
                order_by: "id",
                offset: 1,
                limit: 2,
            })
            .await
            .unwrap();

        let ids: Vec<_> = page.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_count_and_filter() {
        let backend = backend_with(6);
        let clause = ExcludeClause {
            column: "status".to_string(),
            value: "retired".to_string(),
        };
        assert_eq!(backend.count("assets", None).await.unwrap(), 6);
        assert_eq!(backend.count("assets", Some(&clause)).await.unwrap(), 3);
        assert!(matches!(
            backend.count("nope", None).await,
            Err(RemoteError::UnknownTable { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_page_failure() {
        let backend = backend_with(3);
        backend.fail_after_pages(1);
        let request = PageRequest {
            table: "assets",
            filter: None,
            order_by: "id",
            offset: 0,
            limit: 1,
        };
        assert!(backend.fetch_page(request).await.is_ok());
        assert!(backend.fetch_page(request).await.is_err());

        backend.heal();
        assert!(backend.fetch_page(request).await.is_ok());
        assert_eq!(backend.page_requests(), 3);
    }

    #[test]
    fn test_changes_reach_only_matching_channels_in_order() {
        let backend = backend_with(2);
        let mut assets = backend.subscribe("assets").unwrap();
        let mut areas = backend.subscribe("areas").unwrap();

        backend.insert("assets", row(json!({"id": 10})));
        backend
            .update("assets", "id", row(json!({"id": 10, "status": "retired"})))
            .unwrap();
        backend.delete("assets", "id", &RecordKey::Int(10)).unwrap();

        let kinds: Vec<_> = std::iter::from_fn(|| assets.try_recv())
            .map(|n| n.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]
        );
        assert!(areas.try_recv().is_none());
    }

    #[test]
    fn test_dropping_subscription_releases_channel() {
        let backend = backend_with(1);
        let sub = backend.subscribe("assets").unwrap();
        assert_eq!(backend.open_channels("assets"), 1);
        drop(sub);
        assert_eq!(backend.open_channels("assets"), 0);
    }

    #[test]
    fn test_commit_update_of_unknown_row_upserts() {
        let backend = backend_with(1);
        let mut sub = backend.subscribe("assets").unwrap();
        backend
            .commit(
                "assets",
                "id",
                &ChangeNotification::update(None, row(json!({"id": 99}))),
            )
            .unwrap();

        assert_eq!(backend.rows("assets").len(), 2);
        assert_eq!(sub.try_recv().unwrap().event_type, ChangeKind::Update);
    }

    #[tokio::test]
    async fn test_session_gate() {
        let backend = MemoryBackend::new();
        assert!(backend.is_authenticated().await.unwrap());
        backend.set_authenticated(false);
        assert!(!backend.is_authenticated().await.unwrap());
        backend.set_session_reachable(false);
        assert!(backend.is_authenticated().await.is_err());
    }

    #[test]
    fn test_load_dir() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("public.areas.json"),
            r#"[{"id": 1, "name": "Finance"}]"#,
        )
        .unwrap();
        fs::write(tmp.path().join("session.json"), r#"{"authenticated": false}"#).unwrap();
        fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let backend = MemoryBackend::load_dir(tmp.path()).unwrap();
        assert_eq!(backend.rows("public.areas").len(), 1);
        assert!(!backend.lock().authenticated);
    }
}
