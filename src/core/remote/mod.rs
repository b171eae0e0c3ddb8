//! Backing-store seams
//!
//! The engine talks to the remote store through three traits:
//! - [`RemoteStore`]: row counts and paged reads
//! - [`ChangeFeed`]: one change-notification channel per watched table
//! - [`SessionGate`]: whether an authenticated session exists
//!
//! [`MemoryBackend`] implements all three in process.

mod memory;

pub use memory::MemoryBackend;

use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::core::source::{ExcludeClause, Row};

/// Errors raised by the backing store
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Request to '{table}' failed: {message}")]
    Request { table: String, message: String },

    #[error("Table '{table}' does not exist")]
    UnknownTable { table: String },

    #[error("No row with key '{key}' in '{table}'")]
    RowNotFound { table: String, key: String },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to parse backend data: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One page of a stable-ordered table scan
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub table: &'a str,
    pub filter: Option<&'a ExcludeClause>,
    /// Column giving the stable key order
    pub order_by: &'a str,
    pub offset: usize,
    pub limit: usize,
}

/// Count and page through remote tables
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Number of rows passing `filter`
    async fn count(&self, table: &str, filter: Option<&ExcludeClause>) -> Result<usize, RemoteError>;

    /// Rows `offset..offset + limit` in `order_by` order
    async fn fetch_page(&self, request: PageRequest<'_>) -> Result<Vec<Row>, RemoteError>;
}

/// Authentication check against the session endpoint
#[async_trait]
pub trait SessionGate: Send + Sync {
    async fn is_authenticated(&self) -> Result<bool, RemoteError>;
}

/// Resolve the session gate, treating an unreachable endpoint as signed out
pub async fn has_session(gate: &dyn SessionGate) -> bool {
    match gate.is_authenticated().await {
        Ok(authenticated) => authenticated,
        Err(e) => {
            warn!(error = %e, "session check failed; staying idle");
            false
        }
    }
}

/// Session gate with a fixed answer
#[derive(Debug, Clone, Copy)]
pub struct StaticSession(pub bool);

#[async_trait]
impl SessionGate for StaticSession {
    async fn is_authenticated(&self) -> Result<bool, RemoteError> {
        Ok(self.0)
    }
}

/// Kind of committed change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    #[serde(alias = "INSERT")]
    Insert,
    #[serde(alias = "UPDATE")]
    Update,
    #[serde(alias = "DELETE")]
    Delete,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "insert"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// One committed insert/update/delete on a watched table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    #[serde(rename = "eventType", alias = "event_type")]
    pub event_type: ChangeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Row>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Row>,
}

impl ChangeNotification {
    pub fn insert(new: Row) -> Self {
        Self {
            event_type: ChangeKind::Insert,
            new: Some(new),
            old: None,
        }
    }

    pub fn update(old: Option<Row>, new: Row) -> Self {
        Self {
            event_type: ChangeKind::Update,
            new: Some(new),
            old,
        }
    }

    pub fn delete(old: Row) -> Self {
        Self {
            event_type: ChangeKind::Delete,
            new: None,
            old: Some(old),
        }
    }
}

type Release = Box<dyn FnOnce() + Send>;

/// An open change-notification channel for one table
///
/// The channel is released when the subscription is dropped.
pub struct Subscription {
    table: String,
    receiver: mpsc::UnboundedReceiver<ChangeNotification>,
    release: Option<Release>,
}

impl Subscription {
    pub fn new(
        table: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<ChangeNotification>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            table: table.into(),
            receiver,
            release: Some(Box::new(release)),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Wait for the next notification; `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<ChangeNotification> {
        self.receiver.recv().await
    }

    /// Next already-delivered notification, if any
    pub fn try_recv(&mut self) -> Option<ChangeNotification> {
        self.receiver.try_recv().ok()
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<ChangeNotification>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

/// Opens change-notification channels
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, table: &str) -> Result<Subscription, RemoteError>;
}
