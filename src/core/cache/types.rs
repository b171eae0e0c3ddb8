//! Cache type definitions

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by the underlying key/value storage
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage quota exceeded: writing {needed} bytes would exceed the {quota} byte quota")]
    QuotaExceeded { needed: u64, quota: u64 },

    #[error("Failed to serialize cache payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-source cache entry summary
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryStats {
    pub source: String,
    pub records: usize,
    pub bytes: u64,
    pub saved_at: Option<DateTime<Utc>>,
    pub expired: bool,
}

/// Cache statistics across all sources
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: Vec<CacheEntryStats>,
    pub total_bytes: u64,
    pub quota_bytes: Option<u64>,
}
