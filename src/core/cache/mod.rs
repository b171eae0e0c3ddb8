//! Persisted snapshot cache
//!
//! Each source's materialized record set is stored under two keys in an
//! origin-scoped key/value storage:
//! - `<source>_cache` holds the JSON array of records
//! - `<source>_cache_timestamp` holds the RFC 3339 time it was saved
//!
//! Entries older than the retention window are treated as absent and removed
//! when read. Nothing sweeps them in the background.
//!
//! Write failures (quota, serialization) never reach the caller through
//! `write`: the in-memory snapshot stays authoritative for the session.

mod schema;
mod storage;
mod types;

pub use storage::{KeyValueStorage, MemoryStorage, SqliteStorage, DEFAULT_QUOTA_BYTES};
pub use types::*;

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::core::record::{IndexedRecord, SourceSnapshot};

/// Suffix of the storage key holding a source's records
const DATA_SUFFIX: &str = "_cache";

/// Suffix of the storage key holding a source's save time
const TIMESTAMP_SUFFIX: &str = "_cache_timestamp";

/// Default retention window
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Snapshot cache shared by every source engine, partitioned by source key
pub struct CacheStore {
    storage: Mutex<Box<dyn KeyValueStorage>>,
    retention: Duration,
}

impl CacheStore {
    pub fn new(storage: impl KeyValueStorage + 'static, retention: Duration) -> Self {
        Self {
            storage: Mutex::new(Box::new(storage)),
            retention,
        }
    }

    /// In-memory cache with the default retention window
    pub fn in_memory() -> Self {
        Self::new(
            MemoryStorage::new(),
            Duration::days(DEFAULT_RETENTION_DAYS),
        )
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn KeyValueStorage>> {
        // A panic while holding the lock cannot leave the storage half-written
        // from our side, so a poisoned lock is still usable.
        self.storage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn data_key(source: &str) -> String {
        format!("{}{}", source, DATA_SUFFIX)
    }

    fn timestamp_key(source: &str) -> String {
        format!("{}{}", source, TIMESTAMP_SUFFIX)
    }

    /// Read a fresh snapshot for `source`, or `None` if absent or expired
    pub fn read(&self, source: &str) -> Option<SourceSnapshot> {
        self.read_at(source, Utc::now())
    }

    /// Read as of `now`; stale or unreadable entries are removed
    pub fn read_at(&self, source: &str, now: DateTime<Utc>) -> Option<SourceSnapshot> {
        let mut storage = self.lock();

        let data = storage.get_item(&Self::data_key(source));
        let stamp = storage.get_item(&Self::timestamp_key(source));

        let (data, stamp) = match (data, stamp) {
            (Ok(Some(data)), Ok(Some(stamp))) => (data, stamp),
            (Ok(None), Ok(None)) => return None,
            (Err(e), _) | (_, Err(e)) => {
                warn!(source, error = %e, "cache read failed");
                return None;
            }
            _ => {
                debug!(source, "dropping half-written cache entry");
                Self::remove_entry(&mut **storage, source);
                return None;
            }
        };

        let saved_at = match DateTime::parse_from_rfc3339(&stamp) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => {
                warn!(source, error = %e, "unreadable cache timestamp, dropping entry");
                Self::remove_entry(&mut **storage, source);
                return None;
            }
        };

        if now - saved_at > self.retention {
            debug!(source, %saved_at, "cache entry expired");
            Self::remove_entry(&mut **storage, source);
            return None;
        }

        match serde_json::from_str::<Vec<IndexedRecord>>(&data) {
            Ok(records) => Some(SourceSnapshot::complete(records, saved_at)),
            Err(e) => {
                warn!(source, error = %e, "corrupt cache payload, dropping entry");
                Self::remove_entry(&mut **storage, source);
                None
            }
        }
    }

    /// Persist a snapshot; failures are logged and swallowed
    ///
    /// Returns whether anything was persisted this round.
    pub fn write(&self, source: &str, snapshot: &SourceSnapshot) -> bool {
        match self.try_write(source, snapshot) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    source,
                    records = snapshot.count(),
                    error = %e,
                    "cache write failed; continuing with in-memory snapshot"
                );
                false
            }
        }
    }

    /// Persist a snapshot, stamped now, reporting failures
    pub fn try_write(&self, source: &str, snapshot: &SourceSnapshot) -> Result<(), StorageError> {
        self.try_write_at(source, &snapshot.records, Utc::now())
    }

    /// Persist records with an explicit save time
    pub fn try_write_at(
        &self,
        source: &str,
        records: &[IndexedRecord],
        saved_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(records)?;
        let mut storage = self.lock();

        let mut result = storage.set_item(&Self::data_key(source), &payload);
        if result.is_ok() {
            result = storage.set_item(&Self::timestamp_key(source), &saved_at.to_rfc3339());
        }

        if result.is_err() {
            // Do not leave a payload behind without its timestamp
            Self::remove_entry(&mut **storage, source);
        }
        result
    }

    /// Drop the entry for `source`
    pub fn clear(&self, source: &str) {
        let mut storage = self.lock();
        Self::remove_entry(&mut **storage, source);
    }

    fn remove_entry(storage: &mut dyn KeyValueStorage, source: &str) {
        for key in [Self::data_key(source), Self::timestamp_key(source)] {
            if let Err(e) = storage.remove_item(&key) {
                warn!(source, key = %key, error = %e, "failed to remove cache key");
            }
        }
    }

    /// Save time of the entry for `source`, without an expiry check
    pub fn saved_at(&self, source: &str) -> Option<DateTime<Utc>> {
        let storage = self.lock();
        storage
            .get_item(&Self::timestamp_key(source))
            .ok()
            .flatten()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Summarize every entry in storage
    pub fn statistics(&self) -> Result<CacheStats, StorageError> {
        let storage = self.lock();
        let now = Utc::now();

        let mut entries = Vec::new();
        for key in storage.keys()? {
            let Some(source) = key.strip_suffix(DATA_SUFFIX) else {
                continue;
            };
            let data = storage.get_item(&key)?.unwrap_or_default();
            let records = serde_json::from_str::<Vec<serde_json::Value>>(&data)
                .map(|v| v.len())
                .unwrap_or(0);
            let saved_at = storage
                .get_item(&Self::timestamp_key(source))?
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc));

            entries.push(CacheEntryStats {
                source: source.to_string(),
                records,
                bytes: (key.len() + data.len()) as u64,
                expired: saved_at.map_or(true, |at| now - at > self.retention),
                saved_at,
            });
        }

        Ok(CacheStats {
            entries,
            total_bytes: storage.used_bytes()?,
            quota_bytes: storage.quota(),
        })
    }
}
