//! Key/value storage backends for the cache
//!
//! The cache only needs origin-scoped string storage: get, set, remove and a
//! key listing. `SqliteStorage` persists it under the workspace directory;
//! `MemoryStorage` keeps it in process for sessions that should not touch disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use super::types::StorageError;

/// Default quota, matching the usual per-origin storage allowance
pub const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

/// Origin-scoped string key/value storage
pub trait KeyValueStorage: Send {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove_item(&mut self, key: &str) -> Result<(), StorageError>;

    fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Bytes currently used (keys plus values)
    fn used_bytes(&self) -> Result<u64, StorageError>;

    fn quota(&self) -> Option<u64>;
}

/// Check a pending write against the quota
fn check_quota(
    quota: Option<u64>,
    used: u64,
    key: &str,
    previous: Option<usize>,
    value: &str,
) -> Result<(), StorageError> {
    if let Some(quota) = quota {
        let freed = previous.map(|len| (key.len() + len) as u64).unwrap_or(0);
        let needed = used.saturating_sub(freed) + (key.len() + value.len()) as u64;
        if needed > quota {
            return Err(StorageError::QuotaExceeded { needed, quota });
        }
    }
    Ok(())
}

/// SQLite-backed storage
pub struct SqliteStorage {
    pub(super) conn: Connection,
    quota: Option<u64>,
}

impl SqliteStorage {
    /// Open or create the storage database at `path`
    pub fn open(path: &Path, quota: Option<u64>) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn, quota)
    }

    /// Storage that lives only as long as this value
    pub fn open_in_memory(quota: Option<u64>) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?, quota)
    }

    fn from_connection(conn: Connection, quota: Option<u64>) -> Result<Self, StorageError> {
        let mut storage = Self { conn, quota };
        if storage.needs_schema_rebuild()? {
            storage.reinitialize_schema()?;
        }
        Ok(storage)
    }
}

impl KeyValueStorage for SqliteStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM storage WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let previous: Option<usize> = self
            .conn
            .query_row(
                "SELECT LENGTH(CAST(value AS BLOB)) FROM storage WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        check_quota(self.quota, self.used_bytes()?, key, previous, value)?;

        self.conn.execute(
            "INSERT OR REPLACE INTO storage (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove_item(&mut self, key: &str) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM storage WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT key FROM storage ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    fn used_bytes(&self) -> Result<u64, StorageError> {
        let used: Option<i64> = self.conn.query_row(
            "SELECT SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))) FROM storage",
            [],
            |row| row.get(0),
        )?;
        Ok(used.unwrap_or(0).max(0) as u64)
    }

    fn quota(&self) -> Option<u64> {
        self.quota
    }
}

/// In-process storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: BTreeMap<String, String>,
    quota: Option<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: u64) -> Self {
        Self {
            items: BTreeMap::new(),
            quota: Some(quota),
        }
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.get(key).cloned())
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let previous = self.items.get(key).map(String::len);
        check_quota(self.quota, self.used_bytes()?, key, previous, value)?;
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&mut self, key: &str) -> Result<(), StorageError> {
        self.items.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.items.keys().cloned().collect())
    }

    fn used_bytes(&self) -> Result<u64, StorageError> {
        Ok(self
            .items
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum())
    }

    fn quota(&self) -> Option<u64> {
        self.quota
    }
}
