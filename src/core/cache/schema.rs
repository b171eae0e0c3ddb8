//! Storage database schema

use rusqlite::params;

use super::storage::SqliteStorage;
use super::types::StorageError;

/// Current schema version - storage is rebuilt on version mismatch
pub(super) const SCHEMA_VERSION: i32 = 1;

impl SqliteStorage {
    /// Check if the stored schema version matches the current one
    pub(super) fn needs_schema_rebuild(&self) -> Result<bool, StorageError> {
        let current_version: i32 = self
            .conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .unwrap_or(0);

        Ok(current_version != SCHEMA_VERSION)
    }

    /// Drop everything and recreate the schema (cached data is disposable)
    pub(super) fn reinitialize_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            r#"
            DROP TABLE IF EXISTS schema_version;
            DROP TABLE IF EXISTS storage;
            "#,
        )?;

        self.init_schema()
    }

    pub(super) fn init_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            r#"
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            -- Origin-scoped key/value items
            CREATE TABLE IF NOT EXISTS storage (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;

        self.conn.execute(
            "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;

        Ok(())
    }
}
