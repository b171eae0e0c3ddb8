//! Workspace discovery and structure

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the workspace directory
pub const WORKSPACE_DIR: &str = ".custody";

/// Represents a custody workspace
#[derive(Debug)]
pub struct Project {
    /// Root directory of the workspace (parent of .custody/)
    root: PathBuf,
}

impl Project {
    /// Find workspace root by walking up from the current directory
    pub fn discover() -> Result<Self, ProjectError> {
        let current = std::env::current_dir()
            .map_err(|e| ProjectError::IoError(e.to_string()))?;
        Self::discover_from(&current)
    }

    /// Find workspace root by walking up from the given directory
    pub fn discover_from(start: &Path) -> Result<Self, ProjectError> {
        let mut current = start
            .canonicalize()
            .map_err(|e| ProjectError::IoError(e.to_string()))?;

        loop {
            if current.join(WORKSPACE_DIR).is_dir() {
                return Ok(Self { root: current });
            }

            if !current.pop() {
                return Err(ProjectError::NotFound {
                    searched_from: start.to_path_buf(),
                });
            }
        }
    }

    /// Create a new workspace at the given path
    pub fn init(path: &Path) -> Result<Self, ProjectError> {
        let root = Self::resolve(path)?;
        if root.join(WORKSPACE_DIR).exists() {
            return Err(ProjectError::AlreadyExists(root));
        }
        Self::write_structure(root)
    }

    /// Force initialization even if .custody/ exists
    ///
    /// Rewrites the default config; the cache database is left alone.
    pub fn init_force(path: &Path) -> Result<Self, ProjectError> {
        let root = Self::resolve(path)?;
        Self::write_structure(root)
    }

    fn resolve(path: &Path) -> Result<PathBuf, ProjectError> {
        std::fs::create_dir_all(path).map_err(|e| ProjectError::IoError(e.to_string()))?;
        Ok(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()))
    }

    fn write_structure(root: PathBuf) -> Result<Self, ProjectError> {
        let dir = root.join(WORKSPACE_DIR);
        std::fs::create_dir_all(&dir).map_err(|e| ProjectError::IoError(e.to_string()))?;

        std::fs::write(dir.join("config.yaml"), Self::default_config())
            .map_err(|e| ProjectError::IoError(e.to_string()))?;
        std::fs::write(dir.join(".gitignore"), "cache.db*\n")
            .map_err(|e| ProjectError::IoError(e.to_string()))?;

        Ok(Self { root })
    }

    fn default_config() -> &'static str {
        r#"# Custody index workspace configuration

# Days a cached snapshot stays fresh (env: CUSTODY_RETENTION_DAYS)
# retention_days: 7

# Rows per page when indexing a source (env: CUSTODY_PAGE_SIZE)
# page_size: 1000

# Records rewritten per batch when a reference is renamed, and the pause between batches
# batch_size: 100
# batch_yield_ms: 10

# Byte quota of the persisted cache
# storage_quota_bytes: 5242880

# Tracked sources, in merge order
# sources:
#   - name: inea
#     table: public.inea_assets
#     index_rule: { rule: field_not_eq, field: status, value: retired }
#   - name: itea
#     table: public.itea_assets
#     merge_rule: { rule: field_not_eq, field: status, value: retired }
#   - name: unlisted
#     table: public.unlisted_assets

# Source whose open records mark assets as taken
# exclusion:
#   source: { name: folios, table: public.custody_folios }
#   key_field: asset_id
#   active_rule: { rule: field_not_eq, field: status, value: closed }

# Reference tables whose renames are propagated into cached records
# references:
#   - { kind: area, table: public.areas }
#   - { kind: director, table: public.directors }
"#
    }

    /// Get the workspace root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the .custody directory
    pub fn custody_dir(&self) -> PathBuf {
        self.root.join(WORKSPACE_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.custody_dir().join("config.yaml")
    }

    /// Location of the persisted snapshot cache
    pub fn cache_path(&self) -> PathBuf {
        self.custody_dir().join("cache.db")
    }
}

/// Errors that can occur during workspace operations
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("not a custody workspace (searched from {searched_from:?}). Run 'custody init' to create one.")]
    NotFound { searched_from: PathBuf },

    #[error("custody workspace already exists at {0:?}")]
    AlreadyExists(PathBuf),

    #[error("IO error: {0}")]
    IoError(String),
}
