//! Configuration management with layered hierarchy
//!
//! Built-in defaults, then `~/.config/custody/config.yaml`, then the
//! workspace's `.custody/config.yaml`, then `CUSTODY_*` environment variables.
//! Later layers override earlier ones field by field.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::cache::{DEFAULT_QUOTA_BYTES, DEFAULT_RETENTION_DAYS};
use crate::core::engine::{ReferenceKind, DEFAULT_PAGE_SIZE};
use crate::core::merge::ExclusionConfig;
use crate::core::project::Project;
use crate::core::propagation::{ReferenceTable, DEFAULT_BATCH_SIZE, DEFAULT_BATCH_YIELD_MS};
use crate::core::source::{InclusionRule, SourceConfig};

/// Engine configuration with layered hierarchy
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Days a cached snapshot stays fresh
    pub retention_days: Option<i64>,

    /// Rows per page for the full indexer
    pub page_size: Option<usize>,

    /// Records rewritten per propagation batch
    pub batch_size: Option<usize>,

    /// Pause between propagation batches, in milliseconds
    pub batch_yield_ms: Option<u64>,

    /// Byte quota of the persisted cache
    pub storage_quota_bytes: Option<u64>,

    /// Tracked sources, in merge order
    pub sources: Option<Vec<SourceConfig>>,

    /// Source whose records mark assets as already taken
    pub exclusion: Option<ExclusionConfig>,

    /// Reference tables whose renames are propagated
    pub references: Option<Vec<ReferenceTable>>,
}

impl Config {
    /// Load configuration from all sources, merging in priority order
    pub fn load() -> Self {
        let project = Project::discover().ok();
        Self::load_layers(Self::global_config_path().as_deref(), project.as_ref())
    }

    /// Load configuration for a known workspace
    pub fn load_for(project: &Project) -> Self {
        Self::load_layers(Self::global_config_path().as_deref(), Some(project))
    }

    fn load_layers(global: Option<&Path>, project: Option<&Project>) -> Self {
        let mut config = Config::default();

        // 1. Built-in defaults are applied by the accessors

        // 2. Global user config (~/.config/custody/config.yaml)
        if let Some(global) = global.and_then(Self::read_file) {
            config.merge(global);
        }

        // 3. Workspace config (.custody/config.yaml)
        if let Some(local) = project.and_then(|p| Self::read_file(&p.config_path())) {
            config.merge(local);
        }

        // 4. Environment variables
        config.apply_env(|key| std::env::var(key).ok());

        config
    }

    fn read_file(path: &Path) -> Option<Config> {
        if !path.exists() {
            return None;
        }
        let contents = std::fs::read_to_string(path).ok()?;
        // A file holding only comments is an empty document
        match serde_yml::from_str::<Option<Config>>(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable config file");
                None
            }
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring invalid environment value");
                    None
                }
            }
        }

        if let Some(days) = parsed("CUSTODY_RETENTION_DAYS", var("CUSTODY_RETENTION_DAYS")) {
            self.retention_days = Some(days);
        }
        if let Some(size) = parsed("CUSTODY_PAGE_SIZE", var("CUSTODY_PAGE_SIZE")) {
            self.page_size = Some(size);
        }
    }

    /// Get the path to the global config file
    fn global_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "custody")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Merge another config into this one (other takes precedence)
    fn merge(&mut self, other: Config) {
        if other.retention_days.is_some() {
            self.retention_days = other.retention_days;
        }
        if other.page_size.is_some() {
            self.page_size = other.page_size;
        }
        if other.batch_size.is_some() {
            self.batch_size = other.batch_size;
        }
        if other.batch_yield_ms.is_some() {
            self.batch_yield_ms = other.batch_yield_ms;
        }
        if other.storage_quota_bytes.is_some() {
            self.storage_quota_bytes = other.storage_quota_bytes;
        }
        if other.sources.is_some() {
            self.sources = other.sources;
        }
        if other.exclusion.is_some() {
            self.exclusion = other.exclusion;
        }
        if other.references.is_some() {
            self.references = other.references;
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS).max(0))
    }

    pub fn page_size(&self) -> usize {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1)
    }

    pub fn batch_yield(&self) -> Duration {
        Duration::from_millis(self.batch_yield_ms.unwrap_or(DEFAULT_BATCH_YIELD_MS))
    }

    pub fn storage_quota(&self) -> u64 {
        self.storage_quota_bytes.unwrap_or(DEFAULT_QUOTA_BYTES)
    }

    /// Tracked sources, falling back to the three inventory registers
    pub fn sources(&self) -> Vec<SourceConfig> {
        self.sources.clone().unwrap_or_else(|| {
            vec![
                // Retired assets are filtered by the backing store
                SourceConfig::new("inea", "public.inea_assets")
                    .with_index_rule(InclusionRule::status_not("retired")),
                // Retired assets are indexed but hidden when merging
                SourceConfig::new("itea", "public.itea_assets")
                    .with_merge_rule(InclusionRule::status_not("retired")),
                SourceConfig::new("unlisted", "public.unlisted_assets"),
            ]
        })
    }

    pub fn source(&self, name: &str) -> Option<SourceConfig> {
        self.sources()
            .into_iter()
            .chain(std::iter::once(self.exclusion().source))
            .find(|s| s.name == name)
    }

    pub fn exclusion(&self) -> ExclusionConfig {
        self.exclusion.clone().unwrap_or_else(|| ExclusionConfig {
            source: SourceConfig::new("folios", "public.custody_folios"),
            key_field: "asset_id".to_string(),
            active_rule: InclusionRule::status_not("closed"),
        })
    }

    pub fn references(&self) -> Vec<ReferenceTable> {
        self.references.clone().unwrap_or_else(|| {
            vec![
                ReferenceTable::new(ReferenceKind::Area, "public.areas"),
                ReferenceTable::new(ReferenceKind::Director, "public.directors"),
            ]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.retention(), chrono::Duration::days(7));
        assert_eq!(config.page_size(), 1000);
        assert_eq!(config.batch_size(), 100);
        assert_eq!(config.batch_yield(), Duration::from_millis(10));
        assert_eq!(config.storage_quota(), 5 * 1024 * 1024);

        let names: Vec<String> = config.sources().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["inea", "itea", "unlisted"]);
        assert_eq!(config.exclusion().source.name, "folios");
        assert_eq!(config.references().len(), 2);
        assert!(config.source("folios").is_some());
        assert!(config.source("missing").is_none());
    }

    #[test]
    fn test_workspace_layer_overrides_global() {
        let tmp = tempdir().unwrap();
        let global = tmp.path().join("global.yaml");
        std::fs::write(&global, "retention_days: 3\npage_size: 200\n").unwrap();

        let project = Project::init(&tmp.path().join("ws")).unwrap();
        std::fs::write(
            project.config_path(),
            r#"
page_size: 50
sources:
  - name: inea
    table: public.inea
    index_rule:
      rule: field_not_eq
      field: status
      value: BAJA
"#,
        )
        .unwrap();

        let config = Config::load_layers(Some(&global), Some(&project));
        assert_eq!(config.retention(), chrono::Duration::days(3));
        assert_eq!(config.page_size(), 50);

        let sources = config.sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].index_rule, InclusionRule::status_not("BAJA"));
        assert_eq!(sources[0].fields.primary_key, "id");
    }

    #[test]
    fn test_env_overrides_and_bad_values() {
        let env: HashMap<&str, &str> =
            [("CUSTODY_RETENTION_DAYS", "2"), ("CUSTODY_PAGE_SIZE", "lots")].into();
        let mut config = Config {
            page_size: Some(300),
            ..Default::default()
        };

        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.retention_days, Some(2));
        assert_eq!(config.page_size(), 300);
    }

    #[test]
    fn test_unreadable_file_is_skipped() {
        let tmp = tempdir().unwrap();
        let global = tmp.path().join("global.yaml");
        std::fs::write(&global, "page_size: [not, a, number]\n").unwrap();

        let config = Config::load_layers(Some(&global), None);
        assert_eq!(config.page_size(), 1000);
    }
}
