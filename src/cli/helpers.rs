//! Shared helper functions for CLI commands
//!
//! Workspace and cache setup, engine construction and the merged working set
//! are needed by most commands, so they live here.

use std::path::Path;
use std::sync::Arc;

use miette::{IntoDiagnostic, Result};

use crate::cli::GlobalOpts;
use crate::core::cache::{CacheStore, SqliteStorage};
use crate::core::engine::SourceEngine;
use crate::core::merge::{MergedRecord, SortSpec};
use crate::core::project::Project;
use crate::core::remote::{MemoryBackend, RemoteStore};
use crate::core::source::SourceConfig;
use crate::core::working_set::WorkingSet;
use crate::core::Config;

/// Single-threaded runtime driving the engine
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .into_diagnostic()
}

/// Locate the workspace and load its layered configuration
pub fn open_workspace(global: &GlobalOpts) -> Result<(Project, Config)> {
    let project = match &global.project {
        Some(path) => Project::discover_from(path),
        None => Project::discover(),
    }
    .map_err(|e| miette::miette!("{}", e))?;
    let config = Config::load_for(&project);
    Ok((project, config))
}

/// Open the workspace's persisted snapshot cache
pub fn open_cache(project: &Project, config: &Config) -> Result<Arc<CacheStore>> {
    let storage = SqliteStorage::open(&project.cache_path(), Some(config.storage_quota()))
        .map_err(|e| miette::miette!("Failed to open cache: {}", e))?;
    Ok(Arc::new(CacheStore::new(storage, config.retention())))
}

/// Every configured source followed by the exclusion source
pub fn all_sources(config: &Config) -> Vec<SourceConfig> {
    let mut sources = config.sources();
    sources.push(config.exclusion().source);
    sources
}

/// Resolve source names given on the command line; empty means all
pub fn select_sources(config: &Config, names: &[String]) -> Result<Vec<SourceConfig>> {
    if names.is_empty() {
        return Ok(all_sources(config));
    }
    names
        .iter()
        .map(|name| {
            config
                .source(name)
                .ok_or_else(|| miette::miette!("Unknown source '{}'", name))
        })
        .collect()
}

pub fn build_engine(
    source: SourceConfig,
    remote: &Arc<dyn RemoteStore>,
    cache: &Arc<CacheStore>,
    config: &Config,
) -> Arc<SourceEngine> {
    Arc::new(
        SourceEngine::new(source, remote.clone(), cache.clone()).with_page_size(config.page_size()),
    )
}

/// Engines over the cached snapshots, in `all_sources` order
///
/// The engines are offline: their remote is empty and never asked for rows.
/// Sources without a fresh cache entry stay empty.
pub fn cached_engines(config: &Config, cache: &Arc<CacheStore>) -> Vec<Arc<SourceEngine>> {
    let offline: Arc<dyn RemoteStore> = Arc::new(MemoryBackend::new());
    all_sources(config)
        .into_iter()
        .map(|source| {
            let engine = build_engine(source, &offline, cache, config);
            engine.load_cached();
            engine
        })
        .collect()
}

/// Follow `engines` (laid out as `all_sources` returns them) as a working set
pub fn working_set(config: &Config, engines: &[Arc<SourceEngine>]) -> Result<WorkingSet> {
    let (exclusion, sources) = engines
        .split_last()
        .ok_or_else(|| miette::miette!("No sources configured"))?;
    Ok(WorkingSet::new(sources, exclusion, config.exclusion()))
}

/// Merge the cached snapshots into the working set
pub fn cached_working_set(
    config: &Config,
    cache: &Arc<CacheStore>,
    sort: Option<&SortSpec>,
) -> Result<Vec<MergedRecord>> {
    let engines = cached_engines(config, cache);
    let merged = working_set(config, &engines)?.current(sort);
    Ok(Arc::unwrap_or_clone(merged))
}

/// Truncate a string to max_len characters, adding "..." if truncated
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Display a path relative to the workspace when possible
pub fn display_path(project: &Project, path: &Path) -> String {
    path.strip_prefix(project.root())
        .unwrap_or(path)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 8), "hello...");
        assert_eq!(truncate_str("hi", 2), "hi");
        assert_eq!(truncate_str("escritorio ñandú", 10), "escrito...");
    }

    #[test]
    fn test_select_sources() {
        let config = Config::default();
        assert_eq!(select_sources(&config, &[]).unwrap().len(), 4);

        let picked = select_sources(&config, &["itea".to_string()]).unwrap();
        assert_eq!(picked[0].table, "public.itea_assets");

        assert!(select_sources(&config, &["nope".to_string()]).is_err());
    }
}
