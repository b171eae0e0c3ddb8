//! `custody replay` command - Drive the realtime path from a change log
//!
//! Each line of the log is one committed change:
//! `{"table": "...", "eventType": "update", "new": {...}, "old": {...}}`.
//! Changes are committed to the backend loaded from `--remote`, delivered to
//! the open channels and folded into the cached snapshots. Renames on the
//! reference tables are propagated into every source. The merged working set
//! is followed throughout and its size reported at the end.

use std::path::PathBuf;
use std::sync::Arc;

use console::style;
use miette::{IntoDiagnostic, Result};
use serde::Deserialize;
use tracing::warn;

use crate::cli::helpers::{
    all_sources, build_engine, open_cache, open_workspace, runtime, working_set,
};
use crate::cli::GlobalOpts;
use crate::core::engine::LiveSource;
use crate::core::propagation::PropagationEngine;
use crate::core::remote::{ChangeNotification, MemoryBackend, RemoteStore};
use crate::core::Config;

#[derive(clap::Args, Debug)]
pub struct ReplayArgs {
    /// Change log with one JSON change per line
    pub events: PathBuf,

    /// Backend directory with one JSON row array per table
    #[arg(long, short = 'r')]
    pub remote: PathBuf,
}

#[derive(Debug, Deserialize)]
struct LoggedChange {
    table: String,
    #[serde(flatten)]
    change: ChangeNotification,
}

/// Counters printed once the log is exhausted
#[derive(Debug, Default)]
struct ReplaySummary {
    committed: usize,
    rejected: usize,
    applied: usize,
    renames: usize,
    rewritten: usize,
}

/// Column identifying rows of `table`
fn key_column(config: &Config, table: &str) -> String {
    all_sources(config)
        .into_iter()
        .find(|s| s.table == table)
        .map(|s| s.fields.primary_key)
        .or_else(|| {
            config
                .references()
                .into_iter()
                .find(|r| r.table == table)
                .map(|r| r.id_column)
        })
        .unwrap_or_else(|| "id".to_string())
}

fn parse_log(contents: &str) -> Result<Vec<LoggedChange>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .map_err(|e| miette::miette!("Invalid change on line {}: {}", n + 1, e))
        })
        .collect()
}

pub fn run(args: ReplayArgs, global: &GlobalOpts) -> Result<()> {
    let (project, config) = open_workspace(global)?;
    let cache = open_cache(&project, &config)?;

    let contents = std::fs::read_to_string(&args.events).into_diagnostic()?;
    let log = parse_log(&contents)?;

    let backend = MemoryBackend::load_dir(&args.remote)
        .map_err(|e| miette::miette!("Failed to load backend from {}: {}", args.remote.display(), e))?;
    let remote: Arc<dyn RemoteStore> = Arc::new(backend.clone());

    let engines: Vec<_> = all_sources(&config)
        .into_iter()
        .map(|source| build_engine(source, &remote, &cache, &config))
        .collect();

    let rt = runtime()?;
    let mut live: Vec<LiveSource> = Vec::new();
    for engine in &engines {
        match rt.block_on(engine.activate(&backend, &backend)) {
            Some(source) => live.push(source),
            None => {
                let state = engine.state();
                let reason = state
                    .error
                    .unwrap_or_else(|| format!("source is {}", state.phase));
                println!(
                    "{} {} not live: {}",
                    style("!").yellow(),
                    engine.name(),
                    reason
                );
            }
        }
    }
    if live.is_empty() {
        return Err(miette::miette!("No source could be brought live"));
    }

    let propagation = PropagationEngine::new(engines.clone(), config.references())
        .with_batching(config.batch_size(), config.batch_yield());
    let mut references = propagation
        .watch(&backend)
        .map_err(|e| miette::miette!("Failed to watch reference tables: {}", e))?;

    let mut working = working_set(&config, &engines)?;
    let before = working.current(None).len();

    let mut summary = ReplaySummary::default();
    for entry in &log {
        let key = key_column(&config, &entry.table);
        if let Err(e) = backend.commit(&entry.table, &key, &entry.change) {
            warn!(table = %entry.table, error = %e, "change rejected by backend");
            summary.rejected += 1;
            continue;
        }
        summary.committed += 1;

        for source in live.iter_mut() {
            summary.applied += source.apply_pending();
        }
        for report in rt.block_on(propagation.apply_pending(&mut references)) {
            summary.renames += 1;
            summary.rewritten += report.rewritten;
            if !global.quiet {
                println!(
                    "{} {} {} renamed to '{}': {} record(s) in {} batch(es)",
                    style("→").blue(),
                    report.kind,
                    report.id,
                    report.name,
                    report.rewritten,
                    report.batches
                );
            }
        }
    }

    println!(
        "{} Replayed {} change(s): {} applied to snapshots, {} rename(s) rewrote {} record(s)",
        style("✓").green(),
        summary.committed,
        summary.applied,
        summary.renames,
        summary.rewritten
    );
    if working.has_changed() {
        println!(
            "{} Working set: {} -> {} record(s)",
            style("→").blue(),
            before,
            working.current(None).len()
        );
    }
    if summary.rejected > 0 {
        println!(
            "{} {} change(s) rejected by the backend",
            style("!").yellow(),
            summary.rejected
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::remote::ChangeKind;

    #[test]
    fn test_parse_log_skips_blank_lines() {
        let log = parse_log(
            r#"{"table": "public.areas", "eventType": "UPDATE", "new": {"id": 1, "name": "Ops"}}

{"table": "public.inea_assets", "eventType": "delete", "old": {"id": 4}}
"#,
        )
        .unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].table, "public.areas");
        assert_eq!(log[0].change.event_type, ChangeKind::Update);
        assert!(log[1].change.new.is_none());
    }

    #[test]
    fn test_parse_log_reports_line() {
        let err = parse_log("{\"table\": \"t\"}\nnot json").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_key_column_lookup() {
        let config = Config::default();
        assert_eq!(key_column(&config, "public.inea_assets"), "id");
        assert_eq!(key_column(&config, "public.areas"), "id");
        assert_eq!(key_column(&config, "public.unknown"), "id");
    }
}
