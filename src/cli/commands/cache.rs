//! `custody cache` command - Inspect and clear the snapshot cache
//!
//! The cache is a local SQLite database holding one snapshot per source. It is
//! user-local (gitignored) and rebuilt by `custody index`.

use clap::Subcommand;
use console::style;
use miette::Result;

use crate::cli::helpers::{display_path, open_cache, open_workspace, select_sources};
use crate::cli::GlobalOpts;

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show cached snapshots and storage usage
    Status,

    /// Remove cached snapshots (default: every source)
    Clear {
        /// Sources to clear
        sources: Vec<String>,
    },
}

pub fn run(cmd: CacheCommands, global: &GlobalOpts) -> Result<()> {
    match cmd {
        CacheCommands::Status => run_status(global),
        CacheCommands::Clear { sources } => run_clear(&sources, global),
    }
}

fn run_status(global: &GlobalOpts) -> Result<()> {
    let (project, config) = open_workspace(global)?;
    let cache = open_cache(&project, &config)?;
    let stats = cache
        .statistics()
        .map_err(|e| miette::miette!("Failed to read cache statistics: {}", e))?;

    println!("{}", style("Cache Status").bold());
    println!("{}", style("─".repeat(40)).dim());
    println!(
        "  Location:   {}",
        display_path(&project, &project.cache_path())
    );
    println!("  Retention:  {} day(s)", config.retention().num_days());
    match stats.quota_bytes {
        Some(quota) => println!(
            "  Size:       {} / {} KB",
            style(stats.total_bytes / 1024).cyan(),
            quota / 1024
        ),
        None => println!("  Size:       {} KB", style(stats.total_bytes / 1024).cyan()),
    }

    if stats.entries.is_empty() {
        println!();
        println!("  No cached snapshots. Run {}", style("custody index").yellow());
        return Ok(());
    }

    println!();
    println!("  {}", style("Snapshots:").bold());
    for entry in &stats.entries {
        let saved = entry
            .saved_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let state = if entry.expired {
            style("expired").red()
        } else {
            style("fresh").green()
        };
        println!(
            "    {:<10} {:>7} records  {:>6} KB  {}  {}",
            entry.source,
            entry.records,
            entry.bytes / 1024,
            saved,
            state
        );
    }

    Ok(())
}

fn run_clear(sources: &[String], global: &GlobalOpts) -> Result<()> {
    let (project, config) = open_workspace(global)?;
    let sources = select_sources(&config, sources)?;
    let cache = open_cache(&project, &config)?;

    for source in &sources {
        cache.clear(&source.name);
    }

    if !global.quiet {
        println!(
            "{} Cleared {} cached snapshot(s)",
            style("✓").green(),
            sources.len()
        );
    }
    Ok(())
}
