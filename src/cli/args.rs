//! CLI argument definitions using clap derive

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::cli::commands::{
    cache::CacheCommands, index::IndexArgs, init::InitArgs, list::ListArgs, replay::ReplayArgs,
    select::SelectArgs,
};

#[derive(Parser)]
#[command(name = "custody")]
#[command(author, version, about = "Custody asset index")]
#[command(long_about = "Index asset registers into a local snapshot cache, keep it consistent with change notifications, and query the merged working set.")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global: GlobalOpts,
}

#[derive(clap::Args, Clone, Debug)]
pub struct GlobalOpts {
    /// Suppress non-essential output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Enable debug logging (overridden by CUSTODY_LOG)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Workspace root (default: auto-detect by finding .custody/)
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new custody workspace
    Init(InitArgs),

    /// Rebuild source snapshots from a backend directory
    Index(IndexArgs),

    /// Inspect or clear the snapshot cache
    #[command(subcommand)]
    Cache(CacheCommands),

    /// List the merged working set from cached snapshots
    List(ListArgs),

    /// Apply a log of committed changes through the realtime path
    Replay(ReplayArgs),

    /// Build a custody selection and report lock conflicts
    Select(SelectArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Aligned table for terminals
    #[default]
    Table,
    /// Tab-separated values (for piping)
    Tsv,
    /// JSON format (for programming)
    Json,
}
