//! `custody index` command - Rebuild source snapshots from a backend export
//!
//! The backend is a directory holding one `<table>.json` row array per table
//! and an optional `session.json`.

use std::path::PathBuf;
use std::sync::Arc;

use console::style;
use miette::Result;

use crate::cli::helpers::{build_engine, open_cache, open_workspace, runtime, select_sources};
use crate::cli::GlobalOpts;
use crate::core::engine::IndexOutcome;
use crate::core::remote::{has_session, MemoryBackend, RemoteStore};

#[derive(clap::Args, Debug)]
pub struct IndexArgs {
    /// Sources to index (default: all, including the exclusion source)
    pub sources: Vec<String>,

    /// Backend directory with one JSON row array per table
    #[arg(long, short = 'r')]
    pub remote: PathBuf,

    /// Drop each cache entry before indexing instead of keeping it on failure
    #[arg(long)]
    pub fresh: bool,
}

pub fn run(args: IndexArgs, global: &GlobalOpts) -> Result<()> {
    let (project, config) = open_workspace(global)?;
    let sources = select_sources(&config, &args.sources)?;
    let cache = open_cache(&project, &config)?;

    let backend = MemoryBackend::load_dir(&args.remote)
        .map_err(|e| miette::miette!("Failed to load backend from {}: {}", args.remote.display(), e))?;
    let remote: Arc<dyn RemoteStore> = Arc::new(backend.clone());

    let rt = runtime()?;
    if !rt.block_on(has_session(&backend)) {
        return Err(miette::miette!(
            "No authenticated session; nothing was indexed"
        ));
    }

    let mut failed = 0;
    for source in sources {
        let engine = build_engine(source, &remote, &cache, &config);
        if !global.quiet {
            println!(
                "{} Indexing {} ({})",
                style("→").blue(),
                style(engine.name()).cyan(),
                engine.config().table
            );
        }

        let outcome = if args.fresh {
            rt.block_on(engine.reindex())
        } else {
            rt.block_on(engine.index_all())
        };

        match outcome {
            IndexOutcome::Indexed { records } => {
                if !global.quiet {
                    println!(
                        "{} {} record(s) cached for {}",
                        style("✓").green(),
                        style(records).cyan(),
                        engine.name()
                    );
                }
            }
            IndexOutcome::AlreadyRunning => {
                println!(
                    "{} {} is already being indexed",
                    style("!").yellow(),
                    engine.name()
                );
            }
            IndexOutcome::Failed(e) => {
                failed += 1;
                eprintln!("{} {}: {}", style("✗").red(), engine.name(), e);
            }
        }
    }

    if failed > 0 {
        return Err(miette::miette!("{} source(s) failed to index", failed));
    }
    Ok(())
}
