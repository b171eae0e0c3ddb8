//! `custody list` command - Show the merged working set from cached snapshots

use console::style;
use miette::Result;

use crate::cli::helpers::{cached_working_set, open_cache, open_workspace};
use crate::cli::table::print_records;
use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::merge::{matches_query, MergedRecord, SortSpec};

#[derive(clap::Args, Debug)]
pub struct ListArgs {
    /// Field to sort by (e.g. tag, description, custodian, area, value)
    #[arg(long, short = 's')]
    pub sort: Option<String>,

    /// Sort in descending order
    #[arg(long, requires = "sort")]
    pub desc: bool,

    /// Only show records whose text fields contain this
    #[arg(long)]
    pub search: Option<String>,

    /// Only show records from this source
    #[arg(long)]
    pub source: Option<String>,

    /// Output format
    #[arg(long, short = 'f', value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

pub fn run(args: ListArgs, global: &GlobalOpts) -> Result<()> {
    let (project, config) = open_workspace(global)?;
    let cache = open_cache(&project, &config)?;

    if let Some(source) = &args.source {
        if config.sources().iter().all(|s| &s.name != source) {
            return Err(miette::miette!("Unknown source '{}'", source));
        }
    }

    let sort = args.sort.as_deref().map(|field| {
        if args.desc {
            SortSpec::desc(field)
        } else {
            SortSpec::asc(field)
        }
    });

    let mut records: Vec<MergedRecord> = cached_working_set(&config, &cache, sort.as_ref())?;
    if let Some(source) = &args.source {
        records.retain(|r| &r.source == source);
    }
    if let Some(query) = &args.search {
        records.retain(|r| matches_query(r, query));
    }

    if records.is_empty() && args.format == OutputFormat::Table && !global.quiet {
        let uncached: Vec<String> = config
            .sources()
            .into_iter()
            .filter(|s| cache.read(&s.name).is_none())
            .map(|s| s.name)
            .collect();
        if !uncached.is_empty() {
            println!(
                "{} No fresh snapshot for: {}",
                style("!").yellow(),
                uncached.join(", ")
            );
        }
    }

    print_records(&records, args.format, global.quiet)
}
