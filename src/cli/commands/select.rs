//! `custody select` command - Build a custody selection from the working set
//!
//! Records are toggled in the order given. The first record locks the
//! custodian and area; a record that disagrees stops the command with the
//! conflict kind.

use console::style;
use miette::Result;

use crate::cli::helpers::{cached_working_set, open_cache, open_workspace};
use crate::cli::table::print_records;
use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::merge::{matches_query, MergedRecord};
use crate::core::record::RecordKey;
use crate::core::selection::{SelectionSet, Toggled};

#[derive(clap::Args, Debug)]
pub struct SelectArgs {
    /// Record keys to toggle, in order
    pub keys: Vec<String>,

    /// Source the keys belong to (required when a key exists in several)
    #[arg(long)]
    pub source: Option<String>,

    /// Select every visible record (after --search) before the keys
    #[arg(long)]
    pub all: bool,

    /// Restrict the visible records for --all
    #[arg(long)]
    pub search: Option<String>,

    /// Output format for the resulting selection
    #[arg(long, short = 'f', value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

fn find<'a>(
    records: &'a [MergedRecord],
    key: &RecordKey,
    source: Option<&str>,
) -> Result<&'a MergedRecord> {
    let matches: Vec<&MergedRecord> = records
        .iter()
        .filter(|r| r.record.id.canonical() == key.canonical())
        .filter(|r| source.map_or(true, |s| r.source == s))
        .collect();

    match matches.as_slice() {
        [] => Err(miette::miette!(
            "No available record with key '{}'{}",
            key,
            source.map(|s| format!(" in {}", s)).unwrap_or_default()
        )),
        [only] => Ok(*only),
        many => Err(miette::miette!(
            "Key '{}' exists in {}; pass --source",
            key,
            many.iter()
                .map(|r| r.source.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )),
    }
}

pub fn run(args: SelectArgs, global: &GlobalOpts) -> Result<()> {
    let (project, config) = open_workspace(global)?;
    let cache = open_cache(&project, &config)?;
    let records = cached_working_set(&config, &cache, None)?;

    let mut selection = SelectionSet::new();

    if args.all {
        let visible: Vec<MergedRecord> = records
            .iter()
            .filter(|r| args.source.as_deref().map_or(true, |s| r.source == s))
            .filter(|r| args.search.as_deref().map_or(true, |q| matches_query(r, q)))
            .cloned()
            .collect();
        selection.select_all_visible(&visible).map_err(|conflict| {
            miette::miette!("{}: {}", conflict.kind(), conflict)
        })?;
    }

    for raw in &args.keys {
        let key: RecordKey = raw.parse().map_err(|e| miette::miette!("{}", e))?;
        let record = find(&records, &key, args.source.as_deref())?;
        match selection.toggle(record) {
            Ok(Toggled::Added) => {}
            Ok(Toggled::Removed) => {
                if !global.quiet {
                    println!("{} {} removed from selection", style("→").blue(), key);
                }
            }
            Err(conflict) => {
                return Err(miette::miette!("{}: {}", conflict.kind(), conflict));
            }
        }
    }

    if args.format == OutputFormat::Table && !global.quiet {
        let custodian = selection.locked_custodian().unwrap_or("(none)");
        let area = selection
            .locked_area()
            .map(|a| a.name.as_str())
            .unwrap_or("(none)");
        println!(
            "{} {} record(s) selected for {} in {}",
            style("✓").green(),
            style(selection.len()).cyan(),
            style(custodian).cyan(),
            style(area).cyan()
        );
    }

    let chosen: Vec<MergedRecord> = selection
        .submit()
        .into_iter()
        .map(|item| MergedRecord {
            source: item.source,
            record: item.record,
        })
        .collect();
    print_records(&chosen, args.format, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::IndexedRecord;

    fn record(source: &str, id: i64) -> MergedRecord {
        MergedRecord {
            source: source.to_string(),
            record: IndexedRecord::new(id),
        }
    }

    #[test]
    fn test_find_requires_source_for_shared_keys() {
        let records = vec![record("inea", 1), record("itea", 1), record("itea", 2)];

        assert!(find(&records, &RecordKey::Int(1), None).is_err());
        assert_eq!(
            find(&records, &RecordKey::Int(1), Some("itea")).unwrap().source,
            "itea"
        );
        assert!(find(&records, &RecordKey::Int(2), None).is_ok());
        assert!(find(&records, &RecordKey::Int(3), None).is_err());
    }

    #[test]
    fn test_find_matches_text_keys_by_canonical_form() {
        let records = vec![record("inea", 42)];
        assert!(find(&records, &RecordKey::Text("42".to_string()), None).is_ok());
    }
}
