//! Rendering of the merged working set
//!
//! The table layout truncates long text for terminals. TSV keeps every value
//! whole on one line so it can be piped, and JSON carries the full records.

use console::style;
use miette::{IntoDiagnostic, Result};
use tabled::{builder::Builder, settings::Style};

use crate::cli::helpers::truncate_str;
use crate::cli::OutputFormat;
use crate::core::merge::MergedRecord;
use crate::core::record::EntityRef;

/// Column headers shared by the table and TSV layouts
pub const COLUMNS: [&str; 9] = [
    "SOURCE",
    "ID",
    "TAG",
    "DESCRIPTION",
    "STATUS",
    "CUSTODIAN",
    "AREA",
    "DIRECTOR",
    "VALUE",
];

const DESCRIPTION_WIDTH: usize = 40;

fn entity_name(entity: Option<&EntityRef>) -> String {
    entity.map(|e| e.name.clone()).unwrap_or_default()
}

fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) if v.fract() == 0.0 => format!("{:.0}", v),
        Some(v) => format!("{:.2}", v),
        None => String::new(),
    }
}

/// Cells of one row, untruncated
pub fn row_cells(item: &MergedRecord) -> [String; 9] {
    let record = &item.record;
    [
        item.source.clone(),
        record.id.canonical(),
        record.tag.clone().unwrap_or_default(),
        record.description.clone().unwrap_or_default(),
        record.status.clone().unwrap_or_default(),
        record.custodian.clone().unwrap_or_default(),
        entity_name(record.area.as_ref()),
        entity_name(record.director.as_ref()),
        format_value(record.value),
    ]
}

/// Tab-separated rows with a header line
pub fn to_tsv(items: &[MergedRecord]) -> String {
    let clean = |cell: &str| cell.replace(['\t', '\n', '\r'], " ");

    let mut out = COLUMNS.join("\t");
    out.push('\n');
    for item in items {
        let cells: Vec<String> = row_cells(item).iter().map(|c| clean(c)).collect();
        out.push_str(&cells.join("\t"));
        out.push('\n');
    }
    out
}

/// Aligned table for terminals
pub fn to_table(items: &[MergedRecord]) -> String {
    let mut builder = Builder::default();
    builder.push_record(COLUMNS);
    for item in items {
        let mut cells = row_cells(item);
        cells[3] = truncate_str(&cells[3], DESCRIPTION_WIDTH);
        builder.push_record(cells);
    }
    builder.build().with(Style::rounded()).to_string()
}

/// Print the working set in the requested format
pub fn print_records(items: &[MergedRecord], format: OutputFormat, quiet: bool) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(items).into_diagnostic()?;
            println!("{}", json);
        }
        OutputFormat::Tsv => print!("{}", to_tsv(items)),
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No records found.");
                return Ok(());
            }
            println!("{}", to_table(items));
            if !quiet {
                println!();
                println!("{} record(s) found", style(items.len()).cyan());
            }
        }
    }
    Ok(())
}
