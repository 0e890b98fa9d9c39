//! `rollcall parse`: dry-run the roster parser on a file.

use std::path::Path;

use anyhow::{Context, Result};
use rollcall_core::RosterRecord;
use rollcall_core::roster;

fn yes_no(enabled: bool) -> &'static str {
    if enabled { "yes" } else { "no" }
}

fn format_record(record: &RosterRecord) -> String {
    format!(
        "{:<30} {:<40} analytics={} sen={} detentions={}",
        record.full_name,
        record.email,
        yes_no(record.analytics),
        yes_no(record.sen),
        yes_no(record.detentions),
    )
}

/// Prints every record found in `file`.
pub fn run(file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read roster file {}", file.display()))?;
    let records = roster::parse(&text);

    if records.is_empty() {
        println!("No roster rows found.");
        return Ok(());
    }
    for record in &records {
        println!("{}", format_record(record));
    }
    println!("{} record(s)", records.len());
    Ok(())
}
