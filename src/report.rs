//! Report rendering
//!
//! Text summaries for the terminal and TSV export for downstream tooling.

use crate::aggregate::{Aggregate, Metric, Totals};
use crate::db::Database;
use crate::error::Result;
use crate::prefixinfo::PrefixInfo;
use crate::progress::format_number;
use console::style;
use humansize::{format_size, BINARY, DECIMAL};
use std::io::Write;

/// Byte display format, selected by `--units`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Units {
    #[default]
    Decimal,
    Binary,
}

impl std::fmt::Display for Units {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Units::Decimal => write!(f, "decimal"),
            Units::Binary => write!(f, "binary"),
        }
    }
}

/// Format a byte count in the selected units.
pub fn fsize(size: i64, units: Units) -> String {
    let size = size.max(0) as u64;
    match units {
        Units::Decimal => format_size(size, DECIMAL),
        Units::Binary => format_size(size, BINARY),
    }
}

/// Print totals and the top-N lists for one aggregation pass.
pub fn print_summary(agg: &Aggregate, errors: u64, units: Units) {
    println!(
        "{:>20} : total disk usage",
        style(fsize(agg.totals.storage_bytes, units)).bold()
    );
    println!(
        "{:>20} : total bytes",
        fsize(agg.totals.bytes, units)
    );
    println!("{:>20} : total files", format_number(agg.totals.files as u64));
    println!(
        "{:>20} : total prefixes",
        format_number(agg.totals.prefixes as u64)
    );
    println!("{:>20} : total errors", format_number(errors));

    print_metrics("disk usage", &agg.top_bytes, true, units);
    print_metrics("file count", &agg.top_files, false, units);
    print_metrics("child count", &agg.top_children, false, units);
}

pub fn print_metrics(what: &str, metrics: &[Metric], bytes: bool, units: Units) {
    if metrics.is_empty() {
        return;
    }
    println!();
    println!("{}", style(format!("Top {} prefixes by {what}", metrics.len())).bold());
    for m in metrics {
        if bytes {
            println!("{:>20} : {}", fsize(m.value, units), m.prefix);
        } else {
            println!("{:>20} : {}", format_number(m.value.max(0) as u64), m.prefix);
        }
    }
}

/// Print one owner's rollup, as used by the `user` and `group` commands.
pub fn print_owner(label: &str, id: u32, totals: &Totals, units: Units) {
    println!();
    println!("{}", style(format!("Summary for {label} {id}")).bold());
    println!(
        "{:>20} : disk usage",
        fsize(totals.storage_bytes, units)
    );
    println!("{:>20} : files", format_number(totals.files as u64));
    println!("{:>20} : prefixes", format_number(totals.prefixes as u64));
}

/// Write a TSV summary: the root totals plus one row per prefix that
/// appeared in any top-N list. The uid column is the record owner's.
pub fn write_tsv<W: Write>(
    w: &mut W,
    db: &Database,
    root: &str,
    agg: &Aggregate,
    errors: u64,
) -> Result<()> {
    writeln!(w, "prefix\tuid\tbytes\tfiles\tdirectories\terrors")?;

    let mut rows: std::collections::BTreeMap<&str, (i64, i64, i64)> =
        std::collections::BTreeMap::new();
    rows.insert(
        root,
        (agg.totals.bytes, agg.totals.files, agg.totals.prefixes),
    );
    for m in &agg.top_bytes {
        rows.entry(&m.prefix).or_default().0 = m.value;
    }
    for m in &agg.top_files {
        rows.entry(&m.prefix).or_default().1 = m.value;
    }
    for m in &agg.top_children {
        rows.entry(&m.prefix).or_default().2 = m.value;
    }

    for (prefix, (bytes, files, dirs)) in rows {
        let uid = match db.get(prefix)? {
            Some(raw) => PrefixInfo::decode(&raw).map(|pi| pi.uid).unwrap_or(0),
            None => 0,
        };
        let row_errors = if prefix == root { errors } else { 0 };
        writeln!(w, "{prefix}\t{uid}\t{bytes}\t{files}\t{dirs}\t{row_errors}")?;
    }
    Ok(())
}
