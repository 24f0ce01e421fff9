//! Progress reporting for the scan engine
//!
//! Workers tick shared atomic counters; the reporter and the scan summary
//! take snapshots. No locks on the hot path.

use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared counters ticked by scan workers.
#[derive(Debug, Default)]
pub struct ScanCounters {
    /// Directories processed.
    pub dirs: AtomicU64,
    /// Entries recorded.
    pub files: AtomicU64,
    /// Logical bytes recorded.
    pub bytes: AtomicU64,
    /// Entries reused from the prior scan without a stat.
    pub reused: AtomicU64,
    /// Stat calls issued.
    pub stats: AtomicU64,
    /// Directories whose changed entries were statted sequentially.
    pub sync_dirs: AtomicU64,
    /// Directories whose changed entries were statted by the stat pool.
    pub parallel_dirs: AtomicU64,
    /// Per-path errors recorded.
    pub errors: AtomicU64,
}

impl ScanCounters {
    pub fn snapshot(&self) -> ScanSnapshot {
        ScanSnapshot {
            dirs: self.dirs.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            stats: self.stats.load(Ordering::Relaxed),
            sync_dirs: self.sync_dirs.load(Ordering::Relaxed),
            parallel_dirs: self.parallel_dirs.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the scan counters. Serialized into the scan
/// log as the run's detail record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub dirs: u64,
    pub files: u64,
    pub bytes: u64,
    pub reused: u64,
    pub stats: u64,
    pub sync_dirs: u64,
    pub parallel_dirs: u64,
    pub errors: u64,
}

impl ScanSnapshot {
    pub fn rate(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.files + self.dirs) as f64 / secs
        } else {
            0.0
        }
    }
}

/// Spinner-based progress display fed from counter snapshots.
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    pub fn update(&self, snap: &ScanSnapshot, elapsed: Duration) {
        let msg = format!(
            "Dirs: {} | Entries: {} | Size: {} | Reused: {} | Stats: {} | Rate: {:.0}/s{}",
            format_number(snap.dirs),
            format_number(snap.files),
            format_size(snap.bytes, BINARY),
            format_number(snap.reused),
            format_number(snap.stats),
            snap.rate(elapsed),
            if snap.errors > 0 {
                format!(" | Errors: {}", snap.errors)
            } else {
                String::new()
            },
        );
        self.bar.set_message(msg);
    }

    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Print the end-of-scan summary for one prefix.
pub fn print_scan_summary(root: &str, snap: &ScanSnapshot, elapsed: Duration) {
    use console::style;

    println!();
    println!("{} {}", style("Scan complete").green().bold(), root);
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Directories:").bold(), format_number(snap.dirs));
    println!("  {} {}", style("Files:").bold(), format_number(snap.files));
    println!(
        "  {} {}",
        style("Total size:").bold(),
        format_size(snap.bytes, BINARY)
    );
    println!(
        "  {} {} reused, {} statted",
        style("Incremental:").bold(),
        format_number(snap.reused),
        format_number(snap.stats)
    );
    println!(
        "  {} {:.1}s ({:.0} entries/sec)",
        style("Duration:").bold(),
        elapsed.as_secs_f64(),
        snap.rate(elapsed)
    );
    if snap.errors > 0 {
        println!(
            "  {} {}",
            style("Errors:").yellow().bold(),
            format_number(snap.errors)
        );
    }
    println!();
}

/// Format a number with thousands separators.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();
    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();
    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}
