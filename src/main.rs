//! idu - determine disk usage incrementally using a database
//!
//! Entry point for the CLI application.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{ArgAction, Parser, Subcommand};
use idu::aggregate::{self, Filter};
use idu::config::{Config, PrefixEntry};
use idu::db::{Database, Options};
use idu::progress::{print_scan_summary, ProgressReporter, ScanSnapshot};
use idu::report::{self, Units};
use idu::walker::{CancelToken, Walker};
use regex::Regex;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "idu",
    version,
    about = "Determine disk usage incrementally using a database",
    long_about = "Walks the configured filesystem prefixes, keeps one record per directory\n\
                  in an embedded database, and answers summary queries from it. Repeated\n\
                  scans only re-stat entries whose listing metadata changed."
)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<String>,

    /// Higher values show more debugging output
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Display usage in decimal (kB) or binary (KiB) units
    #[arg(long, global = true, value_enum, default_value_t = Units::Decimal)]
    units: Units,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze the file system to build a database of file counts, disk usage etc
    Analyze {
        /// Directories or prefixes to scan
        #[arg(required = true, value_name = "DIRECTORY")]
        directories: Vec<String>,

        /// Show a progress spinner while scanning
        #[arg(short, long)]
        progress: bool,
    },

    /// Summarize file count and disk usage
    Summary {
        #[arg(value_name = "DIRECTORY")]
        directory: String,

        /// Number of top prefixes to show
        #[arg(long, default_value_t = 20)]
        top: usize,

        /// Write a TSV summary to this file
        #[arg(long, value_name = "FILE")]
        tsv: Option<PathBuf>,
    },

    /// Summarize file count and disk usage on a per user basis
    User {
        #[arg(value_name = "DIRECTORY")]
        directory: String,

        /// User ids to report on
        #[arg(value_name = "UID")]
        ids: Vec<u32>,

        /// Report on every user found in the database
        #[arg(long)]
        all: bool,

        /// Number of top prefixes to show
        #[arg(long, default_value_t = 20)]
        top: usize,
    },

    /// Summarize file count and disk usage on a per group basis
    Group {
        #[arg(value_name = "DIRECTORY")]
        directory: String,

        /// Group ids to report on
        #[arg(value_name = "GID")]
        ids: Vec<u32>,

        /// Report on every group found in the database
        #[arg(long)]
        all: bool,

        /// Number of top prefixes to show
        #[arg(long, default_value_t = 20)]
        top: usize,
    },

    /// Find prefixes and error records in the statistics database
    Find {
        #[arg(value_name = "DIRECTORY")]
        directory: String,

        /// Regular expressions to match against keys
        #[arg(value_name = "EXPRESSION")]
        expressions: Vec<String>,

        /// Search the error log instead of the data namespace
        #[arg(long)]
        errors: bool,
    },

    /// List the contents of the database
    Lsr {
        #[arg(value_name = "PREFIX")]
        directory: String,

        /// Show per-record details
        #[arg(short, long)]
        long: bool,
    },

    /// Describe the current configuration
    Config,

    /// Database management commands
    Database {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommand {
    /// Display database statistics
    Stats {
        #[arg(value_name = "DIRECTORY")]
        directory: String,
    },

    /// Erase the database for a prefix
    Erase {
        #[arg(value_name = "DIRECTORY")]
        directory: String,

        /// Required confirmation
        #[arg(long)]
        really: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(verbose: u8) {
    let filter = match verbose {
        0 => "idu=warn",
        1 => "idu=info",
        2 => "idu=debug",
        _ => "idu=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn config_path(cli: &Cli) -> String {
    cli.config.clone().unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_default();
        format!("{home}/.idu.yml")
    })
}

fn run(cli: Cli) -> Result<()> {
    let cfg = Config::read(&config_path(&cli))?;
    let units = cli.units;
    match cli.command {
        Command::Analyze {
            ref directories,
            progress,
        } => analyze(&cfg, directories, progress),
        Command::Summary {
            ref directory,
            top,
            ref tsv,
        } => summary(&cfg, directory, top, tsv.as_deref(), units),
        Command::User {
            ref directory,
            ref ids,
            all,
            top,
        } => owner_summary(&cfg, directory, ids, all, top, units, true),
        Command::Group {
            ref directory,
            ref ids,
            all,
            top,
        } => owner_summary(&cfg, directory, ids, all, top, units, false),
        Command::Find {
            ref directory,
            ref expressions,
            errors,
        } => find(&cfg, directory, expressions, errors),
        Command::Lsr {
            ref directory,
            long,
        } => lsr(&cfg, directory, long, units),
        Command::Config => describe_config(&cfg),
        Command::Database { command } => match command {
            DbCommand::Stats { ref directory } => db_stats(&cfg, directory),
            DbCommand::Erase {
                ref directory,
                really,
            } => db_erase(&cfg, directory, really),
        },
    }
}

fn route<'a>(cfg: &'a Config, path: &str) -> Result<&'a PrefixEntry> {
    cfg.for_prefix(path)
        .ok_or_else(|| anyhow!("no configured prefix matches {path}"))
}

fn open_read_only(entry: &PrefixEntry) -> Result<Database> {
    Database::open(&entry.database, &entry.prefix, Options::new().read_only())
        .with_context(|| format!("failed to open database {}", entry.database))
}

fn analyze(cfg: &Config, directories: &[String], progress: bool) -> Result<()> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\ninterrupted, stopping scan...");
        handler_token.cancel();
    })
    .context("failed to set signal handler")?;

    for dir in directories {
        let entry = route(cfg, dir)?;
        if entry.set_max_threads != 0 {
            info!(
                set_max_threads = entry.set_max_threads,
                "set_max_threads has no effect on this runtime"
            );
        }
        if let Some(parent) = std::path::Path::new(&entry.database).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let db = Arc::new(
            Database::open(&entry.database, &entry.prefix, Options::new())
                .with_context(|| format!("failed to open database {}", entry.database))?,
        );

        let walker = Walker::new(entry.clone(), Arc::clone(&db), cancel.clone());
        let counters = walker.counters();
        let begin = Instant::now();
        let start = Utc::now();

        let done = Arc::new(AtomicBool::new(false));
        let reporter = progress.then(|| {
            let done = Arc::clone(&done);
            let counters = Arc::clone(&counters);
            std::thread::spawn(move || {
                let bar = ProgressReporter::new();
                while !done.load(Ordering::Relaxed) {
                    bar.update(&counters.snapshot(), begin.elapsed());
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
                bar.finish_and_clear();
            })
        });

        let result = walker.run(dir);
        done.store(true, Ordering::Relaxed);
        if let Some(handle) = reporter {
            let _ = handle.join();
        }

        let snapshot = counters.snapshot();
        if result.is_ok() {
            let calc = entry.calculator();
            match aggregate::aggregate(&db, &*calc, &entry.prefix, 0, Filter::Global) {
                Ok(agg) => aggregate::store(&db, &agg)?,
                Err(e) => error!("aggregation after scan failed: {e}"),
            }
        }
        let detail = bincode::serialize(&snapshot).expect("snapshot always serializes");
        db.log_and_close(start, Utc::now(), &detail)
            .context("failed to record scan log")?;

        match result {
            Ok(snap) => print_scan_summary(dir, &snap, begin.elapsed()),
            Err(e) => return Err(e).with_context(|| format!("scan of {dir} failed")),
        }
    }
    Ok(())
}

fn summary(
    cfg: &Config,
    directory: &str,
    top: usize,
    tsv: Option<&std::path::Path>,
    units: Units,
) -> Result<()> {
    let entry = route(cfg, directory)?;
    let db = open_read_only(entry)?;
    let calc = entry.calculator();
    let agg = aggregate::aggregate(&db, &*calc, directory, top, Filter::Global)?;
    let errors = db.counts()?.errors;
    report::print_summary(&agg, errors, units);

    if let Some(path) = tsv {
        let mut out = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        report::write_tsv(&mut out, &db, directory, &agg, errors)?;
        println!("wrote {}", path.display());
    }
    Ok(())
}

fn owner_summary(
    cfg: &Config,
    directory: &str,
    ids: &[u32],
    all: bool,
    top: usize,
    units: Units,
    by_user: bool,
) -> Result<()> {
    let entry = route(cfg, directory)?;
    let db = open_read_only(entry)?;
    let calc = entry.calculator();
    let label = if by_user { "user" } else { "group" };

    if all {
        let agg = aggregate::aggregate(&db, &*calc, directory, top, Filter::Global)?;
        let rollups = if by_user { &agg.by_uid } else { &agg.by_gid };
        for (id, totals) in rollups {
            report::print_owner(label, *id, totals, units);
        }
        return Ok(());
    }

    if ids.is_empty() {
        bail!("no {label} specified; pass ids or --all");
    }
    for &id in ids {
        let filter = if by_user {
            Filter::User(id)
        } else {
            Filter::Group(id)
        };
        let agg = aggregate::aggregate(&db, &*calc, directory, top, filter)?;
        report::print_owner(label, id, &agg.totals, units);
        report::print_metrics("disk usage", &agg.top_bytes, true, units);
    }
    Ok(())
}

fn find(cfg: &Config, directory: &str, expressions: &[String], errors: bool) -> Result<()> {
    let entry = route(cfg, directory)?;
    let db = open_read_only(entry)?;
    let regexps = expressions
        .iter()
        .map(|e| Regex::new(e).with_context(|| format!("invalid expression {e}")))
        .collect::<Result<Vec<_>>>()?;
    let matches = |key: &str| regexps.is_empty() || regexps.iter().any(|re| re.is_match(key));

    if errors {
        let from = Utc.timestamp_opt(0, 0).unwrap();
        db.visit_errors_when(from, Utc::now() + chrono::Duration::days(1), |when, key, detail| {
            if matches(key) {
                println!("{} {} {}", when.to_rfc3339(), key, String::from_utf8_lossy(detail));
            }
            true
        })?;
        return Ok(());
    }

    db.scan(directory, |key, _| {
        if !key.starts_with(directory) {
            return false;
        }
        if matches(key) {
            println!("{key}");
        }
        true
    })?;
    Ok(())
}

fn lsr(cfg: &Config, directory: &str, long: bool, units: Units) -> Result<()> {
    let entry = route(cfg, directory)?;
    let db = open_read_only(entry)?;
    db.scan(directory, |key, raw| {
        if !key.starts_with(directory) {
            return false;
        }
        if !long {
            println!("{key}");
            return true;
        }
        match idu::PrefixInfo::decode(raw) {
            Ok(pi) => {
                let files = pi.files.iter().filter(|f| !f.is_dir()).count();
                let dirs = pi.files.len() - files;
                let bytes: i64 = pi.files.iter().filter(|f| !f.is_dir()).map(|f| f.size).sum();
                println!(
                    "{key}: uid={} gid={} files={files} dirs={dirs} size={} modified={}",
                    pi.uid,
                    pi.gid,
                    report::fsize(bytes, units),
                    pi.modified().to_rfc3339(),
                );
            }
            Err(e) => println!("{key}: unreadable record: {e}"),
        }
        true
    })?;
    Ok(())
}

fn describe_config(cfg: &Config) -> Result<()> {
    for entry in &cfg.prefixes {
        println!("prefix: {}", entry.prefix);
        println!("  database: {}", entry.database);
        println!("  separator: {:?}", entry.separator);
        println!("  concurrent_scans: {}", entry.concurrent_scans);
        println!("  concurrent_stats: {}", entry.concurrent_stats);
        println!(
            "  concurrent_stats_threshold: {}",
            entry.concurrent_stats_threshold
        );
        println!("  scan_size: {}", entry.effective_scan_size());
        println!("  exclusions: {:?}", entry.exclusions);
        println!(
            "  count_hardlinks_as_files: {}",
            entry.count_hardlinks_as_files
        );
        println!("  calculator: {}", entry.calculator().name());
        println!();
    }
    Ok(())
}

fn db_stats(cfg: &Config, directory: &str) -> Result<()> {
    let entry = route(cfg, directory)?;
    let db = open_read_only(entry)?;
    let counts = db.counts()?;
    println!("prefix: {}", entry.prefix);
    println!("  records: {}", counts.data);
    println!("  scan logs: {}", counts.logs);
    println!("  errors: {}", counts.errors);
    println!("  stats entries: {}", counts.stats);

    match db.last_log() {
        Ok((start, stop, detail)) => {
            println!("  last scan: {} .. {}", start.to_rfc3339(), stop.to_rfc3339());
            if let Ok(snap) = bincode::deserialize::<ScanSnapshot>(&detail) {
                println!(
                    "    dirs={} files={} reused={} stats={} errors={}",
                    snap.dirs, snap.files, snap.reused, snap.stats, snap.errors
                );
            }
        }
        Err(idu::Error::NotFound) => println!("  last scan: never"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn db_erase(cfg: &Config, directory: &str, really: bool) -> Result<()> {
    if !really {
        bail!("refusing to erase without --really");
    }
    let entry = route(cfg, directory)?;
    let db = Database::open(&entry.database, &entry.prefix, Options::new())
        .with_context(|| format!("failed to open database {}", entry.database))?;
    db.erase()?;
    db.close()?;
    println!("erased database for {}", entry.prefix);
    Ok(())
}
