//! Stat dispatch for changed entries
//!
//! Small change sets are statted inline on the directory worker. Once a
//! directory's changed-entry count reaches the configured threshold the
//! stats fan out over a scoped worker pool, each worker pulling the next
//! index from a shared counter.

use super::CancelToken;
use crate::error::Result;
use crate::prefixinfo::FileInfo;
use crate::progress::ScanCounters;
use parking_lot::Mutex;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One changed entry awaiting a stat. `index` is the entry's position in
/// the directory listing, preserved through the pool so the merged file
/// list keeps listing order.
#[derive(Debug)]
pub(crate) struct StatRequest {
    pub index: usize,
    pub name: String,
    pub path: PathBuf,
}

pub(crate) type StatOutcome = (usize, String, Result<FileInfo>);

/// Stat every request, sequentially or via the pool.
///
/// `workers == 0` means one worker per entry, capped at twice the CPU
/// count. Any other value bounds the pool strictly.
pub(crate) fn stat_all(
    requests: Vec<StatRequest>,
    workers: usize,
    threshold: usize,
    cancel: &CancelToken,
    counters: &ScanCounters,
) -> Result<Vec<StatOutcome>> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }
    if requests.len() < threshold {
        counters.sync_dirs.fetch_add(1, Ordering::Relaxed);
        return stat_sequential(requests, cancel, counters);
    }
    counters.parallel_dirs.fetch_add(1, Ordering::Relaxed);
    stat_parallel(requests, workers, cancel, counters)
}

fn stat_sequential(
    requests: Vec<StatRequest>,
    cancel: &CancelToken,
    counters: &ScanCounters,
) -> Result<Vec<StatOutcome>> {
    let mut out = Vec::with_capacity(requests.len());
    for req in requests {
        cancel.checkpoint()?;
        let info = stat_one(&req, counters);
        out.push((req.index, req.name, info));
    }
    Ok(out)
}

fn stat_parallel(
    requests: Vec<StatRequest>,
    workers: usize,
    cancel: &CancelToken,
    counters: &ScanCounters,
) -> Result<Vec<StatOutcome>> {
    let bound = if workers == 0 {
        num_cpus::get() * 2
    } else {
        workers
    };
    let pool = bound.min(requests.len());
    let next = AtomicUsize::new(0);
    let results: Mutex<Vec<StatOutcome>> = Mutex::new(Vec::with_capacity(requests.len()));

    std::thread::scope(|scope| {
        for _ in 0..pool {
            scope.spawn(|| loop {
                if cancel.is_cancelled() {
                    break;
                }
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(req) = requests.get(i) else {
                    break;
                };
                let info = stat_one(req, counters);
                results
                    .lock()
                    .push((req.index, req.name.clone(), info));
            });
        }
    });

    cancel.checkpoint()?;
    Ok(results.into_inner())
}

fn stat_one(req: &StatRequest, counters: &ScanCounters) -> Result<FileInfo> {
    counters.stats.fetch_add(1, Ordering::Relaxed);
    let md = std::fs::symlink_metadata(&req.path)?;
    Ok(file_info_from_metadata(&req.name, &md))
}

/// Build a FileInfo from stat results.
pub(crate) fn file_info_from_metadata(name: &str, md: &std::fs::Metadata) -> FileInfo {
    FileInfo {
        name: name.to_string(),
        size: md.size() as i64,
        mode: md.mode(),
        mod_sec: md.mtime(),
        mod_nsec: md.mtime_nsec() as i32,
        inode: md.ino(),
        uid: md.uid(),
        gid: md.gid(),
    }
}
