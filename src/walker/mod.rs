//! Incremental filesystem walker
//!
//! A pool of directory workers drains a shared work queue. For each
//! directory the worker loads the previously stored record, lists the
//! directory, and re-stats only the entries whose listing metadata
//! (inode, type, size, modtime) no longer matches. Unchanged entries are
//! reused from the stored record, so a re-scan of an unchanged tree
//! issues no stat calls at all.
//!
//! ```text
//! Work queue (crossbeam channel)
//! │
//! ├── Worker 0: pop dir → load old → list → diff → stat changed → write
//! ├── Worker 1: pop dir → load old → list → diff → stat changed → write
//! └── Worker N: ...                └── subdirs pushed back on the queue
//! ```
//!
//! Results are written through the database's batching layer; per-path
//! failures go to the error log and the walk continues. Only a database
//! failure or a cancellation stops the scan.

mod stat;

use crate::config::PrefixEntry;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::prefixinfo::{FileInfo, PrefixInfo};
use crate::progress::{ScanCounters, ScanSnapshot};
use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use stat::{file_info_from_metadata, StatRequest};
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::MetadataExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Cooperative cancellation shared by every worker.
///
/// Checked at queue receives, before each OS call batch, and around each
/// database call; a tripped token surfaces as [`Error::Cancelled`] at the
/// next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// One directory awaiting processing. The directory's own attributes come
/// from its parent's listing so no directory is statted twice.
#[derive(Debug, Clone)]
struct DirWork {
    path: String,
    info: FileInfo,
}

/// A directory entry as returned by the listing primitive: enough to
/// decide changed vs unchanged, but without ownership.
#[derive(Debug)]
struct ListEntry {
    name: String,
    inode: u64,
    dev: u64,
    type_bits: u32,
    size: i64,
    mod_sec: i64,
    mod_nsec: i32,
    nlink: u64,
}

impl ListEntry {
    fn new(name: String, md: &std::fs::Metadata) -> Self {
        Self {
            name,
            inode: md.ino(),
            dev: md.dev(),
            type_bits: md.mode() & libc::S_IFMT as u32,
            size: md.size() as i64,
            mod_sec: md.mtime(),
            mod_nsec: md.mtime_nsec() as i32,
            nlink: md.nlink(),
        }
    }

    fn is_dir(&self) -> bool {
        self.type_bits == libc::S_IFDIR as u32
    }

    /// The incremental decision: a stored child with the same name whose
    /// inode, type, size, and modtime all match needs no re-stat.
    fn matches(&self, prev: &FileInfo) -> bool {
        self.inode == prev.inode
            && self.type_bits == prev.type_bits()
            && self.size == prev.size
            && self.mod_sec == prev.mod_sec
            && self.mod_nsec == prev.mod_nsec
    }
}

/// The scan engine for one prefix.
pub struct Walker {
    entry: PrefixEntry,
    db: Arc<Database>,
    counters: Arc<ScanCounters>,
    cancel: CancelToken,
    scan_workers: usize,
    fatal: Mutex<Option<Error>>,
}

impl Walker {
    pub fn new(entry: PrefixEntry, db: Arc<Database>, cancel: CancelToken) -> Self {
        let scan_workers = if entry.concurrent_scans == 0 {
            num_cpus::get() * 2
        } else {
            entry.concurrent_scans
        };
        Self {
            entry,
            db,
            counters: Arc::new(ScanCounters::default()),
            cancel,
            scan_workers,
            fatal: Mutex::new(None),
        }
    }

    /// The counters ticked by this walk, for progress display.
    pub fn counters(&self) -> Arc<ScanCounters> {
        Arc::clone(&self.counters)
    }

    /// Walk the tree rooted at `root` and write updated records.
    pub fn run(&self, root: &str) -> Result<ScanSnapshot> {
        if self.entry.concurrent_scans == 0 {
            warn!(
                workers = self.scan_workers,
                "concurrent_scans is 0 (unbounded); using {} directory workers", self.scan_workers
            );
        }
        if self.entry.concurrent_stats == 0 {
            warn!("concurrent_stats is 0 (unbounded); stat pools are capped at twice the cpu count");
        }

        let root_info = match std::fs::symlink_metadata(root) {
            Ok(md) if md.is_dir() => file_info_from_metadata(root, &md),
            Ok(_) => {
                self.record_error(root, &Error::Io("not a directory".into()));
                return Ok(self.counters.snapshot());
            }
            Err(e) => {
                self.record_error(root, &e.into());
                return Ok(self.counters.snapshot());
            }
        };

        let (tx, rx) = unbounded::<DirWork>();
        let pending = AtomicU64::new(1);
        let seen: Mutex<HashSet<(u64, u64)>> = Mutex::new(HashSet::new());
        tx.send(DirWork {
            path: root.to_string(),
            info: root_info,
        })
        .expect("work queue closed before the scan started");

        std::thread::scope(|scope| {
            for id in 0..self.scan_workers {
                let rx = rx.clone();
                let tx = tx.clone();
                let pending = &pending;
                let seen = &seen;
                scope.spawn(move || self.worker_loop(id, rx, tx, pending, seen));
            }
        });

        if let Some(e) = self.fatal.lock().take() {
            let _ = self.db.flush();
            return Err(e);
        }
        self.cancel.checkpoint()?;
        Ok(self.counters.snapshot())
    }

    fn worker_loop(
        &self,
        id: usize,
        rx: Receiver<DirWork>,
        tx: Sender<DirWork>,
        pending: &AtomicU64,
        seen: &Mutex<HashSet<(u64, u64)>>,
    ) {
        debug!(worker = id, "walker worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(work) => {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        self.process_dir(&work, &tx, pending, seen)
                    }));
                    if let Err(payload) = outcome {
                        let msg = panic_message(&payload);
                        error!(worker = id, path = %work.path, "worker panicked: {msg}");
                        self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    }
                    pending.fetch_sub(1, Ordering::SeqCst);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if pending.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(worker = id, "walker worker finished");
    }

    fn process_dir(
        &self,
        work: &DirWork,
        tx: &Sender<DirWork>,
        pending: &AtomicU64,
        seen: &Mutex<HashSet<(u64, u64)>>,
    ) {
        match self.scan_one(work, tx, pending, seen) {
            Ok(()) | Err(Error::Cancelled) => {}
            // Anything propagated out of scan_one is a database failure;
            // per-path errors were already recorded and swallowed there.
            Err(e) => self.fail(e),
        }
    }

    fn scan_one(
        &self,
        work: &DirWork,
        tx: &Sender<DirWork>,
        pending: &AtomicU64,
        seen: &Mutex<HashSet<(u64, u64)>>,
    ) -> Result<()> {
        self.cancel.checkpoint()?;
        let path = work.path.as_str();

        let old = match self.db.get(path)? {
            Some(raw) => match PrefixInfo::decode(&raw) {
                Ok(pi) => Some(pi),
                Err(e) => {
                    // Treat a corrupt record as no prior record so the
                    // directory is re-scanned in full.
                    self.record_error(path, &e);
                    None
                }
            },
            None => None,
        };

        let listed = match self.list_directory(path) {
            Ok(entries) => entries,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                self.record_error(path, &e);
                return Ok(());
            }
        };

        let old_children: HashMap<&str, &FileInfo> = old
            .as_ref()
            .map(|pi| pi.files.iter().map(|f| (f.name.as_str(), f)).collect())
            .unwrap_or_default();

        let mut merged: Vec<Option<FileInfo>> = vec![None; listed.len()];
        let mut changed: Vec<StatRequest> = Vec::new();
        for (i, le) in listed.iter().enumerate() {
            // A hardlink whose inode was already counted this scan is
            // recorded with size zero and never statted.
            if !self.entry.count_hardlinks_as_files && !le.is_dir() && le.nlink > 1 {
                let first = seen.lock().insert((le.dev, le.inode));
                if !first {
                    let mut info = match old_children.get(le.name.as_str()) {
                        Some(prev) => (*prev).clone(),
                        None => FileInfo {
                            name: le.name.clone(),
                            size: 0,
                            mode: le.type_bits,
                            mod_sec: le.mod_sec,
                            mod_nsec: le.mod_nsec,
                            inode: le.inode,
                            uid: work.info.uid,
                            gid: work.info.gid,
                        },
                    };
                    info.size = 0;
                    merged[i] = Some(info);
                    self.counters.reused.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
            match old_children.get(le.name.as_str()) {
                Some(prev) if le.matches(prev) => {
                    merged[i] = Some((*prev).clone());
                    self.counters.reused.fetch_add(1, Ordering::Relaxed);
                }
                _ => changed.push(StatRequest {
                    index: i,
                    name: le.name.clone(),
                    path: PathBuf::from(self.join(path, &le.name)),
                }),
            }
        }

        let outcomes = stat::stat_all(
            changed,
            self.entry.concurrent_stats,
            self.entry.concurrent_stats_threshold,
            &self.cancel,
            &self.counters,
        )?;
        for (i, name, result) in outcomes {
            match result {
                Ok(info) => merged[i] = Some(info),
                Err(e) => self.record_error(&self.join(path, &name), &e),
            }
        }

        let mut pi =
            PrefixInfo::from_dir_info(&work.info, merged.into_iter().flatten().collect());
        pi.create_id_maps();

        self.cancel.checkpoint()?;
        self.db.set_batch(path, &pi.encode())?;

        let mut n_files = 0u64;
        let mut n_bytes = 0u64;
        for f in &pi.files {
            if f.is_dir() {
                pending.fetch_add(1, Ordering::SeqCst);
                let child = DirWork {
                    path: self.join(path, &f.name),
                    info: f.clone(),
                };
                if tx.send(child).is_err() {
                    pending.fetch_sub(1, Ordering::SeqCst);
                }
            } else {
                n_files += 1;
                n_bytes += f.size.max(0) as u64;
            }
        }
        self.counters.dirs.fetch_add(1, Ordering::Relaxed);
        self.counters.files.fetch_add(n_files, Ordering::Relaxed);
        self.counters.bytes.fetch_add(n_bytes, Ordering::Relaxed);
        Ok(())
    }

    /// List a directory, collecting up to `scan_size` entries per batch
    /// with a cancellation checkpoint between batches. Excluded entries
    /// are dropped here and never counted. Exhaustion is decided by what
    /// the reader yields, not by what survives filtering, so a batch that
    /// is entirely excluded does not end the listing early.
    fn list_directory(&self, path: &str) -> Result<Vec<ListEntry>> {
        let batch_size = self.entry.effective_scan_size();
        let mut reader = std::fs::read_dir(path)?;
        let mut out = Vec::new();
        loop {
            self.cancel.checkpoint()?;
            let mut yielded = 0;
            for entry in reader.by_ref().take(batch_size) {
                yielded += 1;
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let full = self.join(path, &name);
                if self.entry.is_excluded(&full) {
                    continue;
                }
                match entry.metadata() {
                    Ok(md) => out.push(ListEntry::new(name, &md)),
                    Err(e) => self.record_error(&full, &e.into()),
                }
            }
            if yielded < batch_size {
                break;
            }
        }
        Ok(out)
    }

    fn join(&self, dir: &str, name: &str) -> String {
        let sep = &self.entry.separator;
        if dir.ends_with(sep.as_str()) {
            format!("{dir}{name}")
        } else {
            format!("{dir}{sep}{name}")
        }
    }

    /// Record a per-path failure and keep going.
    fn record_error(&self, path: &str, e: &Error) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        debug!(path, "scan error: {e}");
        if let Err(le) = self.db.log_error(Utc::now(), path, e.to_string().as_bytes()) {
            error!(path, "failed to record scan error: {le}");
            self.fail(le);
        }
    }

    /// A database failure ends the scan; the first one wins.
    fn fail(&self, e: Error) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            error!("aborting scan: {e}");
            *fatal = Some(e);
        }
        self.cancel.cancel();
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Options;
    use std::fs;
    use tempfile::tempdir;

    fn entry_for(prefix: &str) -> PrefixEntry {
        let yaml = format!(
            "prefixes:\n  - prefix: {prefix}\n    database: unused\n    concurrent_scans: 2\n    concurrent_stats: 2\n"
        );
        Config::parse(&yaml).unwrap().prefixes.remove(0)
    }

    fn open_db(dir: &std::path::Path, prefix: &str) -> Arc<Database> {
        Arc::new(Database::open(dir.join("idu.db"), prefix, Options::new()).unwrap())
    }

    fn build_tree(root: &std::path::Path) {
        fs::create_dir_all(root.join("a/deep")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("top.txt"), b"0123456789").unwrap();
        fs::write(root.join("a/one.txt"), b"abc").unwrap();
        fs::write(root.join("a/deep/two.txt"), b"abcdef").unwrap();
        fs::write(root.join("b/three.txt"), b"x").unwrap();
    }

    #[test]
    fn test_walk_records_every_directory() {
        let scratch = tempdir().unwrap();
        let tree = scratch.path().join("tree");
        build_tree(&tree);
        let root = tree.to_str().unwrap();

        let db = open_db(scratch.path(), root);
        let walker = Walker::new(entry_for(root), Arc::clone(&db), CancelToken::new());
        let snap = walker.run(root).unwrap();

        assert_eq!(snap.dirs, 4);
        assert_eq!(snap.files, 4);
        assert_eq!(snap.bytes, 10 + 3 + 6 + 1);
        assert_eq!(snap.errors, 0);
        db.flush().unwrap();

        let raw = db.get(root).unwrap().expect("root record");
        let pi = PrefixInfo::decode(&raw).unwrap();
        assert_eq!(pi.files.len(), 3); // a, b, top.txt

        let raw = db
            .get(&format!("{root}/a/deep"))
            .unwrap()
            .expect("nested record");
        let pi = PrefixInfo::decode(&raw).unwrap();
        assert_eq!(pi.files.len(), 1);
        assert_eq!(pi.files[0].name, "two.txt");
        assert_eq!(pi.files[0].size, 6);
    }

    #[test]
    fn test_second_walk_issues_no_stats() {
        let scratch = tempdir().unwrap();
        let tree = scratch.path().join("tree");
        build_tree(&tree);
        let root = tree.to_str().unwrap();

        let db = open_db(scratch.path(), root);
        let walker = Walker::new(entry_for(root), Arc::clone(&db), CancelToken::new());
        let first = walker.run(root).unwrap();
        assert!(first.stats > 0);
        db.flush().unwrap();

        let walker = Walker::new(entry_for(root), Arc::clone(&db), CancelToken::new());
        let second = walker.run(root).unwrap();
        assert_eq!(second.stats, 0, "unchanged tree must not re-stat");
        assert_eq!(second.errors, 0);
        assert_eq!(second.dirs, first.dirs);
        assert_eq!(second.files, first.files);
        assert_eq!(second.bytes, first.bytes);
    }

    #[test]
    fn test_changed_file_is_restatted() {
        let scratch = tempdir().unwrap();
        let tree = scratch.path().join("tree");
        build_tree(&tree);
        let root = tree.to_str().unwrap();

        let db = open_db(scratch.path(), root);
        Walker::new(entry_for(root), Arc::clone(&db), CancelToken::new())
            .run(root)
            .unwrap();
        db.flush().unwrap();

        fs::write(tree.join("a/one.txt"), b"changed contents").unwrap();

        let walker = Walker::new(entry_for(root), Arc::clone(&db), CancelToken::new());
        let snap = walker.run(root).unwrap();
        assert_eq!(snap.stats, 1);
        db.flush().unwrap();

        let raw = db.get(&format!("{root}/a")).unwrap().unwrap();
        let pi = PrefixInfo::decode(&raw).unwrap();
        let f = pi.files.iter().find(|f| f.name == "one.txt").unwrap();
        assert_eq!(f.size, 16);
    }

    #[test]
    fn test_exclusions_drop_entries() {
        let scratch = tempdir().unwrap();
        let tree = scratch.path().join("tree");
        build_tree(&tree);
        let root = tree.to_str().unwrap();

        let yaml = format!(
            "prefixes:\n  - prefix: {root}\n    database: unused\n    exclusions: [\"/a$\", \"top\\\\.txt\"]\n"
        );
        let entry = Config::parse(&yaml).unwrap().prefixes.remove(0);

        let db = open_db(scratch.path(), root);
        let walker = Walker::new(entry, Arc::clone(&db), CancelToken::new());
        let snap = walker.run(root).unwrap();
        db.flush().unwrap();

        // /a and everything under it was never visited; top.txt dropped.
        assert_eq!(snap.dirs, 2);
        assert!(db.get(&format!("{root}/a")).unwrap().is_none());
        let pi = PrefixInfo::decode(&db.get(root).unwrap().unwrap()).unwrap();
        assert_eq!(pi.files.len(), 1);
        assert_eq!(pi.files[0].name, "b");
    }

    #[test]
    fn test_listing_survives_fully_excluded_batches() {
        let scratch = tempdir().unwrap();
        let tree = scratch.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        for i in 0..8 {
            fs::write(tree.join(format!("drop-{i}")), b"x").unwrap();
        }
        for i in 0..4 {
            fs::write(tree.join(format!("keep-{i}")), b"x").unwrap();
        }
        let root = tree.to_str().unwrap();

        // scan_size 1 makes every excluded entry a fully-excluded batch.
        let yaml = format!(
            "prefixes:\n  - prefix: {root}\n    database: unused\n    scan_size: 1\n    exclusions: [\"drop-\"]\n"
        );
        let entry = Config::parse(&yaml).unwrap().prefixes.remove(0);

        let db = open_db(scratch.path(), root);
        let walker = Walker::new(entry, Arc::clone(&db), CancelToken::new());
        let listed = walker.list_directory(root).unwrap();
        assert_eq!(listed.len(), 4, "kept entries past an excluded batch were dropped");

        let snap = walker.run(root).unwrap();
        assert_eq!(snap.files, 4);
        assert_eq!(snap.errors, 0);
    }

    #[test]
    fn test_hardlinks_count_once_by_default() {
        let scratch = tempdir().unwrap();
        let tree = scratch.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("original"), b"0123456789").unwrap();
        fs::hard_link(tree.join("original"), tree.join("alias")).unwrap();
        let root = tree.to_str().unwrap();

        let db = open_db(scratch.path(), root);
        let walker = Walker::new(entry_for(root), Arc::clone(&db), CancelToken::new());
        let snap = walker.run(root).unwrap();
        db.flush().unwrap();

        assert_eq!(snap.files, 2);
        assert_eq!(snap.bytes, 10, "the second link must not add bytes");

        let pi = PrefixInfo::decode(&db.get(root).unwrap().unwrap()).unwrap();
        let total: i64 = pi.files.iter().map(|f| f.size).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_hardlinks_counted_when_configured() {
        let scratch = tempdir().unwrap();
        let tree = scratch.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("original"), b"0123456789").unwrap();
        fs::hard_link(tree.join("original"), tree.join("alias")).unwrap();
        let root = tree.to_str().unwrap();

        let yaml = format!(
            "prefixes:\n  - prefix: {root}\n    database: unused\n    count_hardlinks_as_files: true\n"
        );
        let entry = Config::parse(&yaml).unwrap().prefixes.remove(0);

        let db = open_db(scratch.path(), root);
        let snap = Walker::new(entry, Arc::clone(&db), CancelToken::new())
            .run(root)
            .unwrap();
        assert_eq!(snap.bytes, 20);
    }

    #[test]
    fn test_cancelled_scan_returns_cancelled() {
        let scratch = tempdir().unwrap();
        let tree = scratch.path().join("tree");
        build_tree(&tree);
        let root = tree.to_str().unwrap();

        let db = open_db(scratch.path(), root);
        let cancel = CancelToken::new();
        cancel.cancel();
        let walker = Walker::new(entry_for(root), Arc::clone(&db), cancel);
        assert!(matches!(walker.run(root), Err(Error::Cancelled)));
    }

    #[test]
    fn test_unreadable_root_is_recorded_not_fatal() {
        let scratch = tempdir().unwrap();
        let root = scratch.path().join("missing");
        let root = root.to_str().unwrap();

        let db = open_db(scratch.path(), root);
        let walker = Walker::new(entry_for(root), Arc::clone(&db), CancelToken::new());
        let snap = walker.run(root).unwrap();
        assert_eq!(snap.dirs, 0);
        assert_eq!(snap.errors, 1);

        let mut logged = 0;
        db.visit_errors_key(root, |_, _, _| {
            logged += 1;
            true
        })
        .unwrap();
        assert_eq!(logged, 1);
    }
}
