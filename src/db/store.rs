//! redb-backed store
//!
//! One writer at a time, any number of readers. Writes commit in three
//! ways: `set` commits immediately, `set_batch` accumulates into an
//! in-memory batch committed on a size or delay threshold, and the log
//! helpers commit their own transactions. Every commit is a single
//! engine transaction, so a crash loses at most one uncommitted batch and
//! never applies one partially.

use super::{
    error_key_key, error_when_key, lock_path, shared_engine, split_error_key_key,
    split_error_when_key, ts_from_key, ts_key, FileLock, Options, DEFAULT_BATCH_DELAY,
    DEFAULT_BATCH_SIZE,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use redb::{ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Table names for one prefix's namespaces.
#[derive(Debug, Clone)]
struct Names {
    data: String,
    log: String,
    errors_when: String,
    errors_key: String,
    stats: String,
}

impl Names {
    fn for_prefix(prefix: &str) -> Self {
        Self {
            data: format!("{prefix}/data"),
            log: format!("{prefix}/log"),
            errors_when: format!("{prefix}/errors_when"),
            errors_key: format!("{prefix}/errors_key"),
            stats: format!("{prefix}/stats"),
        }
    }

    fn all(&self) -> [&str; 5] {
        [
            &self.data,
            &self.log,
            &self.errors_when,
            &self.errors_key,
            &self.stats,
        ]
    }
}

/// Shared write path: the pending batch and the commit mutex that
/// serializes every write transaction issued through this handle.
struct WriteState {
    engine: Arc<redb::Database>,
    data_name: String,
    commit: Mutex<()>,
    pending: Mutex<Vec<(String, Vec<u8>)>>,
}

impl WriteState {
    fn commit_entries(&self, entries: &[(String, Vec<u8>)], extra: Option<(&str, &[u8])>) -> Result<()> {
        if entries.is_empty() && extra.is_none() {
            return Ok(());
        }
        let txn = self.engine.begin_write()?;
        {
            let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&self.data_name);
            let mut table = txn.open_table(def)?;
            for (k, v) in entries {
                table.insert(k.as_str(), v.as_slice())?;
            }
            if let Some((k, v)) = extra {
                table.insert(k, v)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Commit the pending batch, if any.
    fn flush(&self) -> Result<()> {
        let _guard = self.commit.lock();
        let entries = std::mem::take(&mut *self.pending.lock());
        if !entries.is_empty() {
            debug!(entries = entries.len(), "committing batch");
        }
        self.commit_entries(&entries, None)
    }

    /// Commit the pending batch and then `key`, in one transaction, so a
    /// batched write of `key` never lands after this explicit one.
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let _guard = self.commit.lock();
        let entries = std::mem::take(&mut *self.pending.lock());
        self.commit_entries(&entries, Some((key, value)))
    }

    fn discard(&self) {
        self.pending.lock().clear();
    }
}

struct Flusher {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Counts of live entries per namespace, for `database stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamespaceCounts {
    pub data: u64,
    pub logs: u64,
    pub errors: u64,
    pub stats: u64,
}

/// A per-prefix handle onto the store.
pub struct Database {
    engine: Arc<redb::Database>,
    prefix: String,
    names: Names,
    read_only: bool,
    batch_size: usize,
    batch_delay: Duration,
    closed: AtomicBool,
    writes: Arc<WriteState>,
    lock: Mutex<Option<FileLock>>,
    flusher: Mutex<Option<Flusher>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("prefix", &self.prefix)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl Database {
    /// Open the database file at `path` for the given prefix.
    ///
    /// A writable open acquires the writer lock, blocking until it is free
    /// or the configured deadline passes, and creates the prefix's
    /// namespaces on first use. A read-only open takes no lock and fails
    /// with `NotFound` if the file does not exist.
    pub fn open(path: impl AsRef<Path>, prefix: &str, opts: Options) -> Result<Self> {
        let path = path.as_ref();
        let lock = if opts.read_only {
            None
        } else {
            Some(FileLock::acquire(&lock_path(path), opts.lock_timeout)?)
        };
        let engine = shared_engine(path, !opts.read_only)?;
        let names = Names::for_prefix(prefix);
        if !opts.read_only {
            let txn = engine.begin_write()?;
            for name in [&names.data, &names.stats] {
                let def: TableDefinition<&str, &[u8]> = TableDefinition::new(name);
                txn.open_table(def)?;
            }
            for name in [&names.log, &names.errors_when, &names.errors_key] {
                let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(name);
                txn.open_table(def)?;
            }
            txn.commit()?;
        }

        let batch_delay = opts.batch_delay.unwrap_or(DEFAULT_BATCH_DELAY);
        let writes = Arc::new(WriteState {
            engine: Arc::clone(&engine),
            data_name: names.data.clone(),
            commit: Mutex::new(()),
            pending: Mutex::new(Vec::new()),
        });
        let flusher = if !opts.read_only && !batch_delay.is_zero() {
            Some(spawn_flusher(Arc::clone(&writes), batch_delay))
        } else {
            None
        };

        debug!(path = %path.display(), prefix, read_only = opts.read_only, "database open");
        Ok(Self {
            engine,
            prefix: prefix.to_string(),
            names,
            read_only: opts.read_only,
            batch_size: opts.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            batch_delay,
            closed: AtomicBool::new(false),
            writes,
            lock: Mutex::new(lock),
            flusher: Mutex::new(flusher),
        })
    }

    /// The prefix this handle serves.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(Error::Io("database opened read-only".into()));
        }
        Ok(())
    }

    /// Synchronous durable write: returns once the value is committed.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.writes.set(key, value)
    }

    /// Queue a write into the in-memory batch. The batch commits when it
    /// reaches the size threshold, when the delay elapses, or at close.
    pub fn set_batch(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_writable()?;
        if self.batch_delay.is_zero() {
            return self.writes.set(key, value);
        }
        let full = {
            let mut pending = self.writes.pending.lock();
            pending.push((key.to_string(), value.to_vec()));
            pending.len() >= self.batch_size
        };
        if full {
            self.writes.flush()?;
        }
        Ok(())
    }

    /// Commit any pending batched writes now.
    pub fn flush(&self) -> Result<()> {
        self.check_writable()?;
        self.writes.flush()
    }

    /// Fetch the value stored for `key` in the data namespace.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let txn = self.engine.begin_read()?;
        let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&self.names.data);
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    /// Remove a set of keys. Missing keys are not an error.
    pub fn delete<S: AsRef<str>>(&self, keys: &[S]) -> Result<()> {
        self.check_writable()?;
        self.writes.flush()?;
        let _guard = self.writes.commit.lock();
        let txn = self.engine.begin_write()?;
        {
            let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&self.names.data);
            let mut table = txn.open_table(def)?;
            for key in keys {
                table.remove(key.as_ref())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove every data key starting with `key_prefix`, in one
    /// transaction.
    pub fn delete_prefix(&self, key_prefix: &str) -> Result<()> {
        self.check_writable()?;
        self.writes.flush()?;
        let _guard = self.writes.commit.lock();
        let txn = self.engine.begin_write()?;
        {
            let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&self.names.data);
            let mut table = txn.open_table(def)?;
            let doomed: Vec<String> = {
                let mut doomed = Vec::new();
                for item in table.range::<&str>(key_prefix..)? {
                    let (k, _) = item?;
                    let k = k.value();
                    if !k.starts_with(key_prefix) {
                        break;
                    }
                    doomed.push(k.to_string());
                }
                doomed
            };
            for key in &doomed {
                table.remove(key.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Visit every data entry with key >= `start` in ascending key order.
    /// The visitor returns false to stop. The pass observes a single
    /// snapshot: writes committed after it starts are not seen.
    pub fn scan<F>(&self, start: &str, mut visitor: F) -> Result<()>
    where
        F: FnMut(&str, &[u8]) -> bool,
    {
        self.check_open()?;
        let txn = self.engine.begin_read()?;
        let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&self.names.data);
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for item in table.range::<&str>(start..)? {
            let (k, v) = item?;
            if !visitor(k.value(), v.value()) {
                break;
            }
        }
        Ok(())
    }

    /// Record a scan run.
    fn append_log(&self, start: DateTime<Utc>, stop: DateTime<Utc>, detail: &[u8]) -> Result<()> {
        let _guard = self.writes.commit.lock();
        let txn = self.engine.begin_write()?;
        {
            let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&self.names.log);
            let mut table = txn.open_table(def)?;
            let key = ts_key(start);
            let mut value = Vec::with_capacity(8 + detail.len());
            value.extend_from_slice(&ts_key(stop));
            value.extend_from_slice(detail);
            table.insert(key.as_slice(), value.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Atomically record a scan-log entry and close the handle.
    pub fn log_and_close(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        detail: &[u8],
    ) -> Result<()> {
        self.check_writable()?;
        self.writes.flush()?;
        self.append_log(start, stop, detail)?;
        self.close()
    }

    /// The most recent scan-log entry.
    pub fn last_log(&self) -> Result<(DateTime<Utc>, DateTime<Utc>, Vec<u8>)> {
        self.check_open()?;
        let txn = self.engine.begin_read()?;
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&self.names.log);
        let table = txn.open_table(def)?;
        let result = match table.last()? {
            None => Err(Error::NotFound),
            Some((k, v)) => decode_log_entry(k.value(), v.value()),
        };
        result
    }

    /// Visit scan-log entries with start time in `[from, to)`, oldest
    /// first.
    pub fn visit_logs<F>(&self, from: DateTime<Utc>, to: DateTime<Utc>, mut visitor: F) -> Result<()>
    where
        F: FnMut(DateTime<Utc>, DateTime<Utc>, &[u8]) -> bool,
    {
        self.check_open()?;
        let txn = self.engine.begin_read()?;
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&self.names.log);
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let lo = ts_key(from);
        let hi = ts_key(to);
        for item in table.range::<&[u8]>(lo.as_slice()..hi.as_slice())? {
            let (k, v) = item?;
            let (start, stop, detail) = decode_log_entry(k.value(), v.value())?;
            if !visitor(start, stop, &detail) {
                break;
            }
        }
        Ok(())
    }

    /// Record a per-path error under both error indexes, in one
    /// transaction.
    pub fn log_error(&self, when: DateTime<Utc>, key: &str, detail: &[u8]) -> Result<()> {
        self.check_writable()?;
        let _guard = self.writes.commit.lock();
        let txn = self.engine.begin_write()?;
        {
            let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&self.names.errors_when);
            let mut table = txn.open_table(def)?;
            table.insert(error_when_key(when, key).as_slice(), detail)?;
        }
        {
            let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&self.names.errors_key);
            let mut table = txn.open_table(def)?;
            table.insert(error_key_key(key, when).as_slice(), detail)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Visit error records with `when` in `[from, to)`, oldest first.
    pub fn visit_errors_when<F>(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        mut visitor: F,
    ) -> Result<()>
    where
        F: FnMut(DateTime<Utc>, &str, &[u8]) -> bool,
    {
        self.check_open()?;
        let txn = self.engine.begin_read()?;
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&self.names.errors_when);
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let lo = ts_key(from);
        let hi = ts_key(to);
        for item in table.range::<&[u8]>(lo.as_slice()..hi.as_slice())? {
            let (k, v) = item?;
            let (when, key) = split_error_when_key(k.value())?;
            if !visitor(when, key, v.value()) {
                break;
            }
        }
        Ok(())
    }

    /// Visit error records for `key`, oldest first.
    pub fn visit_errors_key<F>(&self, key: &str, mut visitor: F) -> Result<()>
    where
        F: FnMut(DateTime<Utc>, &str, &[u8]) -> bool,
    {
        self.check_open()?;
        let txn = self.engine.begin_read()?;
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&self.names.errors_key);
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut lo = key.as_bytes().to_vec();
        lo.push(0);
        let mut hi = key.as_bytes().to_vec();
        hi.push(1);
        for item in table.range::<&[u8]>(lo.as_slice()..hi.as_slice())? {
            let (k, v) = item?;
            let (key, when) = split_error_key_key(k.value())?;
            if !visitor(when, key, v.value()) {
                break;
            }
        }
        Ok(())
    }

    /// Store an aggregator record in the stats namespace.
    pub fn set_stats(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_writable()?;
        let _guard = self.writes.commit.lock();
        let txn = self.engine.begin_write()?;
        {
            let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&self.names.stats);
            let mut table = txn.open_table(def)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Fetch an aggregator record.
    pub fn get_stats(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let txn = self.engine.begin_read()?;
        let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&self.names.stats);
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    /// Entry counts for each namespace.
    pub fn counts(&self) -> Result<NamespaceCounts> {
        self.check_open()?;
        let txn = self.engine.begin_read()?;
        let count_str = |name: &str| -> Result<u64> {
            let def: TableDefinition<&str, &[u8]> = TableDefinition::new(name);
            match txn.open_table(def) {
                Ok(table) => Ok(table.len()?),
                Err(redb::TableError::TableDoesNotExist(_)) => Ok(0),
                Err(e) => Err(e.into()),
            }
        };
        let count_bytes = |name: &str| -> Result<u64> {
            let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(name);
            match txn.open_table(def) {
                Ok(table) => Ok(table.len()?),
                Err(redb::TableError::TableDoesNotExist(_)) => Ok(0),
                Err(e) => Err(e.into()),
            }
        };
        Ok(NamespaceCounts {
            data: count_str(&self.names.data)?,
            logs: count_bytes(&self.names.log)?,
            errors: count_bytes(&self.names.errors_key)?,
            stats: count_str(&self.names.stats)?,
        })
    }

    /// Destroy every namespace belonging to this prefix.
    pub fn erase(&self) -> Result<()> {
        self.check_writable()?;
        self.writes.discard();
        let _guard = self.writes.commit.lock();
        let txn = self.engine.begin_write()?;
        for name in self.names.all() {
            let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(name);
            match txn.delete_table(def) {
                Ok(_) => {}
                Err(redb::TableError::TableDoesNotExist(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        txn.commit()?;
        warn!(prefix = %self.prefix, "database erased");
        Ok(())
    }

    /// Flush pending writes, release the writer lock, and mark the handle
    /// closed. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(flusher) = self.flusher.lock().take() {
            let _ = flusher.shutdown.send(());
            let _ = flusher.handle.join();
        }
        let result = if self.read_only {
            Ok(())
        } else {
            self.writes.flush()
        };
        self.lock.lock().take();
        debug!(prefix = %self.prefix, "database closed");
        result
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(prefix = %self.prefix, "close on drop failed: {e}");
        }
    }
}

fn decode_log_entry(key: &[u8], value: &[u8]) -> Result<(DateTime<Utc>, DateTime<Utc>, Vec<u8>)> {
    let start = ts_from_key(key)?;
    if value.len() < 8 {
        return Err(Error::CorruptRecord("truncated log entry".into()));
    }
    let stop = ts_from_key(&value[..8])?;
    Ok((start, stop, value[8..].to_vec()))
}

/// Background thread that commits a lingering batch once the delay
/// elapses without a size-triggered flush.
fn spawn_flusher(writes: Arc<WriteState>, delay: Duration) -> Flusher {
    let (shutdown, rx) = bounded::<()>(1);
    let handle = std::thread::Builder::new()
        .name("idu-batch-flush".to_string())
        .spawn(move || loop {
            match rx.recv_timeout(delay) {
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if let Err(e) = writes.flush() {
                        error!("batch flush failed: {e}");
                    }
                }
                _ => break,
            }
        })
        .expect("failed to spawn batch flusher thread");
    Flusher { shutdown, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    const PREFIX: &str = "/filesystem-prefix";

    #[test]
    fn test_set_get_round_trip() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("db"), PREFIX, Options::new()).unwrap();

        db.set("/a", b"alpha").unwrap();
        assert_eq!(db.get("/a").unwrap().unwrap(), b"alpha");
        assert!(db.get("/missing").unwrap().is_none());
        db.close().unwrap();
    }

    #[test]
    fn test_closed_handle_rejects_ops() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("db"), PREFIX, Options::new()).unwrap();
        db.close().unwrap();

        assert!(matches!(db.set("/a", b"x"), Err(Error::Closed)));
        assert!(matches!(db.get("/a"), Err(Error::Closed)));
        // Closing again is fine.
        db.close().unwrap();
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let db = Database::open(&path, PREFIX, Options::new()).unwrap();
        db.set("/a", b"x").unwrap();
        db.close().unwrap();

        let ro = Database::open(&path, PREFIX, Options::new().read_only()).unwrap();
        assert_eq!(ro.get("/a").unwrap().unwrap(), b"x");
        assert!(ro.set("/b", b"y").is_err());
    }

    #[test]
    fn test_batch_flush_on_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let db = Database::open(&path, PREFIX, Options::new()).unwrap();
        for i in 0..10 {
            db.set_batch(&format!("/k/{i:02}"), b"v").unwrap();
        }
        db.close().unwrap();

        let ro = Database::open(&path, PREFIX, Options::new().read_only()).unwrap();
        let mut n = 0;
        ro.scan("", |_, _| {
            n += 1;
            true
        })
        .unwrap();
        assert_eq!(n, 10);
    }

    #[test]
    fn test_zero_batch_delay_commits_immediately() {
        let dir = tempdir().unwrap();
        let db = Database::open(
            dir.path().join("db"),
            PREFIX,
            Options::new().batch_delay(Duration::ZERO),
        )
        .unwrap();
        db.set_batch("/a", b"x").unwrap();
        // Visible without any flush.
        assert_eq!(db.get("/a").unwrap().unwrap(), b"x");
    }

    #[test]
    fn test_batch_size_threshold_flushes() {
        let dir = tempdir().unwrap();
        let db = Database::open(
            dir.path().join("db"),
            PREFIX,
            Options::new()
                .batch_size(4)
                .batch_delay(Duration::from_secs(3600)),
        )
        .unwrap();
        for i in 0..4 {
            db.set_batch(&format!("/k/{i}"), b"v").unwrap();
        }
        // The fourth write crossed the threshold and committed the batch.
        assert_eq!(db.get("/k/0").unwrap().unwrap(), b"v");
        assert_eq!(db.get("/k/3").unwrap().unwrap(), b"v");
    }

    #[test]
    fn test_set_orders_after_pending_batch() {
        let dir = tempdir().unwrap();
        let db = Database::open(
            dir.path().join("db"),
            PREFIX,
            Options::new().batch_delay(Duration::from_secs(3600)),
        )
        .unwrap();
        db.set_batch("/k", b"old").unwrap();
        db.set("/k", b"new").unwrap();
        assert_eq!(db.get("/k").unwrap().unwrap(), b"new");
    }

    #[test]
    fn test_delete_and_delete_prefix() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("db"), PREFIX, Options::new()).unwrap();
        for i in 0..50 {
            db.set(&format!("/{i:03}"), b"v").unwrap();
        }

        db.delete(&["/027", "/038", "/041", "/notthere"]).unwrap();
        db.delete_prefix("/01").unwrap();

        let mut keys = Vec::new();
        db.scan("", |k, _| {
            keys.push(k.to_string());
            true
        })
        .unwrap();
        assert_eq!(keys.len(), 50 - 3 - 10);
        assert!(!keys.contains(&"/027".to_string()));
        assert!(!keys.iter().any(|k| k.starts_with("/01")));
    }

    #[test]
    fn test_scan_from_start_key() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("db"), PREFIX, Options::new()).unwrap();
        for i in 0..10 {
            db.set(&format!("/z/{i:02}"), b"v").unwrap();
        }

        let mut keys = Vec::new();
        db.scan("/z/03", |k, _| {
            keys.push(k.to_string());
            true
        })
        .unwrap();
        assert_eq!(keys.first().unwrap(), "/z/03");
        assert_eq!(keys.len(), 7);
    }

    #[test]
    fn test_error_log_two_indexes() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("db"), PREFIX, Options::new()).unwrap();

        let t = |s: i64| Utc.timestamp_opt(s, 0).unwrap();
        db.log_error(t(100), "/a", b"first").unwrap();
        db.log_error(t(200), "/b", b"second").unwrap();
        db.log_error(t(300), "/a", b"third").unwrap();

        let mut seen = Vec::new();
        db.visit_errors_when(t(150), t(1000), |when, key, detail| {
            seen.push((when, key.to_string(), detail.to_vec()));
            true
        })
        .unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, "/b");
        assert_eq!(seen[1].1, "/a");

        let mut seen = Vec::new();
        db.visit_errors_key("/a", |when, key, detail| {
            seen.push((when, key.to_string(), detail.to_vec()));
            true
        })
        .unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, t(100));
        assert_eq!(seen[0].2, b"first");
        assert_eq!(seen[1].0, t(300));
    }

    #[test]
    fn test_erase() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let db = Database::open(&path, PREFIX, Options::new()).unwrap();
        db.set("/a", b"x").unwrap();
        db.log_error(Utc::now(), "/a", b"oops").unwrap();
        db.erase().unwrap();

        assert!(db.get("/a").unwrap().is_none());
        let counts = db.counts().unwrap();
        assert_eq!(counts.data, 0);
        assert_eq!(counts.errors, 0);
    }

    #[test]
    fn test_counts() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("db"), PREFIX, Options::new()).unwrap();
        db.set("/a", b"x").unwrap();
        db.set("/b", b"y").unwrap();
        db.log_error(Utc::now(), "/a", b"oops").unwrap();

        let counts = db.counts().unwrap();
        assert_eq!(counts.data, 2);
        assert_eq!(counts.errors, 1);
    }
}
