//! Per-prefix metadata database
//!
//! Each configured prefix stores its state in a single database file. The
//! file hosts five namespaces under the prefix:
//!
//! - `data`: path -> encoded PrefixInfo, ordered so a scan from a key
//!   visits parents before children
//! - `log`: scan runs, keyed by start time
//! - `errors_when` / `errors_key`: per-path error records, indexed both by
//!   time and by path
//! - `stats`: aggregator output
//!
//! The store is single-writer, multi-reader. A writable open takes an
//! advisory lock on a sidecar file; read-only opens skip the lock and may
//! be held concurrently. Within one process concurrent openings share the
//! underlying engine handle through a registry keyed by database path.

mod store;

pub use store::{Database, NamespaceCounts};

use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

/// Default delay before a partially filled batch is committed.
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(100);

/// Default number of batched writes that forces a commit.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Open options for [`Database::open`].
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub(crate) read_only: bool,
    pub(crate) lock_timeout: Option<Duration>,
    pub(crate) batch_delay: Option<Duration>,
    pub(crate) batch_size: Option<usize>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open without the writer lock; mutating operations are rejected.
    /// Any number of read-only openings may coexist.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Give up on the writer lock after `d` instead of blocking forever.
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.lock_timeout = Some(d);
        self
    }

    /// Delay before a partially filled batch commits. Zero makes
    /// `set_batch` equivalent to `set`.
    pub fn batch_delay(mut self, d: Duration) -> Self {
        self.batch_delay = Some(d);
        self
    }

    /// Number of batched writes that forces an immediate commit.
    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = Some(n);
        self
    }
}

/// Advisory writer lock on a sidecar file next to the database.
#[derive(Debug)]
pub(crate) struct FileLock {
    file: std::fs::File,
}

impl FileLock {
    /// Acquire the exclusive lock, blocking forever by default or until
    /// `timeout` elapses.
    pub(crate) fn acquire(path: &Path, timeout: Option<Duration>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let fd = file.as_raw_fd();
        match timeout {
            None => {
                let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
                if rc != 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
                    if rc == 0 {
                        break;
                    }
                    let err = std::io::Error::last_os_error();
                    if err.kind() != std::io::ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Lock file path for a database file.
pub(crate) fn lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "db".to_string());
    name.push_str(".lock");
    db_path.with_file_name(name)
}

type Registry = Mutex<HashMap<PathBuf, Weak<redb::Database>>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Return the process-shared engine handle for `path`, opening or creating
/// the file as needed. Concurrent openings of one file share one handle.
pub(crate) fn shared_engine(path: &Path, create: bool) -> Result<Arc<redb::Database>> {
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock();
    map.retain(|_, weak| weak.strong_count() > 0);

    let key = path.to_path_buf();
    if let Some(db) = map.get(&key).and_then(Weak::upgrade) {
        return Ok(db);
    }
    if !create && !path.exists() {
        return Err(Error::NotFound);
    }
    let db = if create {
        redb::Database::create(path)?
    } else {
        redb::Database::open(path)?
    };
    let db = Arc::new(db);
    map.insert(key, Arc::downgrade(&db));
    Ok(db)
}

/// Encode a timestamp as an 8-byte big-endian key so lexicographic order
/// is time order.
pub(crate) fn ts_key(t: DateTime<Utc>) -> [u8; 8] {
    (t.timestamp_nanos_opt().unwrap_or(0) as u64).to_be_bytes()
}

pub(crate) fn ts_from_key(b: &[u8]) -> Result<DateTime<Utc>> {
    if b.len() < 8 {
        return Err(Error::CorruptRecord("truncated timestamp key".into()));
    }
    let nanos = u64::from_be_bytes(b[..8].try_into().unwrap());
    Ok(Utc.timestamp_nanos(nanos as i64))
}

/// `errors_when` key: timestamp, NUL, path. Paths cannot contain NUL.
pub(crate) fn error_when_key(when: DateTime<Utc>, key: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + key.len());
    buf.extend_from_slice(&ts_key(when));
    buf.push(0);
    buf.extend_from_slice(key.as_bytes());
    buf
}

pub(crate) fn split_error_when_key(raw: &[u8]) -> Result<(DateTime<Utc>, &str)> {
    if raw.len() < 9 || raw[8] != 0 {
        return Err(Error::CorruptRecord("malformed error-by-time key".into()));
    }
    let when = ts_from_key(raw)?;
    let key = std::str::from_utf8(&raw[9..])
        .map_err(|_| Error::CorruptRecord("error key is not utf-8".into()))?;
    Ok((when, key))
}

/// `errors_key` key: path, NUL, timestamp.
pub(crate) fn error_key_key(key: &str, when: DateTime<Utc>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + key.len());
    buf.extend_from_slice(key.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&ts_key(when));
    buf
}

pub(crate) fn split_error_key_key(raw: &[u8]) -> Result<(&str, DateTime<Utc>)> {
    if raw.len() < 9 || raw[raw.len() - 9] != 0 {
        return Err(Error::CorruptRecord("malformed error-by-key key".into()));
    }
    let (head, tail) = raw.split_at(raw.len() - 9);
    let key = std::str::from_utf8(head)
        .map_err(|_| Error::CorruptRecord("error key is not utf-8".into()))?;
    Ok((key, ts_from_key(&tail[1..])?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_key_orders() {
        let t1 = Utc.timestamp_opt(100, 0).unwrap();
        let t2 = Utc.timestamp_opt(100, 1).unwrap();
        let t3 = Utc.timestamp_opt(101, 0).unwrap();
        assert!(ts_key(t1) < ts_key(t2));
        assert!(ts_key(t2) < ts_key(t3));
        assert_eq!(ts_from_key(&ts_key(t2)).unwrap(), t2);
    }

    #[test]
    fn test_error_key_round_trip() {
        let when = Utc.timestamp_opt(1_691_700_000, 42).unwrap();
        let raw = error_when_key(when, "/a/b");
        let (got_when, got_key) = split_error_when_key(&raw).unwrap();
        assert_eq!(got_when, when);
        assert_eq!(got_key, "/a/b");

        let raw = error_key_key("/a/b", when);
        let (got_key, got_when) = split_error_key_key(&raw).unwrap();
        assert_eq!(got_key, "/a/b");
        assert_eq!(got_when, when);
    }

    #[test]
    fn test_lock_path() {
        assert_eq!(
            lock_path(Path::new("/tmp/x/idu.db")),
            PathBuf::from("/tmp/x/idu.db.lock")
        );
    }
}
