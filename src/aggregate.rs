//! Offline aggregation over stored records
//!
//! One ordered pass over the data namespace decodes every directory
//! record and accumulates totals globally and per uid/gid, plus top-N
//! prefixes by file count, child count, and disk usage. Storage bytes
//! apply the prefix's configured calculator. Results can be persisted
//! into the stats namespace.

use crate::db::Database;
use crate::diskusage::Calculator;
use crate::error::Result;
use crate::prefixinfo::PrefixInfo;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeMap};
use tracing::warn;

/// Accumulated usage for one owner or for the whole tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    /// Logical bytes across files.
    pub bytes: i64,
    /// Raw bytes after applying the calculator.
    pub storage_bytes: i64,
    /// Non-directory entries.
    pub files: i64,
    /// Directory records.
    pub prefixes: i64,
    /// Bytes held by the directory inodes themselves.
    pub prefix_bytes: i64,
}

/// A prefix and the metric value it ranked on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Metric {
    pub value: i64,
    pub prefix: String,
}

/// Fixed-capacity top-N tracker backed by a min-heap: the smallest
/// retained value is evicted first.
#[derive(Debug)]
pub struct TopN {
    n: usize,
    heap: BinaryHeap<Reverse<Metric>>,
}

impl TopN {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            heap: BinaryHeap::with_capacity(n + 1),
        }
    }

    pub fn push(&mut self, prefix: &str, value: i64) {
        if self.n == 0 {
            return;
        }
        if self.heap.len() == self.n {
            if let Some(Reverse(min)) = self.heap.peek() {
                if value <= min.value {
                    return;
                }
            }
        }
        self.heap.push(Reverse(Metric {
            value,
            prefix: prefix.to_string(),
        }));
        if self.heap.len() > self.n {
            self.heap.pop();
        }
    }

    /// The retained metrics, largest first.
    pub fn into_sorted(self) -> Vec<Metric> {
        let mut out: Vec<Metric> = self.heap.into_iter().map(|Reverse(m)| m).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }
}

/// Restricts which files and prefixes are attributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Global,
    User(u32),
    Group(u32),
}

impl Filter {
    fn admits(&self, uid: u32, gid: u32) -> bool {
        match self {
            Filter::Global => true,
            Filter::User(u) => uid == *u,
            Filter::Group(g) => gid == *g,
        }
    }
}

/// The result of one aggregation pass.
#[derive(Debug, Default)]
pub struct Aggregate {
    pub totals: Totals,
    /// Per-user rollups; populated only for a global pass.
    pub by_uid: BTreeMap<u32, Totals>,
    /// Per-group rollups; populated only for a global pass.
    pub by_gid: BTreeMap<u32, Totals>,
    pub top_files: Vec<Metric>,
    pub top_children: Vec<Metric>,
    pub top_bytes: Vec<Metric>,
}

/// Aggregate every record at or below `start`.
pub fn aggregate(
    db: &Database,
    calc: &dyn Calculator,
    start: &str,
    top_n: usize,
    filter: Filter,
) -> Result<Aggregate> {
    let mut totals = Totals::default();
    let mut by_uid: BTreeMap<u32, Totals> = BTreeMap::new();
    let mut by_gid: BTreeMap<u32, Totals> = BTreeMap::new();
    let mut top_files = TopN::new(top_n);
    let mut top_children = TopN::new(top_n);
    let mut top_bytes = TopN::new(top_n);

    db.scan(start, |key, raw| {
        if !key.starts_with(start) {
            return false;
        }
        let pi = match PrefixInfo::decode(raw) {
            Ok(pi) => pi,
            Err(e) => {
                warn!(key, "skipping undecodable record: {e}");
                return true;
            }
        };

        if filter.admits(pi.uid, pi.gid) {
            totals.prefixes += 1;
            totals.prefix_bytes += pi.size;
        }
        if filter == Filter::Global {
            let t = by_uid.entry(pi.uid).or_default();
            t.prefixes += 1;
            t.prefix_bytes += pi.size;
            let t = by_gid.entry(pi.gid).or_default();
            t.prefixes += 1;
            t.prefix_bytes += pi.size;
        }

        let mut files = 0i64;
        let mut children = 0i64;
        let mut bytes = 0i64;
        let mut storage = 0i64;
        for (i, f) in pi.files.iter().enumerate() {
            let (uid, gid) = pi.user_group(i);
            if f.is_dir() {
                if filter.admits(uid, gid) {
                    children += 1;
                }
                continue;
            }
            if filter.admits(uid, gid) {
                files += 1;
                bytes += f.size;
                storage += calc.raw_bytes(f.size);
            }
            if filter == Filter::Global {
                let t = by_uid.entry(uid).or_default();
                t.files += 1;
                t.bytes += f.size;
                t.storage_bytes += calc.raw_bytes(f.size);
                let t = by_gid.entry(gid).or_default();
                t.files += 1;
                t.bytes += f.size;
                t.storage_bytes += calc.raw_bytes(f.size);
            }
        }
        totals.files += files;
        totals.bytes += bytes;
        totals.storage_bytes += storage;

        top_files.push(key, files);
        top_children.push(key, children);
        top_bytes.push(key, storage);
        true
    })?;

    Ok(Aggregate {
        totals,
        by_uid,
        by_gid,
        top_files: top_files.into_sorted(),
        top_children: top_children.into_sorted(),
        top_bytes: top_bytes.into_sorted(),
    })
}

/// Persist a global aggregate into the stats namespace.
pub fn store(db: &Database, agg: &Aggregate) -> Result<()> {
    let put = |key: &str, value: Vec<u8>| db.set_stats(key, &value);
    put("global", encode(&agg.totals))?;
    for (uid, totals) in &agg.by_uid {
        put(&format!("user/{uid}"), encode(totals))?;
    }
    for (gid, totals) in &agg.by_gid {
        put(&format!("group/{gid}"), encode(totals))?;
    }
    put("top/files", encode(&agg.top_files))?;
    put("top/children", encode(&agg.top_children))?;
    put("top/bytes", encode(&agg.top_bytes))?;
    Ok(())
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("stats records always serialize")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Options;
    use crate::diskusage::{Block, Identity};
    use crate::prefixinfo::FileInfo;
    use tempfile::tempdir;

    fn file(name: &str, size: i64, uid: u32, gid: u32, dir: bool) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size,
            mode: if dir { 0o40755 } else { 0o100644 },
            mod_sec: 1_700_000_000,
            mod_nsec: 0,
            inode: 1,
            uid,
            gid,
        }
    }

    fn record(uid: u32, gid: u32, size: i64, files: Vec<FileInfo>) -> Vec<u8> {
        let mut pi = PrefixInfo::new(uid, gid, 0o40755, 1_700_000_000, 0, size, files);
        pi.create_id_maps();
        pi.encode()
    }

    fn seeded_db(dir: &std::path::Path) -> Database {
        let db = Database::open(dir.join("db"), "/tree", Options::new()).unwrap();
        db.set(
            "/tree",
            &record(
                1,
                1,
                4096,
                vec![
                    file("big.dat", 1000, 1, 1, false),
                    file("sub", 4096, 2, 2, true),
                    file("theirs.dat", 50, 2, 2, false),
                ],
            ),
        )
        .unwrap();
        db.set(
            "/tree/sub",
            &record(
                2,
                2,
                4096,
                vec![
                    file("a.dat", 10, 2, 2, false),
                    file("b.dat", 20, 2, 2, false),
                ],
            ),
        )
        .unwrap();
        db
    }

    #[test]
    fn test_global_totals() {
        let dir = tempdir().unwrap();
        let db = seeded_db(dir.path());
        let agg = aggregate(&db, &Identity, "", 10, Filter::Global).unwrap();

        assert_eq!(agg.totals.files, 4);
        assert_eq!(agg.totals.bytes, 1000 + 50 + 10 + 20);
        assert_eq!(agg.totals.storage_bytes, agg.totals.bytes);
        assert_eq!(agg.totals.prefixes, 2);
        assert_eq!(agg.totals.prefix_bytes, 8192);

        assert_eq!(agg.by_uid[&1].files, 1);
        assert_eq!(agg.by_uid[&1].bytes, 1000);
        assert_eq!(agg.by_uid[&2].files, 3);
        assert_eq!(agg.by_uid[&2].bytes, 80);
        assert_eq!(agg.by_gid[&2].prefixes, 1);
    }

    #[test]
    fn test_user_filter() {
        let dir = tempdir().unwrap();
        let db = seeded_db(dir.path());
        let agg = aggregate(&db, &Identity, "", 10, Filter::User(2)).unwrap();

        assert_eq!(agg.totals.files, 3);
        assert_eq!(agg.totals.bytes, 80);
        assert_eq!(agg.totals.prefixes, 1);
        assert!(agg.by_uid.is_empty());
    }

    #[test]
    fn test_storage_bytes_use_calculator() {
        let dir = tempdir().unwrap();
        let db = seeded_db(dir.path());
        let agg = aggregate(&db, &Block::new(4096), "", 10, Filter::Global).unwrap();

        // Four files, each rounds up to one 4 KiB block.
        assert_eq!(agg.totals.storage_bytes, 4 * 4096);
        assert_eq!(agg.totals.bytes, 1080);
    }

    #[test]
    fn test_top_n() {
        let dir = tempdir().unwrap();
        let db = seeded_db(dir.path());
        let agg = aggregate(&db, &Identity, "", 1, Filter::Global).unwrap();

        assert_eq!(agg.top_files.len(), 1);
        assert_eq!(agg.top_files[0].prefix, "/tree");
        assert_eq!(agg.top_files[0].value, 2);
        assert_eq!(agg.top_bytes[0].prefix, "/tree");
        assert_eq!(agg.top_bytes[0].value, 1050);
        assert_eq!(agg.top_children[0].prefix, "/tree");
        assert_eq!(agg.top_children[0].value, 1);
    }

    #[test]
    fn test_topn_ordering() {
        let mut top = TopN::new(3);
        for (p, v) in [("/a", 5), ("/b", 1), ("/c", 9), ("/d", 3), ("/e", 7)] {
            top.push(p, v);
        }
        let got: Vec<(i64, String)> = top
            .into_sorted()
            .into_iter()
            .map(|m| (m.value, m.prefix))
            .collect();
        assert_eq!(
            got,
            vec![
                (9, "/c".to_string()),
                (7, "/e".to_string()),
                (5, "/a".to_string())
            ]
        );
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempdir().unwrap();
        let db = seeded_db(dir.path());
        let agg = aggregate(&db, &Identity, "", 5, Filter::Global).unwrap();
        store(&db, &agg).unwrap();

        let raw = db.get_stats("global").unwrap().unwrap();
        let totals: Totals = bincode::deserialize(&raw).unwrap();
        assert_eq!(totals, agg.totals);

        let raw = db.get_stats("user/2").unwrap().unwrap();
        let totals: Totals = bincode::deserialize(&raw).unwrap();
        assert_eq!(totals.files, 3);
    }
}
