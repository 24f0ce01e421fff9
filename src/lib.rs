//! idu - Incremental Disk Usage
//!
//! Walks configured filesystem prefixes, stores one compact record per
//! directory in an embedded ordered key-value store, and answers
//! aggregate queries (totals, per-user/per-group rollups, top-N prefixes)
//! incrementally: a repeated scan re-stats only the entries whose listing
//! metadata changed.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Scan engine                            │
//! │  ┌─────────┐  ┌─────────┐          ┌─────────┐               │
//! │  │Worker 1 │  │Worker 2 │   ...    │Worker N │  directories  │
//! │  └────┬────┘  └────┬────┘          └────┬────┘               │
//! │       │ list + diff against stored record                    │
//! │       │ stat pool for changed entries                        │
//! │       ▼                                                      │
//! │  ┌──────────────────────────┐                                │
//! │  │   Batched writer         │  set_batch, size/delay flush   │
//! │  └──────────┬───────────────┘                                │
//! └─────────────┼────────────────────────────────────────────────┘
//!               ▼
//!      ┌──────────────────┐
//!      │  per-prefix DB   │  data / log / errors / stats
//!      └──────────────────┘
//!               │
//!               ▼
//!        Aggregator: totals, per-uid/gid, top-N
//! ```
//!
//! Each directory record ([`prefixinfo::PrefixInfo`]) carries the
//! directory's owner and attributes, its children in listing order, and a
//! packed bitmap ([`idmap::IDMap`]) per distinct (uid, gid) when the
//! children are not all owned by the directory's owner.

pub mod aggregate;
pub mod config;
pub mod db;
pub mod diskusage;
pub mod error;
pub mod idmap;
pub mod prefixinfo;
pub mod progress;
pub mod report;
pub mod walker;

pub use config::{Config, PrefixEntry};
pub use db::{Database, Options};
pub use error::{Error, Result};
pub use prefixinfo::{FileInfo, PrefixInfo};
pub use progress::{ScanCounters, ScanSnapshot};
pub use walker::{CancelToken, Walker};
