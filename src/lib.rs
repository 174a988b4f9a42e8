//! # siltdb — an embedded LSM-tree key-value store
//!
//! siltdb is a persistent, ordered map from byte-string keys to byte-string
//! values, organised as a log-structured merge tree: recent writes live in
//! an in-memory table backed by a write-ahead log, and older data settles
//! into immutable sorted files arranged in levels of growing size.
//!
//! ## Architecture
//!
//! - **Write path**: batched group commit through a single writer queue,
//!   WAL append (optionally fsynced), then a lock-free skiplist memtable
//! - **Background pipeline**: memtable flushes to level 0, plus size- and
//!   seek-triggered compactions that merge overlapping files downwards
//! - **Metadata**: an immutable `Version` per state, evolved by version
//!   edits logged to a manifest; `CURRENT` names the active manifest
//! - **Tables**: prefix-compressed blocks with restart points, optional
//!   Bloom filters, CRC-framed storage, and an LRU block cache
//!
//! ## Example
//!
//! ```rust,no_run
//! use siltdb::{Options, ReadOptions, DB};
//!
//! # fn main() -> Result<(), siltdb::Error> {
//! let db = DB::open("./data", Options::new().create_if_missing(true))?;
//!
//! db.put(b"key1", b"value1")?;
//! db.put(b"key2", b"value2")?;
//!
//! if let Some(value) = db.get(b"key1")? {
//!     println!("found: {:?}", value);
//! }
//!
//! // Snapshots give repeatable reads.
//! let snapshot = db.snapshot();
//! db.delete(b"key1")?;
//! assert!(db.get_opt(&ReadOptions::at_snapshot(snapshot), b"key1")?.is_some());
//!
//! // Ordered iteration over everything.
//! let mut iter = db.iter(&ReadOptions::new())?;
//! iter.seek_to_first();
//! while iter.valid() {
//!     println!("{:?} = {:?}", iter.key(), iter.value());
//!     iter.next();
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod batch;
pub mod cache;
pub mod compaction;
pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod iterator;
pub mod key;
pub mod memtable;
pub mod snapshot;
pub mod sstable;
pub mod table_cache;
pub mod util;
pub mod version;
pub mod wal;

pub use batch::WriteBatch;
pub use config::{CompressionType, Options, ReadOptions, WriteOptions};
pub use db::{DbIterator, DB};
pub use error::{Error, Result};
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use key::{BytewiseComparator, Comparator};
pub use snapshot::Snapshot;
