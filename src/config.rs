//! Configuration options and engine-wide tuning constants.

use std::fmt;
use std::sync::Arc;

use crate::filter::FilterPolicy;
use crate::key::{BytewiseComparator, Comparator};
use crate::snapshot::Snapshot;

/// Number of levels in the tree.
pub const NUM_LEVELS: usize = 7;

/// Number of level-0 files that triggers a compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Number of level-0 files at which writes are slowed by a 1 ms pause.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Number of level-0 files at which writes stall completely.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Highest level a fresh memtable flush may be pushed to when nothing
/// overlaps it.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Approximate gap in bytes between read samples taken by iterators.
pub const READ_BYTES_PERIOD: usize = 1024 * 1024;

/// Per-block compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    /// Store block payloads verbatim.
    None = 0,
    /// Snappy-compress payloads when it saves at least 1/8 of the size.
    Snappy = 1,
}

impl CompressionType {
    /// Converts a stored trailer byte, rejecting unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

/// Configuration options for opening a database.
#[derive(Clone)]
pub struct Options {
    /// Create the database if it doesn't exist.
    /// Default: false
    pub create_if_missing: bool,

    /// Error if the database already exists.
    /// Default: false
    pub error_if_exists: bool,

    /// Treat recovery anomalies (e.g. a corrupt WAL tail) as hard errors
    /// instead of logged warnings.
    /// Default: false
    pub paranoid_checks: bool,

    /// Amount of data to buffer in the memtable before rotating it out for
    /// a background flush.
    /// Default: 4 MiB
    pub write_buffer_size: usize,

    /// Maximum number of open files usable by the table cache, of which 10
    /// are reserved for other engine uses.
    /// Default: 1000
    pub max_open_files: usize,

    /// Capacity of the uncompressed-block LRU cache, in bytes.
    /// Default: 8 MiB
    pub block_cache_size: usize,

    /// Approximate uncompressed size of a table data block.
    /// Default: 4 KiB
    pub block_size: usize,

    /// Number of keys between prefix-compression restart points.
    /// Default: 16
    pub block_restart_interval: usize,

    /// Size at which a compaction output file is cut.
    /// Default: 2 MiB
    pub max_file_size: u64,

    /// Per-block compression.
    /// Default: Snappy
    pub compression: CompressionType,

    /// Append to the existing manifest on open instead of starting a new
    /// one. Data logs are always rotated on open regardless.
    /// Default: false
    pub reuse_logs: bool,

    /// Ordering over user keys. The skiplist memtable assumes an ordering
    /// compatible with bytewise comparison.
    /// Default: BytewiseComparator
    pub comparator: Arc<dyn Comparator>,

    /// Filter policy applied per table, or None for no filter blocks.
    /// Default: None
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_cache_size: 8 * 1024 * 1024,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            max_file_size: 2 * 1024 * 1024,
            compression: CompressionType::Snappy,
            reuse_logs: false,
            comparator: Arc::new(BytewiseComparator),
            filter_policy: None,
        }
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether opening an existing database is an error.
    pub fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets the memtable rotation threshold.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Sets the table data block size.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the block cache capacity.
    pub fn block_cache_size(mut self, size: usize) -> Self {
        self.block_cache_size = size;
        self
    }

    /// Sets the compaction output file size limit.
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Sets the per-block compression.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Installs a filter policy.
    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    /// Validates the options.
    pub fn validate(&self) -> crate::Result<()> {
        if self.write_buffer_size == 0 {
            return Err(crate::Error::invalid_argument("write_buffer_size must be > 0"));
        }
        if self.block_size == 0 {
            return Err(crate::Error::invalid_argument("block_size must be > 0"));
        }
        if self.block_restart_interval == 0 {
            return Err(crate::Error::invalid_argument("block_restart_interval must be > 0"));
        }
        if self.max_file_size == 0 {
            return Err(crate::Error::invalid_argument("max_file_size must be > 0"));
        }
        if self.max_open_files <= 10 {
            return Err(crate::Error::invalid_argument("max_open_files must exceed 10"));
        }
        Ok(())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("paranoid_checks", &self.paranoid_checks)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_open_files", &self.max_open_files)
            .field("block_cache_size", &self.block_cache_size)
            .field("block_size", &self.block_size)
            .field("block_restart_interval", &self.block_restart_interval)
            .field("max_file_size", &self.max_file_size)
            .field("compression", &self.compression)
            .field("reuse_logs", &self.reuse_logs)
            .field("comparator", &self.comparator.name())
            .field("filter_policy", &self.filter_policy.as_ref().map(|p| p.name()))
            .finish()
    }
}

/// Options controlling a single write.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Fsync the WAL before acknowledging the write.
    /// Default: false
    pub sync: bool,
}

impl WriteOptions {
    /// Returns write options with `sync` enabled.
    pub fn sync() -> Self {
        Self { sync: true }
    }
}

/// Options controlling a single read or iterator.
#[derive(Clone, Default)]
pub struct ReadOptions {
    /// Verify block checksums on every read.
    /// Default: false
    pub verify_checksums: bool,

    /// Populate the block cache with blocks read for this operation.
    /// Default: true — note `Default::default()` yields `false` for bools,
    /// so construct via `ReadOptions::new()` unless all fields are set.
    pub fill_cache: bool,

    /// Read as of this snapshot instead of the latest state.
    /// Default: None
    pub snapshot: Option<Snapshot>,
}

impl ReadOptions {
    /// Returns read options with the documented defaults.
    pub fn new() -> Self {
        Self { verify_checksums: false, fill_cache: true, snapshot: None }
    }

    /// Reads as of `snapshot`.
    pub fn at_snapshot(snapshot: Snapshot) -> Self {
        Self { snapshot: Some(snapshot), ..Self::new() }
    }
}

impl fmt::Debug for ReadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOptions")
            .field("verify_checksums", &self.verify_checksums)
            .field("fill_cache", &self.fill_cache)
            .field("snapshot", &self.snapshot.as_ref().map(|s| s.sequence()))
            .finish()
    }
}
