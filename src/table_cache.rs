//! Table cache: keeps a bounded number of table files open and decoded.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use crate::cache::Cache;
use crate::config::{Options, ReadOptions};
use crate::error::Result;
use crate::key::InternalKeyComparator;
use crate::sstable::reader::BlockCache;
use crate::sstable::{Table, TableIter};
use crate::db::filename::{sst_table_file_name, table_file_name};

/// File descriptors reserved for uses other than the table cache.
const RESERVED_FILES: usize = 10;

/// LRU of open tables, keyed by file number.
pub struct TableCache {
    dbname: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    block_cache: Option<Arc<BlockCache>>,
    cache: Cache<u64, Arc<Table>>,
}

impl TableCache {
    /// Creates a cache sized from `Options::max_open_files`.
    pub fn new(
        dbname: PathBuf,
        options: Arc<Options>,
        icmp: InternalKeyComparator,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Self {
        let entries = options.max_open_files.saturating_sub(RESERVED_FILES).max(1);
        Self { dbname, options, icmp, block_cache, cache: Cache::new(entries) }
    }

    /// Returns the open table for `file_number`, opening it on a miss.
    pub fn find_table(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.cache.get(&file_number) {
            return Ok(table);
        }

        let path = table_file_name(&self.dbname, file_number);
        let file = match File::open(&path) {
            Ok(file) => file,
            // Fall back to the legacy suffix.
            Err(_) => File::open(sst_table_file_name(&self.dbname, file_number))?,
        };
        let table = Arc::new(Table::open(
            self.options.clone(),
            self.icmp.clone(),
            self.block_cache.clone(),
            file,
            file_size,
        )?);
        // Each cached table counts as one open file.
        self.cache.insert(file_number, table.clone(), 1);
        Ok(table)
    }

    /// Point lookup inside one table; see [`Table::internal_get`].
    pub fn get(
        &self,
        read_options: &ReadOptions,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
    ) -> Result<Option<(Vec<u8>, Bytes)>> {
        let table = self.find_table(file_number, file_size)?;
        table.internal_get(read_options, internal_key)
    }

    /// Iterates one table.
    pub fn iter(
        &self,
        read_options: ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> Result<TableIter> {
        let table = self.find_table(file_number, file_size)?;
        Ok(table.iter(read_options))
    }

    /// Drops the cached handle for a deleted file.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number);
    }
}
