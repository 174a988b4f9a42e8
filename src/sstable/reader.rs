//! Table reader: resolves lookups through the index block, the optional
//! filter, and the block cache, and iterates whole tables.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use bytes::Bytes;

use crate::cache::Cache;
use crate::config::{CompressionType, Options, ReadOptions};
use crate::error::{Error, Result};
use crate::iterator::KvIter;
use crate::key::{extract_user_key, Comparator, InternalKeyComparator};
use crate::sstable::block::{Block, BlockIter};
use crate::sstable::filter_block::FilterBlockReader;
use crate::sstable::footer::{BlockHandle, Footer};
use crate::sstable::{BLOCK_TRAILER_SIZE, FOOTER_SIZE};
use crate::util::coding::decode_fixed32;
use crate::util::crc;

/// Cache of decoded blocks shared by all tables of a database, keyed by
/// `(table cache id, block offset)`.
pub type BlockCache = Cache<(u64, u64), Block>;

/// An open, immutable table file.
pub struct Table {
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    icmp_arc: Arc<dyn Comparator>,
    file: File,
    index_block: Block,
    filter: Option<FilterBlockReader>,
    block_cache: Option<Arc<BlockCache>>,
    cache_id: u64,
}

impl Table {
    /// Opens a table of `file_size` bytes: reads the footer, the index
    /// block, and (when a policy is configured) the filter block.
    pub fn open(
        options: Arc<Options>,
        icmp: InternalKeyComparator,
        block_cache: Option<Arc<BlockCache>>,
        file: File,
        file_size: u64,
    ) -> Result<Table> {
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::corruption("file is too short to be a table"));
        }

        let mut footer_buf = [0u8; FOOTER_SIZE];
        let mut reader = file.try_clone()?;
        reader.seek(SeekFrom::Start(file_size - FOOTER_SIZE as u64))?;
        reader.read_exact(&mut footer_buf)?;
        let footer = Footer::decode(&footer_buf)?;

        let verify = options.paranoid_checks;
        let index_contents = read_block_contents(&file, &footer.index_handle, verify)?;
        let index_block = Block::new(index_contents)?;

        // Filter block, if this table was built with the configured policy.
        let mut filter = None;
        if let Some(policy) = options.filter_policy.clone() {
            if let Ok(meta_contents) =
                read_block_contents(&file, &footer.meta_index_handle, verify)
            {
                if let Ok(meta_block) = Block::new(meta_contents) {
                    let mut meta_iter =
                        meta_block.iter(Arc::new(crate::key::BytewiseComparator));
                    let key = format!("filter.{}", policy.name());
                    meta_iter.seek(key.as_bytes());
                    if meta_iter.valid() && meta_iter.key() == key.as_bytes() {
                        let mut handle_bytes = meta_iter.value();
                        if let Ok(handle) = BlockHandle::decode_from(&mut handle_bytes) {
                            if let Ok(contents) = read_block_contents(&file, &handle, verify) {
                                filter = Some(FilterBlockReader::new(policy, contents));
                            }
                        }
                    }
                }
            }
        }

        let cache_id = block_cache.as_ref().map(|c| c.new_id()).unwrap_or(0);
        let icmp_arc: Arc<dyn Comparator> = Arc::new(icmp.clone());
        Ok(Table { options, icmp, icmp_arc, file, index_block, filter, block_cache, cache_id })
    }

    /// Reads the data block at `handle`, consulting the block cache.
    fn block_for_handle(&self, read_options: &ReadOptions, handle: &BlockHandle) -> Result<Block> {
        if let Some(cache) = &self.block_cache {
            let cache_key = (self.cache_id, handle.offset);
            if let Some(block) = cache.get(&cache_key) {
                return Ok(block);
            }
            let contents =
                read_block_contents(&self.file, handle, read_options.verify_checksums)?;
            let block = Block::new(contents)?;
            if read_options.fill_cache {
                cache.insert(cache_key, block.clone(), block.size());
            }
            return Ok(block);
        }

        let contents = read_block_contents(&self.file, handle, read_options.verify_checksums)?;
        Block::new(contents)
    }

    /// Point lookup for an encoded internal key.
    ///
    /// Returns the first entry at or after `internal_key`, which the caller
    /// inspects for user-key equality and value type. `None` means the table
    /// cannot contain the key.
    pub fn internal_get(
        &self,
        read_options: &ReadOptions,
        internal_key: &[u8],
    ) -> Result<Option<(Vec<u8>, Bytes)>> {
        let mut index_iter = self.index_block.iter(self.icmp_arc.clone());
        index_iter.seek(internal_key);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let mut handle_bytes = index_iter.value();
        let handle = BlockHandle::decode_from(&mut handle_bytes)?;

        if let Some(filter) = &self.filter {
            if !filter.key_may_match(handle.offset, extract_user_key(internal_key)) {
                return Ok(None);
            }
        }

        let block = self.block_for_handle(read_options, &handle)?;
        let mut block_iter = block.iter(self.icmp_arc.clone());
        block_iter.seek(internal_key);
        if !block_iter.valid() {
            block_iter.status()?;
            return Ok(None);
        }
        Ok(Some((block_iter.key().to_vec(), Bytes::copy_from_slice(block_iter.value()))))
    }

    /// The table's internal-key comparator.
    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    /// Iterates every entry of the table in internal-key order.
    pub fn iter(self: &Arc<Self>, read_options: ReadOptions) -> TableIter {
        TableIter {
            index_iter: self.index_block.iter(self.icmp_arc.clone()),
            table: Arc::clone(self),
            read_options,
            data_iter: None,
            current_handle: None,
            status: None,
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("cache_id", &self.cache_id)
            .field("filter", &self.filter.is_some())
            .field("block_restart_interval", &self.options.block_restart_interval)
            .finish()
    }
}

/// Reads one stored block: payload + trailer, checksum check, decompression.
fn read_block_contents(file: &File, handle: &BlockHandle, verify: bool) -> Result<Bytes> {
    let total = handle.size as usize + BLOCK_TRAILER_SIZE;
    let mut buf = vec![0u8; total];
    let mut reader = file.try_clone()?;
    reader.seek(SeekFrom::Start(handle.offset))?;
    reader.read_exact(&mut buf)?;

    let payload_len = handle.size as usize;
    let type_byte = buf[payload_len];
    if verify {
        let stored = crc::unmask(decode_fixed32(&buf[payload_len + 1..]));
        let actual = crc::value(&buf[..payload_len + 1]);
        if stored != actual {
            return Err(Error::corruption("block checksum mismatch"));
        }
    }

    let compression = CompressionType::from_u8(type_byte)
        .ok_or_else(|| Error::corruption(format!("unknown block type {:#x}", type_byte)))?;
    buf.truncate(payload_len);

    match compression {
        CompressionType::None => Ok(Bytes::from(buf)),
        CompressionType::Snappy => {
            #[cfg(feature = "snappy")]
            {
                let decompressed = snap::raw::Decoder::new()
                    .decompress_vec(&buf)
                    .map_err(|e| Error::corruption(format!("corrupt snappy block: {}", e)))?;
                Ok(Bytes::from(decompressed))
            }
            #[cfg(not(feature = "snappy"))]
            {
                Err(Error::not_supported("snappy support not compiled in"))
            }
        }
    }
}

/// Two-level iterator over a table: the index block selects data blocks,
/// each data block supplies the entries.
pub struct TableIter {
    table: Arc<Table>,
    read_options: ReadOptions,
    index_iter: BlockIter,
    data_iter: Option<BlockIter>,
    // Handle of the block data_iter was built from, to skip reloads.
    current_handle: Option<BlockHandle>,
    status: Option<Error>,
}

impl TableIter {
    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            self.current_handle = None;
            return;
        }
        let mut handle_bytes = self.index_iter.value();
        let handle = match BlockHandle::decode_from(&mut handle_bytes) {
            Ok(handle) => handle,
            Err(err) => {
                self.status = Some(err);
                self.data_iter = None;
                self.current_handle = None;
                return;
            }
        };
        if self.current_handle == Some(handle) && self.data_iter.is_some() {
            return;
        }
        match self.table.block_for_handle(&self.read_options, &handle) {
            Ok(block) => {
                self.data_iter = Some(block.iter(self.table.icmp_arc.clone()));
                self.current_handle = Some(handle);
            }
            Err(err) => {
                self.status = Some(err);
                self.data_iter = None;
                self.current_handle = None;
            }
        }
    }

    fn skip_empty_blocks_forward(&mut self) {
        while self.data_iter.as_ref().map(|it| !it.valid()).unwrap_or(true) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                self.current_handle = None;
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(data_iter) = self.data_iter.as_mut() {
                data_iter.seek_to_first();
            }
        }
    }

    fn skip_empty_blocks_backward(&mut self) {
        while self.data_iter.as_ref().map(|it| !it.valid()).unwrap_or(true) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                self.current_handle = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(data_iter) = self.data_iter.as_mut() {
                data_iter.seek_to_last();
            }
        }
    }
}

impl KvIter for TableIter {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().map(|it| it.valid()).unwrap_or(false)
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(data_iter) = self.data_iter.as_mut() {
            data_iter.seek_to_first();
        }
        self.skip_empty_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(data_iter) = self.data_iter.as_mut() {
            data_iter.seek_to_last();
        }
        self.skip_empty_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(data_iter) = self.data_iter.as_mut() {
            data_iter.seek(target);
        }
        self.skip_empty_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().unwrap().next();
        self.skip_empty_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().unwrap().prev();
        self.skip_empty_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().unwrap().value()
    }

    fn status(&self) -> Result<()> {
        if let Some(err) = &self.status {
            return Err(err.clone());
        }
        self.index_iter.status()?;
        if let Some(data_iter) = &self.data_iter {
            data_iter.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::BloomFilterPolicy;
    use crate::key::{BytewiseComparator, InternalKey, ValueType};
    use crate::sstable::TableBuilder;
    use tempfile::TempDir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn build_table(
        dir: &TempDir,
        options: Arc<Options>,
        entries: &[(InternalKey, &[u8])],
    ) -> (std::path::PathBuf, u64) {
        let path = dir.path().join("000007.ldb");
        let file = File::create(&path).unwrap();
        let mut builder = TableBuilder::new(options, icmp(), file);
        for (key, value) in entries {
            builder.add(key.encoded(), value).unwrap();
        }
        let size = builder.finish().unwrap();
        (path, size)
    }

    fn open_table(path: &std::path::Path, size: u64, options: Arc<Options>) -> Arc<Table> {
        let file = File::open(path).unwrap();
        Arc::new(Table::open(options, icmp(), None, file, size).unwrap())
    }

    fn entry(key: &str, seq: u64, value: &'static str) -> (InternalKey, &'static [u8]) {
        (InternalKey::new(key.as_bytes(), seq, ValueType::Value), value.as_bytes())
    }

    #[test]
    fn test_table_roundtrip() {
        let dir = TempDir::new().unwrap();
        let options = Arc::new(Options::default());
        let entries =
            vec![entry("apple", 1, "red"), entry("banana", 2, "yellow"), entry("cherry", 3, "dark")];
        let (path, size) = build_table(&dir, options.clone(), &entries);
        let table = open_table(&path, size, options);

        let read_options = ReadOptions::new();
        for (key, value) in &entries {
            let found = table.internal_get(&read_options, key.encoded()).unwrap().unwrap();
            assert_eq!(extract_user_key(&found.0), key.user_key());
            assert_eq!(&found.1[..], *value);
        }
    }

    #[test]
    fn test_table_get_absent() {
        let dir = TempDir::new().unwrap();
        let options = Arc::new(Options::default());
        let entries = vec![entry("b", 1, "v")];
        let (path, size) = build_table(&dir, options.clone(), &entries);
        let table = open_table(&path, size, options);

        let read_options = ReadOptions::new();
        let probe = InternalKey::new(b"zzz", u64::MAX >> 8, ValueType::Value);
        assert!(table.internal_get(&read_options, probe.encoded()).unwrap().is_none());

        // A probe before the first key lands on the first entry; the caller
        // rejects it by user key.
        let probe = InternalKey::new(b"a", u64::MAX >> 8, ValueType::Value);
        let found = table.internal_get(&read_options, probe.encoded()).unwrap().unwrap();
        assert_eq!(extract_user_key(&found.0), b"b");
    }

    #[test]
    fn test_table_iterator_multiple_blocks() {
        let dir = TempDir::new().unwrap();
        let mut options = Options::default();
        options.block_size = 256; // force many blocks
        options.compression = CompressionType::None;
        let options = Arc::new(options);

        let mut entries = Vec::new();
        for i in 0..500u64 {
            entries.push((
                InternalKey::new(format!("key{:05}", i).as_bytes(), i + 1, ValueType::Value),
                b"some value material" as &[u8],
            ));
        }
        let (path, size) = build_table(&dir, options.clone(), &entries);
        let table = open_table(&path, size, options);

        let mut iter = table.iter(ReadOptions::new());
        iter.seek_to_first();
        let mut count = 0;
        let mut last_key: Option<Vec<u8>> = None;
        while iter.valid() {
            if let Some(prev) = &last_key {
                assert!(icmp().compare(prev, iter.key()) == std::cmp::Ordering::Less);
            }
            last_key = Some(iter.key().to_vec());
            count += 1;
            iter.next();
        }
        assert_eq!(count, 500);
        assert!(iter.status().is_ok());

        // Seek into the middle.
        let target = InternalKey::new(b"key00250", u64::MAX >> 8, ValueType::Value);
        iter.seek(target.encoded());
        assert!(iter.valid());
        assert_eq!(extract_user_key(iter.key()), b"key00250");

        // Reverse scan from the end.
        iter.seek_to_last();
        assert!(iter.valid());
        assert_eq!(extract_user_key(iter.key()), b"key00499");
        iter.prev();
        assert_eq!(extract_user_key(iter.key()), b"key00498");
    }

    #[test]
    fn test_table_with_filter_and_cache() {
        let dir = TempDir::new().unwrap();
        let mut options = Options::default();
        options.filter_policy = Some(Arc::new(BloomFilterPolicy::new(10)));
        options.block_size = 512;
        let options = Arc::new(options);

        let mut entries = Vec::new();
        for i in 0..200u64 {
            entries.push((
                InternalKey::new(format!("key{:05}", i).as_bytes(), i + 1, ValueType::Value),
                b"filtered value" as &[u8],
            ));
        }
        let (path, size) = build_table(&dir, options.clone(), &entries);

        let cache = Arc::new(BlockCache::new(1 << 20));
        let file = File::open(&path).unwrap();
        let table = Arc::new(
            Table::open(options, icmp(), Some(cache.clone()), file, size).unwrap(),
        );

        let read_options = ReadOptions::new();
        for (key, _) in &entries {
            assert!(table.internal_get(&read_options, key.encoded()).unwrap().is_some());
        }
        // Cache was populated by the reads.
        assert!(cache.total_charge() > 0);

        // Probing absent keys mostly short-circuits through the filter; all
        // must report absent either way.
        for i in 0..200u64 {
            let probe = InternalKey::new(
                format!("nope{:05}", i).as_bytes(),
                u64::MAX >> 8,
                ValueType::Value,
            );
            let result = table.internal_get(&read_options, probe.encoded()).unwrap();
            if let Some((found_key, _)) = result {
                assert_ne!(extract_user_key(&found_key), probe.user_key());
            }
        }
    }

    #[test]
    fn test_corrupt_block_detected() {
        let dir = TempDir::new().unwrap();
        let mut options = Options::default();
        options.compression = CompressionType::None;
        let options = Arc::new(options);
        let entries = vec![entry("somekey", 1, "somevalue")];
        let (path, size) = build_table(&dir, options.clone(), &entries);

        // Flip a byte inside the first data block.
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(3)).unwrap();
        file.write_all(&[0xff]).unwrap();
        drop(file);

        let table = open_table(&path, size, options);
        let mut read_options = ReadOptions::new();
        read_options.verify_checksums = true;
        let probe = InternalKey::new(b"somekey", u64::MAX >> 8, ValueType::Value);
        assert!(table.internal_get(&read_options, probe.encoded()).is_err());
    }
}
