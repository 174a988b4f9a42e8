//! Table builder: assembles data blocks, the optional filter block, the
//! meta-index and index blocks, and the footer into one immutable file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use bytes::Bytes;

use crate::config::{CompressionType, Options};
use crate::error::{Error, Result};
use crate::key::{extract_user_key, Comparator, InternalKeyComparator};
use crate::sstable::block::BlockBuilder;
use crate::sstable::filter_block::FilterBlockBuilder;
use crate::sstable::footer::{BlockHandle, Footer};
use crate::util::crc;

/// Builds a table file from internal keys added in ascending order.
pub struct TableBuilder {
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    file: BufWriter<File>,
    offset: u64,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_block: Option<FilterBlockBuilder>,
    last_key: Vec<u8>,
    num_entries: u64,
    pending_handle: BlockHandle,
    pending_index_entry: bool,
    closed: bool,
}

impl TableBuilder {
    /// Starts building a table into `file`.
    pub fn new(options: Arc<Options>, icmp: InternalKeyComparator, file: File) -> Self {
        let mut filter_block =
            options.filter_policy.as_ref().map(|policy| FilterBlockBuilder::new(policy.clone()));
        if let Some(fb) = filter_block.as_mut() {
            fb.start_block(0);
        }
        Self {
            data_block: BlockBuilder::new(options.block_restart_interval),
            index_block: BlockBuilder::new(1),
            filter_block,
            options,
            icmp,
            file: BufWriter::new(file),
            offset: 0,
            last_key: Vec::new(),
            num_entries: 0,
            pending_handle: BlockHandle::default(),
            pending_index_entry: false,
            closed: false,
        }
    }

    /// Adds an entry. `key` is an encoded internal key and must sort strictly
    /// after every key added before it.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.closed);
        if self.num_entries > 0
            && self.icmp.compare(key, &self.last_key) != std::cmp::Ordering::Greater
        {
            return Err(Error::invalid_argument("keys must be added in ascending order"));
        }

        if self.pending_index_entry {
            // The previous block is complete: emit its index entry with a
            // separator shorter than the real keys where possible.
            debug_assert!(self.data_block.is_empty());
            let separator = self.icmp.find_shortest_separator(&self.last_key, key);
            self.index_block.add(&separator, &self.pending_handle.encode());
            self.pending_index_entry = false;
        }

        if let Some(fb) = self.filter_block.as_mut() {
            fb.add_key(extract_user_key(key));
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Cuts the current data block and writes it out.
    fn flush(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        let contents = self.data_block.finish();
        self.data_block.reset();
        self.pending_handle = self.write_block(&contents)?;
        self.pending_index_entry = true;

        if let Some(fb) = self.filter_block.as_mut() {
            fb.start_block(self.offset);
        }
        Ok(())
    }

    /// Compresses `contents` if configured and worthwhile, then stores it.
    fn write_block(&mut self, contents: &[u8]) -> Result<BlockHandle> {
        match self.options.compression {
            CompressionType::None => self.write_raw_block(contents, CompressionType::None),
            CompressionType::Snappy => {
                #[cfg(feature = "snappy")]
                {
                    let compressed = snap::raw::Encoder::new()
                        .compress_vec(contents)
                        .map_err(|e| Error::corruption(format!("snappy compress: {}", e)))?;
                    // Store compressed only if it saves at least 1/8.
                    if compressed.len() < contents.len() - contents.len() / 8 {
                        return self.write_raw_block(&compressed, CompressionType::Snappy);
                    }
                    self.write_raw_block(contents, CompressionType::None)
                }
                #[cfg(not(feature = "snappy"))]
                {
                    self.write_raw_block(contents, CompressionType::None)
                }
            }
        }
    }

    /// Writes `payload  type  masked_crc` and advances the offset.
    fn write_raw_block(
        &mut self,
        payload: &[u8],
        compression: CompressionType,
    ) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, payload.len() as u64);
        self.file.write_all(payload)?;

        let type_byte = [compression as u8];
        let checksum = crc::mask(crc::value_of_parts(&[payload, &type_byte]));
        let mut trailer = Vec::with_capacity(5);
        trailer.push(compression as u8);
        trailer.extend_from_slice(&checksum.to_le_bytes());
        self.file.write_all(&trailer)?;

        self.offset += payload.len() as u64 + trailer.len() as u64;
        Ok(handle)
    }

    /// Finishes the table: filter, meta-index and index blocks, footer, and
    /// a final fsync. Returns the total file size.
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        debug_assert!(!self.closed);
        self.closed = true;

        // Filter block is stored uncompressed; its contents are not
        // comparator-ordered entries.
        let filter_handle = match self.filter_block.take() {
            Some(fb) => {
                let contents = fb.finish();
                Some(self.write_raw_block(&contents, CompressionType::None)?)
            }
            None => None,
        };

        // Meta-index block: maps "filter.<policy>" to the filter handle.
        let mut meta_index_block = BlockBuilder::new(self.options.block_restart_interval);
        if let Some(handle) = filter_handle {
            let key = format!(
                "filter.{}",
                self.options.filter_policy.as_ref().expect("policy produced a filter").name()
            );
            meta_index_block.add(key.as_bytes(), &handle.encode());
        }
        let meta_contents = meta_index_block.finish();
        let meta_index_handle = self.write_block(&meta_contents)?;

        // Index block, closing out the final data block's entry.
        if self.pending_index_entry {
            let successor = self.icmp.find_short_successor(&self.last_key);
            self.index_block.add(&successor, &self.pending_handle.encode());
            self.pending_index_entry = false;
        }
        let index_contents: Bytes = self.index_block.finish();
        let index_handle = self.write_block(&index_contents)?;

        let footer = Footer::new(meta_index_handle, index_handle);
        self.file.write_all(&footer.encode())?;
        self.offset += crate::sstable::FOOTER_SIZE as u64;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(self.offset)
    }

    /// Abandons the build; the partially written file is the caller's to
    /// delete.
    pub fn abandon(mut self) {
        self.closed = true;
    }

    /// Entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far (finished blocks only).
    pub fn file_size(&self) -> u64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{BytewiseComparator, InternalKey, ValueType};
    use tempfile::TempDir;

    fn test_options() -> Arc<Options> {
        let mut options = Options::default();
        options.compression = CompressionType::None;
        Arc::new(options)
    }

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    #[test]
    fn test_build_small_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000001.ldb");
        let file = File::create(&path).unwrap();
        let mut builder = TableBuilder::new(test_options(), icmp(), file);

        for i in 0..10u64 {
            let key = InternalKey::new(format!("key{:03}", i).as_bytes(), i + 1, ValueType::Value);
            builder.add(key.encoded(), b"value").unwrap();
        }
        assert_eq!(builder.num_entries(), 10);

        let size = builder.finish().unwrap();
        assert!(size > 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
    }

    #[test]
    fn test_rejects_out_of_order() {
        let dir = TempDir::new().unwrap();
        let file = File::create(dir.path().join("t.ldb")).unwrap();
        let mut builder = TableBuilder::new(test_options(), icmp(), file);

        let k2 = InternalKey::new(b"b", 2, ValueType::Value);
        let k1 = InternalKey::new(b"a", 1, ValueType::Value);
        builder.add(k2.encoded(), b"v").unwrap();
        assert!(builder.add(k1.encoded(), b"v").is_err());
    }

    #[test]
    fn test_same_user_key_descending_sequence_ok() {
        let dir = TempDir::new().unwrap();
        let file = File::create(dir.path().join("t.ldb")).unwrap();
        let mut builder = TableBuilder::new(test_options(), icmp(), file);

        // Internal order puts the higher sequence first.
        let newer = InternalKey::new(b"k", 9, ValueType::Value);
        let older = InternalKey::new(b"k", 3, ValueType::Value);
        builder.add(newer.encoded(), b"new").unwrap();
        builder.add(older.encoded(), b"old").unwrap();
        builder.finish().unwrap();
    }
}
