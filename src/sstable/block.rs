//! Prefix-compressed key/value blocks.
//!
//! Block layout:
//!
//! ```text
//! [entry]*
//! [restart offset: fixed32]*    one per restart point
//! [num restarts: fixed32]
//! ```
//!
//! Each entry shares a prefix with its predecessor:
//!
//! ```text
//! varint32(shared)  varint32(unshared)  varint32(value_len)
//! unshared_key_bytes  value_bytes
//! ```
//!
//! Every `restart_interval`-th entry is written with `shared = 0` and its
//! offset recorded in the restart array, so readers can binary search the
//! restarts and scan forward from the nearest one.

use std::sync::Arc;

use bytes::{BufMut, Bytes};

use crate::error::{Error, Result};
use crate::iterator::KvIter;
use crate::key::Comparator;
use crate::util::coding::{decode_fixed32, get_varint32, put_fixed32, put_varint32};

/// Builds the byte encoding of a single block.
///
/// Keys must be added in strictly increasing order under the comparator the
/// block will later be read with.
pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    counter: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    /// Creates a builder that restarts prefix compression every
    /// `restart_interval` entries.
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval >= 1);
        Self {
            restart_interval,
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends a key/value entry.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(self.counter <= self.restart_interval);

        let mut shared = 0;
        if self.counter < self.restart_interval {
            let min_len = self.last_key.len().min(key.len());
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }
        let unshared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, unshared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.put_slice(&key[shared..]);
        self.buffer.put_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        debug_assert_eq!(self.last_key, key);
        self.counter += 1;
    }

    /// Appends the restart trailer and returns the finished block bytes.
    ///
    /// The builder must be `reset` before reuse.
    pub fn finish(&mut self) -> Bytes {
        for &restart in &self.restarts {
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        Bytes::from(std::mem::take(&mut self.buffer))
    }

    /// Clears the builder for a new block.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
    }

    /// Bytes the finished block would occupy right now.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// Whether no entries have been added since the last reset.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// An immutable, decoded block. Cloning shares the underlying bytes.
#[derive(Debug, Clone)]
pub struct Block {
    data: Bytes,
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    /// Validates the trailer of `data` and wraps it.
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("block too small for restart count"));
        }
        let num_restarts = decode_fixed32(&data[data.len() - 4..]);
        if num_restarts == 0 {
            return Err(Error::corruption("block has no restart points"));
        }
        let trailer = 4 + num_restarts as usize * 4;
        let restart_offset = data
            .len()
            .checked_sub(trailer)
            .ok_or_else(|| Error::corruption("bad restart count in block"))?;
        Ok(Self { data, restart_offset, num_restarts })
    }

    /// Total encoded size of the block.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns an iterator over the block's entries, ordered by `cmp`.
    pub fn iter(&self, cmp: Arc<dyn Comparator>) -> BlockIter {
        BlockIter::new(self.clone(), cmp)
    }
}

/// Cursor over the entries of one block.
pub struct BlockIter {
    block: Block,
    cmp: Arc<dyn Comparator>,
    // Offset of the current entry, or `restart_offset` when invalid.
    current: usize,
    // Offset where the next entry starts.
    next_offset: usize,
    restart_index: u32,
    key: Vec<u8>,
    value_offset: usize,
    value_len: usize,
    status: Option<Error>,
}

impl BlockIter {
    fn new(block: Block, cmp: Arc<dyn Comparator>) -> Self {
        let restart_offset = block.restart_offset;
        Self {
            block,
            cmp,
            current: restart_offset,
            next_offset: restart_offset,
            restart_index: 0,
            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            status: None,
        }
    }

    fn restart_point(&self, index: u32) -> usize {
        debug_assert!(index < self.block.num_restarts);
        let offset = self.block.restart_offset + index as usize * 4;
        decode_fixed32(&self.block.data[offset..]) as usize
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        self.next_offset = self.restart_point(index);
        self.current = self.block.restart_offset;
    }

    fn corrupt(&mut self) {
        self.status = Some(Error::corruption("bad entry in block"));
        self.current = self.block.restart_offset;
        self.next_offset = self.block.restart_offset;
        self.key.clear();
        self.value_len = 0;
    }

    /// Decodes the entry at `next_offset`; returns false at block end or on
    /// corruption.
    fn parse_next_entry(&mut self) -> bool {
        if self.next_offset >= self.block.restart_offset {
            self.current = self.block.restart_offset;
            return false;
        }

        let entry_offset = self.next_offset;
        let mut cursor = &self.block.data[entry_offset..self.block.restart_offset];
        let header = (|| -> Result<(usize, usize, usize)> {
            let shared = get_varint32(&mut cursor)? as usize;
            let unshared = get_varint32(&mut cursor)? as usize;
            let value_len = get_varint32(&mut cursor)? as usize;
            Ok((shared, unshared, value_len))
        })();

        let (shared, unshared, value_len) = match header {
            Ok(h) => h,
            Err(_) => {
                self.corrupt();
                return false;
            }
        };
        if shared > self.key.len() || cursor.len() < unshared + value_len {
            self.corrupt();
            return false;
        }

        let header_len = self.block.restart_offset - entry_offset - cursor.len();
        let key_offset = entry_offset + header_len;
        self.key.truncate(shared);
        self.key.extend_from_slice(&self.block.data[key_offset..key_offset + unshared]);
        self.value_offset = key_offset + unshared;
        self.value_len = value_len;
        self.current = entry_offset;
        self.next_offset = self.value_offset + value_len;

        // Track which restart region we are in, for prev().
        while self.restart_index + 1 < self.block.num_restarts
            && self.restart_point(self.restart_index + 1) <= entry_offset
        {
            self.restart_index += 1;
        }
        true
    }

    /// Key at a restart point (stored uncompressed there).
    fn restart_key(&mut self, index: u32) -> Option<Vec<u8>> {
        let offset = self.restart_point(index);
        if offset >= self.block.restart_offset {
            return None;
        }
        let mut cursor = &self.block.data[offset..self.block.restart_offset];
        let shared = get_varint32(&mut cursor).ok()?;
        let unshared = get_varint32(&mut cursor).ok()? as usize;
        let _value_len = get_varint32(&mut cursor).ok()?;
        if shared != 0 || cursor.len() < unshared {
            return None;
        }
        Some(cursor[..unshared].to_vec())
    }
}

impl KvIter for BlockIter {
    fn valid(&self) -> bool {
        self.current < self.block.restart_offset
    }

    fn seek_to_first(&mut self) {
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        self.seek_to_restart_point(self.block.num_restarts - 1);
        while self.parse_next_entry() && self.next_offset < self.block.restart_offset {}
    }

    fn seek(&mut self, target: &[u8]) {
        // Binary search the restart array for the last restart point whose
        // key is < target, then scan forward.
        let mut left = 0u32;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            match self.restart_key(mid) {
                Some(key) => {
                    if self.cmp.compare(&key, target) == std::cmp::Ordering::Less {
                        left = mid;
                    } else {
                        right = mid - 1;
                    }
                }
                None => {
                    self.corrupt();
                    return;
                }
            }
        }

        self.seek_to_restart_point(left);
        while self.parse_next_entry() {
            if self.cmp.compare(&self.key, target) != std::cmp::Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_entry();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let original = self.current;

        if original == self.restart_point(0) {
            // Already at the first entry.
            self.current = self.block.restart_offset;
            self.next_offset = self.block.restart_offset;
            self.key.clear();
            return;
        }

        // Back up to the restart point strictly before the current entry,
        // then scan forward to the entry preceding it.
        while self.restart_point(self.restart_index) >= original {
            self.restart_index -= 1;
        }
        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_entry() && self.next_offset < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.block.data[self.value_offset..self.value_offset + self.value_len]
    }

    fn status(&self) -> Result<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::BytewiseComparator;

    fn build_block(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Block {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in entries {
            builder.add(key, value);
        }
        Block::new(builder.finish()).unwrap()
    }

    fn cmp() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }

    #[test]
    fn test_empty_block() {
        let block = build_block(&[], 16);
        let mut iter = block.iter(cmp());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
    }

    #[test]
    fn test_forward_scan() {
        let entries: Vec<(&[u8], &[u8])> =
            vec![(b"apple", b"red"), (b"banana", b"yellow"), (b"cherry", b"dark")];
        let block = build_block(&entries, 16);
        let mut iter = block.iter(cmp());

        iter.seek_to_first();
        for (key, value) in &entries {
            assert!(iter.valid());
            assert_eq!(iter.key(), *key);
            assert_eq!(iter.value(), *value);
            iter.next();
        }
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_prefix_compression_shrinks() {
        let mut plain = BlockBuilder::new(16);
        let mut entries = Vec::new();
        for i in 0..64 {
            entries.push((format!("sharedprefix{:04}", i).into_bytes(), b"v".to_vec()));
        }
        for (k, v) in &entries {
            plain.add(k, v);
        }
        let compressed_size = plain.finish().len();
        let raw_size: usize = entries.iter().map(|(k, v)| k.len() + v.len() + 3).sum();
        assert!(compressed_size < raw_size + 4 * 5 + 4);
    }

    #[test]
    fn test_seek_with_restarts() {
        let mut keys = Vec::new();
        for i in 0..100 {
            keys.push(format!("key{:04}", i).into_bytes());
        }
        let entries: Vec<(&[u8], &[u8])> =
            keys.iter().map(|k| (k.as_slice(), b"value" as &[u8])).collect();
        // Small interval so the binary search actually exercises restarts.
        let block = build_block(&entries, 4);
        let mut iter = block.iter(cmp());

        iter.seek(b"key0050");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key0050");

        // Between two keys: lands on the next one.
        iter.seek(b"key0050x");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key0051");

        // Before the first key.
        iter.seek(b"aaa");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key0000");

        // After the last key.
        iter.seek(b"zzz");
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek_to_last_and_prev() {
        let entries: Vec<(&[u8], &[u8])> =
            vec![(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4"), (b"e", b"5")];
        let block = build_block(&entries, 2);
        let mut iter = block.iter(cmp());

        iter.seek_to_last();
        let mut collected = Vec::new();
        while iter.valid() {
            collected.push(iter.key().to_vec());
            iter.prev();
        }
        let expected: Vec<Vec<u8>> = entries.iter().rev().map(|(k, _)| k.to_vec()).collect();
        assert_eq!(collected, expected);
    }

    #[test]
    fn test_builder_reuse_after_reset() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"a", b"1");
        let first = builder.finish();
        builder.reset();
        builder.add(b"a", b"1");
        let second = builder.finish();
        assert_eq!(first, second);
    }

    #[test]
    fn test_truncated_block_rejected() {
        assert!(Block::new(Bytes::from_static(&[0, 0])).is_err());

        // A restart count pointing past the data.
        let mut data = Vec::new();
        put_fixed32(&mut data, 1000);
        assert!(Block::new(Bytes::from(data)).is_err());
    }

    #[test]
    fn test_corrupt_entry_sets_status() {
        // One valid entry, then garbage where the trailer claims data.
        let mut data = Vec::new();
        data.extend_from_slice(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
        put_fixed32(&mut data, 0);
        put_fixed32(&mut data, 1);
        let block = Block::new(Bytes::from(data)).unwrap();
        let mut iter = block.iter(cmp());
        iter.seek_to_first();
        assert!(!iter.valid());
        assert!(iter.status().is_err());
    }
}
