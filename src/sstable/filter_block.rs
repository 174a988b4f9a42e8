//! Filter blocks: per-table storage for the filter policy's output.
//!
//! One filter is generated for every 2 KiB window of data-block offsets, so
//! a reader can map a data block's offset straight to the filter covering it.
//!
//! ```text
//! [filter 0] ... [filter n-1]
//! [offset of filter 0: fixed32] ... [offset of filter n-1: fixed32]
//! [offset of offset array: fixed32]
//! [base_lg: u8]
//! ```

use std::sync::Arc;

use bytes::Bytes;

use crate::filter::FilterPolicy;
use crate::util::coding::{decode_fixed32, put_fixed32};

/// log2 of the data-offset range covered by one filter.
pub const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Accumulates keys per data-block window and emits the filter block.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    // Keys added since the last generated filter, flattened.
    keys: Vec<u8>,
    starts: Vec<usize>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    /// Creates a builder using `policy`.
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: Vec::new(),
            starts: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Tells the builder a data block begins at `block_offset`; generates
    /// filters for every window boundary passed since the previous block.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = (block_offset / FILTER_BASE) as usize;
        debug_assert!(filter_index >= self.filter_offsets.len());
        while filter_index > self.filter_offsets.len() {
            self.generate_filter();
        }
    }

    /// Records `key` as belonging to the current data block.
    pub fn add_key(&mut self, key: &[u8]) {
        self.starts.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    /// Emits the remaining filter plus the offset array and trailer.
    pub fn finish(mut self) -> Bytes {
        if !self.starts.is_empty() {
            self.generate_filter();
        }

        let array_offset = self.result.len() as u32;
        let mut result = self.result;
        for &offset in &self.filter_offsets {
            put_fixed32(&mut result, offset);
        }
        put_fixed32(&mut result, array_offset);
        result.push(FILTER_BASE_LG);
        Bytes::from(result)
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.starts.is_empty() {
            // No keys in this window: an empty filter.
            return;
        }

        self.starts.push(self.keys.len()); // sentinel
        let key_slices: Vec<&[u8]> = self
            .starts
            .windows(2)
            .map(|w| &self.keys[w[0]..w[1]])
            .collect();
        let filter = self.policy.create_filter(&key_slices);
        self.result.extend_from_slice(&filter);

        self.keys.clear();
        self.starts.clear();
    }
}

/// Probes a stored filter block.
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Bytes,
    // Offset of the offset array within `data`.
    array_offset: usize,
    num_filters: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// Wraps `contents`; a malformed block yields a reader that matches
    /// everything (filters are advisory).
    pub fn new(policy: Arc<dyn FilterPolicy>, contents: Bytes) -> Self {
        let mut reader =
            Self { policy, data: contents, array_offset: 0, num_filters: 0, base_lg: 0 };
        let n = reader.data.len();
        if n < 5 {
            return reader;
        }
        reader.base_lg = reader.data[n - 1];
        let array_offset = decode_fixed32(&reader.data[n - 5..]) as usize;
        if array_offset > n - 5 {
            return reader;
        }
        reader.array_offset = array_offset;
        reader.num_filters = (n - 5 - array_offset) / 4;
        reader
    }

    /// Whether `key` may be present in the data block at `block_offset`.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            // Out of range: treat as a potential match.
            return true;
        }
        let start =
            decode_fixed32(&self.data[self.array_offset + index * 4..]) as usize;
        let limit = if index + 1 < self.num_filters {
            decode_fixed32(&self.data[self.array_offset + (index + 1) * 4..]) as usize
        } else {
            self.array_offset
        };
        if start > limit || limit > self.array_offset {
            // Corrupt offsets: do not rule the key out.
            return true;
        }
        if start == limit {
            // Empty filter covers no keys.
            return false;
        }
        self.policy.key_may_match(key, &self.data[start..limit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::BloomFilterPolicy;

    fn policy() -> Arc<dyn FilterPolicy> {
        Arc::new(BloomFilterPolicy::new(10))
    }

    #[test]
    fn test_empty_builder() {
        let builder = FilterBlockBuilder::new(policy());
        let block = builder.finish();
        // Offset array position + base_lg only.
        assert_eq!(block.len(), 5);
        let reader = FilterBlockReader::new(policy(), block);
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(100000, b"foo"));
    }

    #[test]
    fn test_single_window() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(100);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        builder.add_key(b"box");
        let block = builder.finish();

        let reader = FilterBlockReader::new(policy(), block);
        assert!(reader.key_may_match(100, b"foo"));
        assert!(reader.key_may_match(100, b"bar"));
        assert!(reader.key_may_match(100, b"box"));
        assert!(!reader.key_may_match(100, b"missing"));
        assert!(!reader.key_may_match(100, b"other"));
    }

    #[test]
    fn test_multiple_windows() {
        let mut builder = FilterBlockBuilder::new(policy());

        // First window [0, 2048).
        builder.start_block(0);
        builder.add_key(b"foo");
        builder.start_block(2000);
        builder.add_key(b"bar");

        // Second window [2048, 4096).
        builder.start_block(3100);
        builder.add_key(b"box");

        // Fourth window (third stays empty).
        builder.start_block(9000);
        builder.add_key(b"hello");

        let block = builder.finish();
        let reader = FilterBlockReader::new(policy(), block);

        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(2000, b"bar"));
        assert!(!reader.key_may_match(0, b"box"));

        assert!(reader.key_may_match(3100, b"box"));
        assert!(!reader.key_may_match(3100, b"foo"));

        // Empty window matches nothing.
        assert!(!reader.key_may_match(4100, b"foo"));
        assert!(!reader.key_may_match(6100, b"box"));

        assert!(reader.key_may_match(9000, b"hello"));
        assert!(!reader.key_may_match(9000, b"foo"));
    }
}
