//! Table footer and block handles.
//!
//! A `BlockHandle` is a varint-encoded `(offset, size)` pointer to a stored
//! block. The footer is the fixed 48-byte trailer of every table file:
//!
//! ```text
//! meta_index_handle  index_handle  padding..40  magic: fixed64
//! ```

use crate::error::{Error, Result};
use crate::sstable::{FOOTER_SIZE, TABLE_MAGIC};
use crate::util::coding::{decode_fixed64, get_varint64, put_fixed64, put_varint64};

/// Pointer to the extent of a block within the table file.
///
/// `size` counts the payload only, excluding the 5-byte block trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    /// Offset of the block in the file.
    pub offset: u64,
    /// Payload size of the block in bytes.
    pub size: u64,
}

impl BlockHandle {
    /// Maximum encoded length: two 10-byte varints.
    pub const MAX_ENCODED_LENGTH: usize = 20;

    /// Creates a handle.
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Appends the varint encoding to `dst`.
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    /// The varint encoding as a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::MAX_ENCODED_LENGTH);
        self.encode_to(&mut buf);
        buf
    }

    /// Decodes a handle, advancing the cursor.
    pub fn decode_from(src: &mut &[u8]) -> Result<Self> {
        let offset = get_varint64(src).map_err(|_| Error::corruption("bad block handle"))?;
        let size = get_varint64(src).map_err(|_| Error::corruption("bad block handle"))?;
        Ok(Self { offset, size })
    }
}

/// The fixed-size table trailer locating the meta-index and index blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// Handle of the meta-index block.
    pub meta_index_handle: BlockHandle,
    /// Handle of the index block.
    pub index_handle: BlockHandle,
}

impl Footer {
    /// Creates a footer.
    pub fn new(meta_index_handle: BlockHandle, index_handle: BlockHandle) -> Self {
        Self { meta_index_handle, index_handle }
    }

    /// Encodes the footer into exactly [`FOOTER_SIZE`] bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.meta_index_handle.encode_to(&mut buf);
        self.index_handle.encode_to(&mut buf);
        buf.resize(FOOTER_SIZE - 8, 0);
        put_fixed64(&mut buf, TABLE_MAGIC);
        debug_assert_eq!(buf.len(), FOOTER_SIZE);
        buf
    }

    /// Decodes and validates a footer.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FOOTER_SIZE {
            return Err(Error::corruption("footer too short"));
        }
        let magic = decode_fixed64(&data[FOOTER_SIZE - 8..]);
        if magic != TABLE_MAGIC {
            return Err(Error::corruption("not a table file (bad magic number)"));
        }
        let mut cursor = &data[..FOOTER_SIZE - 8];
        let meta_index_handle = BlockHandle::decode_from(&mut cursor)?;
        let index_handle = BlockHandle::decode_from(&mut cursor)?;
        Ok(Self { meta_index_handle, index_handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_roundtrip() {
        for (offset, size) in [(0, 0), (1, 127), (12345, 67890), (u64::MAX / 2, u64::MAX / 3)] {
            let handle = BlockHandle::new(offset, size);
            let encoded = handle.encode();
            let mut cursor = encoded.as_slice();
            let decoded = BlockHandle::decode_from(&mut cursor).unwrap();
            assert_eq!(decoded, handle);
            assert!(cursor.is_empty());
        }
    }

    #[test]
    fn test_handle_max_length() {
        let handle = BlockHandle::new(u64::MAX, u64::MAX);
        assert_eq!(handle.encode().len(), BlockHandle::MAX_ENCODED_LENGTH);
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer::new(BlockHandle::new(4096, 512), BlockHandle::new(8192, 1024));
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);
        assert_eq!(Footer::decode(&encoded).unwrap(), footer);
    }

    #[test]
    fn test_footer_bad_magic() {
        let footer = Footer::new(BlockHandle::new(0, 0), BlockHandle::new(0, 0));
        let mut encoded = footer.encode();
        encoded[FOOTER_SIZE - 1] ^= 0xff;
        let err = Footer::decode(&encoded).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_footer_too_short() {
        assert!(Footer::decode(&[0u8; 10]).is_err());
    }
}
