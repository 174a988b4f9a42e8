//! Write-ahead log format shared by the data logs and the manifest.
//!
//! A log file is a sequence of 32 KiB blocks. Each physical record is:
//!
//! ```text
//! masked_crc32c: u32le   length: u16le   type: u8   payload[length]
//! ```
//!
//! A logical record larger than the space left in a block is split into
//! FIRST/MIDDLE/LAST fragments. A block tail of fewer than 7 bytes can never
//! hold a header and is zero-filled.

mod reader;
mod writer;

pub use reader::{CorruptionReporter, LogReader};
pub use writer::LogWriter;

/// Size of one physical log block.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Header bytes per physical record: checksum + length + type.
pub const HEADER_SIZE: usize = 4 + 2 + 1;

/// Physical record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Reserved for zero-filled regions of preallocated files.
    Zero = 0,
    /// A logical record contained entirely in one fragment.
    Full = 1,
    /// First fragment of a split record.
    First = 2,
    /// Interior fragment of a split record.
    Middle = 3,
    /// Final fragment of a split record.
    Last = 4,
}

impl RecordType {
    /// Converts a stored type byte, rejecting unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}
