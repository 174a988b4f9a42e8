//! Log writer: fragments logical records into 32 KiB blocks.

use std::fs::File;
use std::io::{BufWriter, Write};

use crate::error::Result;
use crate::util::crc;
use crate::wal::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Appends framed records to a log file.
pub struct LogWriter {
    writer: BufWriter<File>,
    // Write position within the current block.
    block_offset: usize,
}

impl LogWriter {
    /// Wraps a fresh log file.
    pub fn new(file: File) -> Self {
        Self { writer: BufWriter::new(file), block_offset: 0 }
    }

    /// Wraps a log file that already holds `initial_length` bytes, resuming
    /// mid-block.
    pub fn with_initial_length(file: File, initial_length: u64) -> Self {
        Self { writer: BufWriter::new(file), block_offset: (initial_length as usize) % BLOCK_SIZE }
    }

    /// Appends one logical record, splitting it across blocks as needed.
    pub fn add_record(&mut self, data: &[u8]) -> Result<()> {
        let mut left = data;
        let mut begin = true;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Too small for a header: pad out the block.
                if leftover > 0 {
                    const ZEROS: [u8; HEADER_SIZE - 1] = [0; HEADER_SIZE - 1];
                    self.writer.write_all(&ZEROS[..leftover])?;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = left.len().min(available);
            let end = fragment_length == left.len();

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };
            self.emit_physical_record(record_type, &left[..fragment_length])?;

            left = &left[fragment_length..];
            begin = false;
            if left.is_empty() {
                break;
            }
        }

        // Keep records in the OS page cache even when the caller does not
        // fsync; durability is still governed by sync().
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs the log file.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn emit_physical_record(&mut self, record_type: RecordType, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        let type_byte = [record_type as u8];
        let checksum = crc::mask(crc::value_of_parts(&[&type_byte, payload]));

        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&checksum.to_le_bytes());
        header[4..6].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        header[6] = record_type as u8;

        self.writer.write_all(&header)?;
        self.writer.write_all(payload)?;
        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_writer(dir: &TempDir) -> (LogWriter, std::path::PathBuf) {
        let path = dir.path().join("000003.log");
        let file = File::create(&path).unwrap();
        (LogWriter::new(file), path)
    }

    #[test]
    fn test_small_record_layout() {
        let dir = TempDir::new().unwrap();
        let (mut writer, path) = new_writer(&dir);
        writer.add_record(b"hello").unwrap();
        writer.sync().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), HEADER_SIZE + 5);
        assert_eq!(u16::from_le_bytes([data[4], data[5]]), 5);
        assert_eq!(data[6], RecordType::Full as u8);
        assert_eq!(&data[7..], b"hello");
    }

    #[test]
    fn test_record_spans_blocks() {
        let dir = TempDir::new().unwrap();
        let (mut writer, path) = new_writer(&dir);

        let big = vec![0xabu8; BLOCK_SIZE + 1000];
        writer.add_record(&big).unwrap();
        writer.sync().unwrap();

        let data = std::fs::read(&path).unwrap();
        // First fragment fills the first block exactly.
        assert_eq!(data[6], RecordType::First as u8);
        let first_len = u16::from_le_bytes([data[4], data[5]]) as usize;
        assert_eq!(first_len, BLOCK_SIZE - HEADER_SIZE);
        // Second fragment begins at the block boundary.
        assert_eq!(data[BLOCK_SIZE + 6], RecordType::Last as u8);
    }

    #[test]
    fn test_block_trailer_padding() {
        let dir = TempDir::new().unwrap();
        let (mut writer, path) = new_writer(&dir);

        // Leave fewer than HEADER_SIZE bytes at the block tail.
        let first = vec![1u8; BLOCK_SIZE - HEADER_SIZE - 3];
        writer.add_record(&first).unwrap();
        writer.add_record(b"second").unwrap();
        writer.sync().unwrap();

        let data = std::fs::read(&path).unwrap();
        // The 3-byte tail was zero-filled and the second record starts a new
        // block.
        assert_eq!(&data[BLOCK_SIZE - 3..BLOCK_SIZE], &[0, 0, 0]);
        assert_eq!(data[BLOCK_SIZE + 6], RecordType::Full as u8);
    }

    #[test]
    fn test_empty_record_emitted() {
        let dir = TempDir::new().unwrap();
        let (mut writer, path) = new_writer(&dir);
        writer.add_record(b"").unwrap();
        writer.sync().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), HEADER_SIZE);
        assert_eq!(data[6], RecordType::Full as u8);
    }
}
