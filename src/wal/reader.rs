//! Log reader: reassembles logical records, skipping damaged ones whole.

use std::fs::File;
use std::io::Read;

use crate::util::coding::decode_fixed32;
use crate::util::crc;
use crate::wal::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Receives corruption notices: how many bytes were dropped and why.
///
/// Recovery installs a reporter that logs the damage and, under paranoid
/// checks, converts it into a hard error.
pub type CorruptionReporter<'a> = Box<dyn FnMut(usize, &str) + 'a>;

enum Physical {
    Record(RecordType, Vec<u8>),
    // A fragment that failed validation; reassembly must reset.
    Bad,
    Eof,
}

/// Reads logical records back from a log file.
pub struct LogReader<'a> {
    file: File,
    reporter: Option<CorruptionReporter<'a>>,
    verify_checksums: bool,
    // Unconsumed part of the current block.
    buffer: Vec<u8>,
    buffer_pos: usize,
    // The last block has been read from the file.
    eof: bool,
}

impl<'a> LogReader<'a> {
    /// Creates a reader over `file`. With `verify_checksums`, fragments with
    /// bad CRCs are dropped and reported.
    pub fn new(file: File, verify_checksums: bool, reporter: Option<CorruptionReporter<'a>>) -> Self {
        Self {
            file,
            reporter,
            verify_checksums,
            buffer: Vec::with_capacity(BLOCK_SIZE),
            buffer_pos: 0,
            eof: false,
        }
    }

    /// Returns the next intact logical record, or `None` at end of log.
    ///
    /// Damaged records are skipped whole: any failed fragment resets the
    /// FIRST/MIDDLE/LAST reassembly, so no partial record is ever returned.
    pub fn read_record(&mut self) -> Option<Vec<u8>> {
        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;

        loop {
            match self.read_physical_record() {
                Physical::Record(record_type, payload) => match record_type {
                    RecordType::Full => {
                        if in_fragmented_record {
                            self.report(scratch.len(), "partial record without end");
                        }
                        return Some(payload);
                    }
                    RecordType::First => {
                        if in_fragmented_record {
                            self.report(scratch.len(), "partial record without end");
                        }
                        scratch = payload;
                        in_fragmented_record = true;
                    }
                    RecordType::Middle => {
                        if !in_fragmented_record {
                            self.report(payload.len(), "missing start of fragmented record");
                        } else {
                            scratch.extend_from_slice(&payload);
                        }
                    }
                    RecordType::Last => {
                        if !in_fragmented_record {
                            self.report(payload.len(), "missing start of fragmented record");
                        } else {
                            scratch.extend_from_slice(&payload);
                            return Some(scratch);
                        }
                    }
                    RecordType::Zero => {
                        // Zero-filled padding; not part of any record.
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                },
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report(scratch.len(), "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
                Physical::Eof => {
                    // A partial record at EOF is a torn tail left by a
                    // crashed writer; it is dropped without a report.
                    return None;
                }
            }
        }
    }

    fn report(&mut self, bytes: usize, reason: &str) {
        if let Some(reporter) = self.reporter.as_mut() {
            reporter(bytes, reason);
        }
    }

    fn remaining(&self) -> usize {
        self.buffer.len() - self.buffer_pos
    }

    fn read_physical_record(&mut self) -> Physical {
        loop {
            if self.remaining() < HEADER_SIZE {
                if !self.eof {
                    // Skip the zero-padded block trailer and read on.
                    if !self.read_next_block() {
                        return Physical::Eof;
                    }
                    continue;
                }
                // A truncated header at EOF means the writer died mid-write.
                return Physical::Eof;
            }

            let header = &self.buffer[self.buffer_pos..];
            let stored_crc = decode_fixed32(&header[..4]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let type_byte = header[6];

            if HEADER_SIZE + length > self.remaining() {
                let dropped = self.remaining();
                self.buffer_pos = self.buffer.len();
                if !self.eof {
                    self.report(dropped, "bad record length");
                    return Physical::Bad;
                }
                // Torn tail: the writer may have crashed mid-record.
                return Physical::Eof;
            }

            let record_type = match RecordType::from_u8(type_byte) {
                Some(t) => t,
                None => {
                    let dropped = self.remaining();
                    self.buffer_pos = self.buffer.len();
                    self.report(dropped, "unknown record type");
                    return Physical::Bad;
                }
            };

            if record_type == RecordType::Zero && length == 0 {
                // Padding produced by preallocation; skip the block rest.
                self.buffer_pos = self.buffer.len();
                return Physical::Bad;
            }

            let payload_start = self.buffer_pos + HEADER_SIZE;
            let payload = self.buffer[payload_start..payload_start + length].to_vec();

            if self.verify_checksums {
                let actual = crc::value_of_parts(&[&[type_byte], &payload]);
                if crc::unmask(stored_crc) != actual {
                    // Drop the whole rest of the block: the length field
                    // itself may be corrupt.
                    let dropped = self.remaining();
                    self.buffer_pos = self.buffer.len();
                    self.report(dropped, "checksum mismatch");
                    return Physical::Bad;
                }
            }

            self.buffer_pos += HEADER_SIZE + length;
            return Physical::Record(record_type, payload);
        }
    }

    /// Reads the next 32 KiB block (or the shorter final one). Returns false
    /// at end of file.
    fn read_next_block(&mut self) -> bool {
        self.buffer.clear();
        self.buffer.resize(BLOCK_SIZE, 0);
        self.buffer_pos = 0;

        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match self.file.read(&mut self.buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) => {
                    self.report(BLOCK_SIZE, &format!("log read error: {}", err));
                    self.eof = true;
                    self.buffer.clear();
                    return false;
                }
            }
        }
        self.buffer.truncate(filled);
        if filled < BLOCK_SIZE {
            self.eof = true;
        }
        filled > 0
    }
}
