//! Version edits: the deltas recorded in the manifest.
//!
//! Fields are encoded as `varint32 tag` + payload, so decoders skip nothing
//! and unknown tags are flagged, while absent fields cost no bytes.

use std::collections::BTreeSet;

use crate::config::NUM_LEVELS;
use crate::error::{Error, Result};
use crate::key::{InternalKey, SequenceNumber};
use crate::util::coding::{
    get_length_prefixed_slice, get_varint32, get_varint64, put_length_prefixed_slice, put_varint32,
    put_varint64,
};

// Field tags. Tag 8 was used by a retired field and is never reused.
const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_PREV_LOG_NUMBER: u32 = 9;

/// Metadata for a table file being added to a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileEntry {
    /// File number of the table.
    pub number: u64,
    /// File size in bytes.
    pub file_size: u64,
    /// Smallest internal key stored in the table.
    pub smallest: InternalKey,
    /// Largest internal key stored in the table.
    pub largest: InternalKey,
}

/// A delta over the current version, applied atomically via the manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    pub(crate) comparator_name: Option<String>,
    pub(crate) log_number: Option<u64>,
    pub(crate) prev_log_number: Option<u64>,
    pub(crate) next_file_number: Option<u64>,
    pub(crate) last_sequence: Option<SequenceNumber>,
    pub(crate) compact_pointers: Vec<(usize, InternalKey)>,
    pub(crate) deleted_files: BTreeSet<(usize, u64)>,
    pub(crate) new_files: Vec<(usize, NewFileEntry)>,
}

impl VersionEdit {
    /// Creates an empty edit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the comparator name; written once at database creation.
    pub fn set_comparator_name(&mut self, name: impl Into<String>) {
        self.comparator_name = Some(name.into());
    }

    /// Sets the oldest WAL whose contents are not yet in a table.
    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    /// Sets the legacy predecessor log number (kept for old databases).
    pub fn set_prev_log_number(&mut self, number: u64) {
        self.prev_log_number = Some(number);
    }

    /// Sets the next file number to allocate from.
    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    /// Sets the largest sequence number used so far.
    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        self.last_sequence = Some(sequence);
    }

    /// Advances the round-robin compaction pointer for `level`.
    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// Adds a table file to `level`.
    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push((level, NewFileEntry { number, file_size, smallest, largest }));
    }

    /// Removes a table file from `level`.
    pub fn remove_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    /// Serialises the edit for the manifest.
    pub fn encode(&self) -> Vec<u8> {
        let mut dst = Vec::new();

        if let Some(name) = &self.comparator_name {
            put_varint32(&mut dst, TAG_COMPARATOR);
            put_length_prefixed_slice(&mut dst, name.as_bytes());
        }
        if let Some(number) = self.log_number {
            put_varint32(&mut dst, TAG_LOG_NUMBER);
            put_varint64(&mut dst, number);
        }
        if let Some(number) = self.prev_log_number {
            put_varint32(&mut dst, TAG_PREV_LOG_NUMBER);
            put_varint64(&mut dst, number);
        }
        if let Some(number) = self.next_file_number {
            put_varint32(&mut dst, TAG_NEXT_FILE_NUMBER);
            put_varint64(&mut dst, number);
        }
        if let Some(sequence) = self.last_sequence {
            put_varint32(&mut dst, TAG_LAST_SEQUENCE);
            put_varint64(&mut dst, sequence);
        }

        for (level, key) in &self.compact_pointers {
            put_varint32(&mut dst, TAG_COMPACT_POINTER);
            put_varint32(&mut dst, *level as u32);
            put_length_prefixed_slice(&mut dst, key.encoded());
        }
        for (level, number) in &self.deleted_files {
            put_varint32(&mut dst, TAG_DELETED_FILE);
            put_varint32(&mut dst, *level as u32);
            put_varint64(&mut dst, *number);
        }
        for (level, file) in &self.new_files {
            put_varint32(&mut dst, TAG_NEW_FILE);
            put_varint32(&mut dst, *level as u32);
            put_varint64(&mut dst, file.number);
            put_varint64(&mut dst, file.file_size);
            put_length_prefixed_slice(&mut dst, file.smallest.encoded());
            put_length_prefixed_slice(&mut dst, file.largest.encoded());
        }
        dst
    }

    /// Parses an edit back out of its manifest record.
    pub fn decode(mut src: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::new();
        let input = &mut src;

        while !input.is_empty() {
            let tag = get_varint32(input)?;
            match tag {
                TAG_COMPARATOR => {
                    let name = get_length_prefixed_slice(input)?;
                    let name = std::str::from_utf8(name)
                        .map_err(|_| Error::corruption("comparator name is not utf-8"))?;
                    edit.comparator_name = Some(name.to_string());
                }
                TAG_LOG_NUMBER => edit.log_number = Some(get_varint64(input)?),
                TAG_PREV_LOG_NUMBER => edit.prev_log_number = Some(get_varint64(input)?),
                TAG_NEXT_FILE_NUMBER => edit.next_file_number = Some(get_varint64(input)?),
                TAG_LAST_SEQUENCE => edit.last_sequence = Some(get_varint64(input)?),
                TAG_COMPACT_POINTER => {
                    let level = decode_level(input)?;
                    let key = InternalKey::decode(get_length_prefixed_slice(input)?)?;
                    edit.compact_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let level = decode_level(input)?;
                    let number = get_varint64(input)?;
                    edit.deleted_files.insert((level, number));
                }
                TAG_NEW_FILE => {
                    let level = decode_level(input)?;
                    let number = get_varint64(input)?;
                    let file_size = get_varint64(input)?;
                    let smallest = InternalKey::decode(get_length_prefixed_slice(input)?)?;
                    let largest = InternalKey::decode(get_length_prefixed_slice(input)?)?;
                    edit.new_files
                        .push((level, NewFileEntry { number, file_size, smallest, largest }));
                }
                _ => {
                    return Err(Error::corruption(format!("unknown version edit tag {}", tag)));
                }
            }
        }
        Ok(edit)
    }
}

fn decode_level(input: &mut &[u8]) -> Result<usize> {
    let level = get_varint32(input)? as usize;
    if level >= NUM_LEVELS {
        return Err(Error::corruption(format!("level {} out of range", level)));
    }
    Ok(level)
}
