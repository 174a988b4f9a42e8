//! Atomic groups of write operations.
//!
//! A batch owns its serialised representation, which is exactly what the WAL
//! stores:
//!
//! ```text
//! sequence: fixed64   count: fixed32   record*
//! record := Value    key(varint-prefixed) value(varint-prefixed)
//!         | Deletion key(varint-prefixed)
//! ```

use crate::error::{Error, Result};
use crate::key::{SequenceNumber, ValueType};
use crate::memtable::MemTable;
use crate::util::coding::{
    decode_fixed32, decode_fixed64, get_length_prefixed_slice, put_fixed32, put_fixed64,
    put_length_prefixed_slice,
};

// 8-byte sequence followed by 4-byte count.
const HEADER: usize = 12;

/// Receives the decoded operations of a batch, in order.
pub trait BatchHandler {
    /// Called for each put record.
    fn put(&mut self, key: &[u8], value: &[u8]);
    /// Called for each delete record.
    fn delete(&mut self, key: &[u8]);
}

/// An ordered group of put/delete operations applied atomically.
///
/// # Example
///
/// ```rust,no_run
/// use siltdb::{WriteBatch, WriteOptions, DB, Options};
///
/// # fn main() -> Result<(), siltdb::Error> {
/// let db = DB::open("./data", Options::new().create_if_missing(true))?;
/// let mut batch = WriteBatch::new();
/// batch.put(b"key1", b"value1");
/// batch.delete(b"key2");
/// db.write(&WriteOptions::default(), batch)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self { rep: vec![0; HEADER] }
    }

    /// Reconstitutes a batch from its serialised form (e.g. a WAL record).
    pub fn from_contents(rep: Vec<u8>) -> Result<Self> {
        if rep.len() < HEADER {
            return Err(Error::corruption("malformed write batch (too small)"));
        }
        Ok(Self { rep })
    }

    /// Queues an insertion of `key` -> `value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    /// Queues a deletion of `key`.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        put_length_prefixed_slice(&mut self.rep, key);
    }

    /// Drops all queued operations.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER, 0);
    }

    /// Number of operations queued.
    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..])
    }

    pub(crate) fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    /// The sequence number stamped onto the batch at commit.
    pub(crate) fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep)
    }

    pub(crate) fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.rep[..8].copy_from_slice(&sequence.to_le_bytes());
    }

    /// Whether no operations are queued.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Size of the serialised representation in bytes.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// The serialised representation.
    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Appends all of `other`'s operations to this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[HEADER..]);
    }

    /// Decodes the batch, feeding each operation to `handler`.
    pub fn iterate<H: BatchHandler>(&self, handler: &mut H) -> Result<()> {
        let mut input = &self.rep[..];
        if input.len() < HEADER {
            return Err(Error::corruption("malformed write batch (too small)"));
        }
        input = &input[HEADER..];

        let mut found = 0u32;
        while !input.is_empty() {
            let tag = input[0];
            input = &input[1..];
            match ValueType::from_u8(tag) {
                Some(ValueType::Value) => {
                    let key = get_length_prefixed_slice(&mut input)
                        .map_err(|_| Error::corruption("bad put record in write batch"))?;
                    let value = get_length_prefixed_slice(&mut input)
                        .map_err(|_| Error::corruption("bad put record in write batch"))?;
                    handler.put(key, value);
                }
                Some(ValueType::Deletion) => {
                    let key = get_length_prefixed_slice(&mut input)
                        .map_err(|_| Error::corruption("bad delete record in write batch"))?;
                    handler.delete(key);
                }
                None => return Err(Error::corruption("unknown write batch record tag")),
            }
            found += 1;
        }

        if found != self.count() {
            return Err(Error::corruption("write batch count mismatch"));
        }
        Ok(())
    }

    /// Replays the batch into `mem`, assigning `sequence, sequence+1, ...`
    /// to the records in order.
    pub(crate) fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut inserter = MemTableInserter { sequence: self.sequence(), mem };
        self.iterate(&mut inserter)
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

struct MemTableInserter<'a> {
    sequence: SequenceNumber,
    mem: &'a MemTable,
}

impl BatchHandler for MemTableInserter<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.mem.add(self.sequence, ValueType::Value, key, value);
        self.sequence += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.mem.add(self.sequence, ValueType::Deletion, key, b"");
        self.sequence += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::LookupKey;
    use crate::memtable::LookupResult;
    use bytes::Bytes;

    #[derive(Default)]
    struct Recorder {
        ops: Vec<String>,
    }

    impl BatchHandler for Recorder {
        fn put(&mut self, key: &[u8], value: &[u8]) {
            self.ops.push(format!(
                "put({},{})",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value)
            ));
        }
        fn delete(&mut self, key: &[u8]) {
            self.ops.push(format!("del({})", String::from_utf8_lossy(key)));
        }
    }

    #[test]
    fn test_empty_batch() {
        let batch = WriteBatch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.approximate_size(), 12);
    }

    #[test]
    fn test_put_delete_iterate() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.put(b"c", b"3");
        assert_eq!(batch.count(), 3);

        let mut recorder = Recorder::default();
        batch.iterate(&mut recorder).unwrap();
        assert_eq!(recorder.ops, vec!["put(a,1)", "del(b)", "put(c,3)"]);
    }

    #[test]
    fn test_clear() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.approximate_size(), 12);
    }

    #[test]
    fn test_roundtrip_through_contents() {
        let mut batch = WriteBatch::new();
        batch.set_sequence(1234);
        batch.put(b"key", b"value");
        batch.delete(b"gone");

        let restored = WriteBatch::from_contents(batch.contents().to_vec()).unwrap();
        assert_eq!(restored.sequence(), 1234);
        assert_eq!(restored.count(), 2);

        let mut recorder = Recorder::default();
        restored.iterate(&mut recorder).unwrap();
        assert_eq!(recorder.ops, vec!["put(key,value)", "del(gone)"]);
    }

    #[test]
    fn test_append_sums_counts() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        let mut other = WriteBatch::new();
        other.put(b"b", b"2");
        other.delete(b"c");

        batch.append(&other);
        assert_eq!(batch.count(), 3);

        let mut recorder = Recorder::default();
        batch.iterate(&mut recorder).unwrap();
        assert_eq!(recorder.ops, vec!["put(a,1)", "put(b,2)", "del(c)"]);
    }

    #[test]
    fn test_insert_into_memtable_assigns_sequences() {
        let mut batch = WriteBatch::new();
        batch.set_sequence(100);
        batch.put(b"a", b"va");
        batch.put(b"b", b"vb");
        batch.delete(b"a");

        let mem = MemTable::new();
        batch.insert_into(&mem).unwrap();

        // a was put at 100 and deleted at 102.
        assert_eq!(mem.get(&LookupKey::new(b"a", 200)), LookupResult::Deleted);
        assert_eq!(
            mem.get(&LookupKey::new(b"a", 101)),
            LookupResult::Found(Bytes::from_static(b"va"))
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"b", 200)),
            LookupResult::Found(Bytes::from_static(b"vb"))
        );
    }

    #[test]
    fn test_malformed_batch_rejected() {
        assert!(WriteBatch::from_contents(vec![0; 5]).is_err());

        // Truncated record payload.
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value");
        let mut rep = batch.contents().to_vec();
        rep.truncate(rep.len() - 3);
        let broken = WriteBatch::from_contents(rep).unwrap();
        let mut recorder = Recorder::default();
        assert!(broken.iterate(&mut recorder).is_err());

        // Count disagrees with the records present.
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value");
        batch.set_count(7);
        let mut recorder = Recorder::default();
        assert!(batch.iterate(&mut recorder).is_err());
    }
}
