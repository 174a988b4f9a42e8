//! # MemTable
//!
//! The in-memory sorted buffer receiving writes before they are flushed to a
//! level-0 table. Built on a lock-free skiplist so readers never block the
//! single serialised writer.
//!
//! Entries are keyed by [`InternalKey`], so multiple versions of one user
//! key coexist and the newest sorts first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::map::Entry;
use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::iterator::KvIter;
use crate::key::{InternalKey, LookupKey, SequenceNumber, ValueType};

/// Outcome of a memtable probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// The key has a live value at the lookup sequence.
    Found(Bytes),
    /// The newest visible entry is a tombstone.
    Deleted,
    /// The memtable holds no entry for the key.
    Missing,
}

/// Concurrent-read, single-writer sorted table of internal keys.
pub struct MemTable {
    table: Arc<SkipMap<InternalKey, Bytes>>,
    approximate_size: AtomicUsize,
}

impl MemTable {
    /// Creates an empty memtable.
    pub fn new() -> Self {
        Self { table: Arc::new(SkipMap::new()), approximate_size: AtomicUsize::new(0) }
    }

    /// Inserts an entry. Never fails short of memory exhaustion.
    pub fn add(
        &self,
        sequence: SequenceNumber,
        value_type: ValueType,
        user_key: &[u8],
        value: &[u8],
    ) {
        let key = InternalKey::new(user_key, sequence, value_type);
        // Key bytes + value bytes + per-node bookkeeping.
        let charge = key.encoded().len() + value.len() + 16;
        self.table.insert(key, Bytes::copy_from_slice(value));
        self.approximate_size.fetch_add(charge, Ordering::Relaxed);
    }

    /// Probes for the newest entry visible at the lookup key's sequence.
    pub fn get(&self, lookup: &LookupKey) -> LookupResult {
        // The lookup key carries the seek tag, so the first entry at or
        // after it with the same user key is the newest visible version.
        let start = match InternalKey::decode(lookup.internal_key()) {
            Ok(key) => key,
            Err(_) => return LookupResult::Missing,
        };
        if let Some(entry) = self.table.lower_bound(std::ops::Bound::Included(&start)) {
            if entry.key().user_key() == lookup.user_key() {
                return match entry.key().value_type() {
                    ValueType::Value => LookupResult::Found(entry.value().clone()),
                    ValueType::Deletion => LookupResult::Deleted,
                };
            }
        }
        LookupResult::Missing
    }

    /// Approximate bytes of keys, values and node overhead held.
    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }

    /// Number of entries (all versions counted).
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no entries are present.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// An iterator over all entries in internal-key order.
    pub fn iter(&self) -> MemTableIter {
        MemTableIter { table: self.table.clone(), current: None }
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

type StaticEntry = Entry<'static, InternalKey, Bytes>;

/// Cursor over a memtable. Keeps the skiplist alive via the shared `Arc`.
pub struct MemTableIter {
    table: Arc<SkipMap<InternalKey, Bytes>>,
    current: Option<StaticEntry>,
}

impl MemTableIter {
    // SAFETY: entries borrow the skiplist, which `self.table` keeps alive
    // for the iterator's whole lifetime; nodes are never removed.
    fn hold(&self, entry: Option<Entry<'_, InternalKey, Bytes>>) -> Option<StaticEntry> {
        entry.map(|e| unsafe {
            std::mem::transmute::<Entry<'_, InternalKey, Bytes>, StaticEntry>(e)
        })
    }
}

impl KvIter for MemTableIter {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        self.current = self.hold(self.table.front());
    }

    fn seek_to_last(&mut self) {
        self.current = self.hold(self.table.back());
    }

    fn seek(&mut self, target: &[u8]) {
        self.current = match InternalKey::decode(target) {
            Ok(key) => self.hold(self.table.lower_bound(std::ops::Bound::Included(&key))),
            Err(_) => None,
        };
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.current = self.current.as_ref().and_then(|e| e.next());
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        self.current = self.current.as_ref().and_then(|e| e.prev());
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().expect("key on invalid iterator").key().encoded()
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().expect("value on invalid iterator").value()
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}
