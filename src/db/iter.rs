//! The user-facing database iterator.
//!
//! Wraps a merging iterator over internal keys and collapses it to one entry
//! per user key: for each user key the first entry at or below the iterator's
//! sequence wins, and tombstoned keys disappear.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::READ_BYTES_PERIOD;
use crate::db::DbInner;
use crate::error::Result;
use crate::iterator::{KvIter, MergingIter};
use crate::key::{
    append_internal_key, extract_user_key, parse_internal_key, Comparator, InternalKeyComparator,
    SequenceNumber, ValueType, VALUE_TYPE_FOR_SEEK,
};
use crate::version::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    // The merging iterator sits exactly at the entry behind key().
    Forward,
    // The merging iterator sits before every entry of key(); the entry is
    // buffered in saved_key/saved_value.
    Reverse,
}

/// Ordered cursor over the user-visible keys of a database snapshot.
///
/// Obtained from [`crate::DB::iter`]. The iterator pins the memtables and
/// version it reads from; long-lived iterators delay file garbage
/// collection accordingly.
pub struct DbIterator {
    inner: Arc<DbInner>,
    version: Arc<Version>,
    icmp: InternalKeyComparator,
    iter: MergingIter,
    sequence: SequenceNumber,
    direction: Direction,
    valid: bool,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    bytes_until_read_sample: usize,
}

impl DbIterator {
    pub(crate) fn new(
        inner: Arc<DbInner>,
        version: Arc<Version>,
        icmp: InternalKeyComparator,
        iter: MergingIter,
        sequence: SequenceNumber,
    ) -> Self {
        Self {
            inner,
            version,
            icmp,
            iter,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            bytes_until_read_sample: READ_BYTES_PERIOD,
        }
    }

    /// Whether the iterator is positioned at an entry.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The current user key. Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => extract_user_key(self.iter.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    /// The current value. Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.iter.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    /// The first error hit while iterating, if any.
    pub fn status(&self) -> Result<()> {
        self.iter.status()
    }

    /// Positions at the first user key.
    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.iter.seek_to_first();
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    /// Positions at the last user key.
    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.iter.seek_to_last();
        self.find_prev_user_entry();
    }

    /// Positions at the first user key at or after `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        append_internal_key(&mut self.saved_key, target, self.sequence, VALUE_TYPE_FOR_SEEK);
        self.iter.seek(&self.saved_key);
        self.saved_key.clear();
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    /// Advances to the next user key.
    pub fn next(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            // The merging iterator is before every entry of key(): step it
            // back onto (or past) them.
            self.direction = Direction::Forward;
            if !self.iter.valid() {
                self.iter.seek_to_first();
            } else {
                self.iter.next();
            }
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            // saved_key already holds the current user key to skip past.
        } else {
            self.saved_key = self.key().to_vec();
        }

        self.find_next_user_entry(true);
    }

    /// Moves back to the previous user key.
    pub fn prev(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // Walk backwards until we are before every entry of the current
            // user key.
            debug_assert!(self.iter.valid());
            self.saved_key = extract_user_key(self.iter.key()).to_vec();
            loop {
                self.iter.prev();
                if !self.iter.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self
                    .icmp
                    .user_comparator()
                    .compare(extract_user_key(self.iter.key()), &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    /// Forward scan to the newest visible, non-deleted entry of the next
    /// user key. With `skipping`, entries for `saved_key` are passed over.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert_eq!(self.direction, Direction::Forward);

        loop {
            if !self.iter.valid() {
                break;
            }
            self.sample_read();
            if let Ok(parsed) = parse_internal_key(self.iter.key()) {
                if parsed.sequence <= self.sequence {
                    match parsed.value_type {
                        ValueType::Deletion => {
                            // Hide every older entry of this user key.
                            self.saved_key = parsed.user_key.to_vec();
                            skipping = true;
                        }
                        ValueType::Value => {
                            let hidden = skipping
                                && self
                                    .icmp
                                    .user_comparator()
                                    .compare(parsed.user_key, &self.saved_key)
                                    != Ordering::Greater;
                            if !hidden {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                    }
                }
            }
            self.iter.next();
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Backward scan to the newest visible entry of the previous user key,
    /// buffering it into saved_key/saved_value.
    fn find_prev_user_entry(&mut self) {
        debug_assert_eq!(self.direction, Direction::Reverse);

        let mut value_type = ValueType::Deletion;
        while self.iter.valid() {
            self.sample_read();
            if let Ok(parsed) = parse_internal_key(self.iter.key()) {
                if parsed.sequence <= self.sequence {
                    if value_type != ValueType::Deletion
                        && self
                            .icmp
                            .user_comparator()
                            .compare(parsed.user_key, &self.saved_key)
                            == Ordering::Less
                    {
                        // Stepped before the buffered entry's user key: the
                        // buffer holds the answer.
                        break;
                    }
                    value_type = parsed.value_type;
                    if value_type == ValueType::Deletion {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    } else {
                        self.saved_key = parsed.user_key.to_vec();
                        self.saved_value = self.iter.value().to_vec();
                    }
                }
            }
            self.iter.prev();
        }

        if value_type == ValueType::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }

    /// Every ~1 MiB of scanned entries, asks the version whether this key
    /// overlaps multiple levels and charges a seek if so.
    fn sample_read(&mut self) {
        let bytes = self.iter.key().len() + self.iter.value().len();
        if self.bytes_until_read_sample <= bytes {
            self.bytes_until_read_sample = READ_BYTES_PERIOD;
            let key = self.iter.key().to_vec();
            self.inner.record_read_sample(&self.version, &key);
        } else {
            self.bytes_until_read_sample -= bytes;
        }
    }
}
