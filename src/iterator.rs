//! The iterator abstraction shared by memtables, blocks, tables and levels,
//! plus the k-way merging iterator the read path is built on.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::key::Comparator;

/// A positioned cursor over an ordered sequence of key/value entries.
///
/// An iterator is either positioned at an entry (`valid()`) or not; `key` and
/// `value` may only be called while valid. Errors encountered while moving
/// are sticky and surfaced through `status`.
pub trait KvIter {
    /// Whether the iterator is positioned at an entry.
    fn valid(&self) -> bool;

    /// Positions at the first entry.
    fn seek_to_first(&mut self);

    /// Positions at the last entry.
    fn seek_to_last(&mut self);

    /// Positions at the first entry with key >= `target`.
    fn seek(&mut self, target: &[u8]);

    /// Advances to the next entry. Requires `valid()`.
    fn next(&mut self);

    /// Moves back to the previous entry. Requires `valid()`.
    fn prev(&mut self);

    /// The key at the current position. Requires `valid()`.
    fn key(&self) -> &[u8];

    /// The value at the current position. Requires `valid()`.
    fn value(&self) -> &[u8];

    /// The first error encountered, if any.
    fn status(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Merges several ordered child iterators into one ordered stream.
///
/// Children are consulted in priority order on key ties: earlier children
/// shadow later ones, so callers hand over sources newest-first.
pub struct MergingIter {
    cmp: Arc<dyn Comparator>,
    children: Vec<Box<dyn KvIter>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIter {
    /// Builds a merging iterator over `children`, ordered by `cmp`.
    pub fn new(cmp: Arc<dyn Comparator>, children: Vec<Box<dyn KvIter>>) -> Self {
        Self { cmp, children, current: None, direction: Direction::Forward }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if self.cmp.compare(child.key(), self.children[s].key()) == Ordering::Less {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match largest {
                None => largest = Some(i),
                Some(l) => {
                    if self.cmp.compare(child.key(), self.children[l].key()) == Ordering::Greater {
                        largest = Some(i);
                    }
                }
            }
        }
        self.current = largest;
    }
}

impl KvIter for MergingIter {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.find_largest();
        self.direction = Direction::Reverse;
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn next(&mut self) {
        let current = self.current.expect("next on invalid iterator");

        // After reverse movement the non-current children sit before the
        // current key; bring every child to the first entry after it.
        if self.direction != Direction::Forward {
            let key = self.key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() && self.cmp.compare(&key, child.key()) == Ordering::Equal {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let current = self.current.expect("prev on invalid iterator");

        // Mirror of next(): park every other child on the entry before the
        // current key.
        if self.direction != Direction::Reverse {
            let key = self.key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() {
                    // Child is at the first entry >= key; step back once.
                    child.prev();
                } else {
                    // All of the child's entries precede key.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("key on invalid iterator")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("value on invalid iterator")].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}
