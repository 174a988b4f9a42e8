//! Point-in-time read views.
//!
//! A snapshot pins a sequence number: reads taken through it observe exactly
//! the writes committed at or below that sequence, and compaction keeps any
//! record version that a live snapshot may still need.

use std::sync::{Arc, Weak};

use crate::key::SequenceNumber;

/// A handle to a point-in-time view of the database.
///
/// Cloning is cheap; the view stays pinned until every clone is dropped.
/// Pass a snapshot to reads via [`crate::ReadOptions::at_snapshot`].
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

pub(crate) struct SnapshotInner {
    sequence: SequenceNumber,
}

impl Snapshot {
    pub(crate) fn new(sequence: SequenceNumber) -> Self {
        Self { inner: Arc::new(SnapshotInner { sequence }) }
    }

    pub(crate) fn handle(&self) -> Weak<SnapshotInner> {
        Arc::downgrade(&self.inner)
    }

    /// The sequence number this snapshot observes.
    pub fn sequence(&self) -> SequenceNumber {
        self.inner.sequence
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("sequence", &self.inner.sequence).finish()
    }
}

/// The set of snapshots handed out and possibly still alive.
///
/// Entries are weak: a snapshot releases itself when its last clone drops,
/// with no callback into the database. Dead entries are pruned whenever the
/// list is consulted.
#[derive(Default)]
pub(crate) struct SnapshotList {
    entries: Vec<Weak<SnapshotInner>>,
}

impl SnapshotList {
    /// Pins `sequence` and returns the user-facing handle.
    pub fn pin(&mut self, sequence: SequenceNumber) -> Snapshot {
        let snapshot = Snapshot::new(sequence);
        self.entries.push(snapshot.handle());
        snapshot
    }

    /// The smallest sequence still pinned, if any snapshot is alive.
    pub fn smallest(&mut self) -> Option<SequenceNumber> {
        self.entries.retain(|weak| weak.strong_count() > 0);
        self.entries.iter().filter_map(|weak| weak.upgrade()).map(|s| s.sequence).min()
    }

    /// Whether no live snapshot remains.
    pub fn is_empty(&mut self) -> bool {
        self.smallest().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_pins_sequence() {
        let mut list = SnapshotList::default();
        let s1 = list.pin(10);
        let s2 = list.pin(20);
        assert_eq!(s1.sequence(), 10);
        assert_eq!(s2.sequence(), 20);
        assert_eq!(list.smallest(), Some(10));
    }

    #[test]
    fn test_drop_releases() {
        let mut list = SnapshotList::default();
        let s1 = list.pin(10);
        let s2 = list.pin(20);
        drop(s1);
        assert_eq!(list.smallest(), Some(20));
        drop(s2);
        assert_eq!(list.smallest(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_clone_keeps_pin() {
        let mut list = SnapshotList::default();
        let s1 = list.pin(7);
        let s1_clone = s1.clone();
        drop(s1);
        assert_eq!(list.smallest(), Some(7));
        drop(s1_clone);
        assert_eq!(list.smallest(), None);
    }
}
