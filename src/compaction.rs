//! Compaction state: the chosen inputs, grandparent accounting, and the
//! edit under construction.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::{Options, NUM_LEVELS};
use crate::key::{Comparator, InternalKeyComparator};
use crate::version::edit::VersionEdit;
use crate::version::{
    max_grandparent_overlap_bytes, total_file_size, FileMetaData, Version,
};

/// A planned merge of `inputs[0]` at `level` with `inputs[1]` at `level+1`.
pub struct Compaction {
    level: usize,
    max_output_file_size: u64,
    max_grandparent_overlap: u64,
    input_version: Arc<Version>,
    pub(crate) edit: VersionEdit,
    // inputs[0] is the level-L set, inputs[1] the level-L+1 overlap set.
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],
    // Level L+2 files overlapping the compaction, bounding output files.
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,
    // Per-level scan positions for is_base_level_for_key.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub(crate) fn new(options: &Options, level: usize, input_version: Arc<Version>) -> Self {
        Self {
            level,
            max_output_file_size: options.max_file_size,
            max_grandparent_overlap: max_grandparent_overlap_bytes(options),
            input_version,
            edit: VersionEdit::new(),
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    /// The level being compacted; outputs land at `level() + 1`.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Size at which an output table is cut.
    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    /// Number of input files from `which` side (0 = level, 1 = level+1).
    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    /// The `i`-th input file of side `which`.
    pub fn input(&self, which: usize, i: usize) -> &Arc<FileMetaData> {
        &self.inputs[which][i]
    }

    /// The edit that installs this compaction's result.
    pub fn edit_mut(&mut self) -> &mut VersionEdit {
        &mut self.edit
    }

    /// The version the inputs were chosen from.
    pub fn input_version(&self) -> &Arc<Version> {
        &self.input_version
    }

    /// A single file can move down one level untouched when nothing at the
    /// next level overlaps it and the grandparent overlap stays small enough
    /// that a later compaction of `level+1` is not made too expensive.
    pub fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap
    }

    /// Marks every input file deleted in the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for file in &self.inputs[which] {
                self.edit.remove_file(self.level + which, file.number);
            }
        }
    }

    /// Whether `user_key` cannot exist in any level deeper than the output
    /// level, so an obsolete tombstone for it may be dropped.
    ///
    /// The per-level pointers ride along with the ascending key order of the
    /// merge, so the whole compaction does O(files) range checks in total.
    pub fn is_base_level_for_key(
        &mut self,
        user_key: &[u8],
        icmp: &InternalKeyComparator,
    ) -> bool {
        let user_cmp = icmp.user_comparator();
        for level in self.level + 2..NUM_LEVELS {
            let files = self.input_version.files(level);
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if user_cmp.compare(user_key, file.largest.user_key()) != Ordering::Greater {
                    if user_cmp.compare(user_key, file.smallest.user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// Whether the current output should be closed before writing
    /// `internal_key`, to keep any output file's grandparent overlap within
    /// bounds.
    pub fn should_stop_before(&mut self, internal_key: &[u8], icmp: &InternalKeyComparator) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && icmp.compare(
                internal_key,
                self.grandparents[self.grandparent_index].largest.encoded(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes +=
                    self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap {
            self.overlapped_bytes = 0;
            return true;
        }
        false
    }

    /// Internal keys of the whole input set, for grandparent selection and
    /// range bookkeeping.
    pub(crate) fn internal_key_range(
        &self,
        icmp: &InternalKeyComparator,
    ) -> (Option<crate::key::InternalKey>, Option<crate::key::InternalKey>) {
        let mut smallest: Option<crate::key::InternalKey> = None;
        let mut largest: Option<crate::key::InternalKey> = None;
        for which in 0..2 {
            for file in &self.inputs[which] {
                if smallest
                    .as_ref()
                    .map(|s| icmp.compare(file.smallest.encoded(), s.encoded()) == Ordering::Less)
                    .unwrap_or(true)
                {
                    smallest = Some(file.smallest.clone());
                }
                if largest
                    .as_ref()
                    .map(|l| icmp.compare(file.largest.encoded(), l.encoded()) == Ordering::Greater)
                    .unwrap_or(true)
                {
                    largest = Some(file.largest.clone());
                }
            }
        }
        (smallest, largest)
    }

}
