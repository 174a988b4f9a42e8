//! Versions: immutable descriptions of the per-level table layout.
//!
//! A version answers reads and drives compaction decisions. New versions are
//! produced only by applying a [`edit::VersionEdit`] through the
//! [`set::VersionSet`]; readers hold a version alive via `Arc` while they
//! use it.

pub mod edit;
pub mod set;

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::{Options, ReadOptions, MAX_MEM_COMPACT_LEVEL, NUM_LEVELS};
use crate::error::Result;
use crate::iterator::KvIter;
use crate::key::{
    parse_internal_key, Comparator, InternalKey, InternalKeyComparator, LookupKey, ValueType,
    MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK,
};
use crate::sstable::TableIter;
use crate::table_cache::TableCache;

/// Metadata for one table file tracked by the version chain.
#[derive(Debug)]
pub struct FileMetaData {
    /// File number, unique for the database's lifetime.
    pub number: u64,
    /// File size in bytes.
    pub file_size: u64,
    /// Smallest internal key in the table.
    pub smallest: InternalKey,
    /// Largest internal key in the table.
    pub largest: InternalKey,
    /// Seeks this file may absorb before it becomes a compaction candidate.
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    /// Creates metadata with the seek allowance derived from the file size:
    /// one seek per 16 KiB, but no fewer than 100.
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        let allowed_seeks = (file_size / (16 * 1024)).max(100) as i64;
        Self { number, file_size, smallest, largest, allowed_seeks: AtomicI64::new(allowed_seeks) }
    }
}

/// Sums the sizes of `files`.
pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// Byte budget for level `level` (level 1 holds 10 MiB, doubling per level).
pub fn max_bytes_for_level(level: usize) -> f64 {
    debug_assert!(level >= 1);
    10.0 * 1024.0 * 1024.0 * (1u64 << (level - 1)) as f64
}

/// Grandparent overlap at which a compaction output file is cut.
pub fn max_grandparent_overlap_bytes(options: &Options) -> u64 {
    10 * options.max_file_size
}

/// Upper bound on the bytes a grown compaction may cover.
pub fn expanded_compaction_byte_size_limit(options: &Options) -> u64 {
    25 * options.max_file_size
}

/// Index of the first file in sorted, disjoint `files` whose largest key is
/// >= `internal_key`; `files.len()` when there is none.
pub fn find_file(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
    internal_key: &[u8],
) -> usize {
    let mut left = 0usize;
    let mut right = files.len();
    while left < right {
        let mid = (left + right) / 2;
        if icmp.compare(files[mid].largest.encoded(), internal_key) == Ordering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

fn after_file(user_cmp: &Arc<dyn Comparator>, user_key: Option<&[u8]>, file: &FileMetaData) -> bool {
    match user_key {
        Some(key) => user_cmp.compare(key, file.largest.user_key()) == Ordering::Greater,
        None => false,
    }
}

fn before_file(user_cmp: &Arc<dyn Comparator>, user_key: Option<&[u8]>, file: &FileMetaData) -> bool {
    match user_key {
        Some(key) => user_cmp.compare(key, file.smallest.user_key()) == Ordering::Less,
        None => false,
    }
}

/// Whether any file in `files` overlaps `[smallest_user, largest_user]`
/// (either bound may be open). `disjoint` marks levels > 0, enabling binary
/// search.
pub fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint: bool,
    files: &[Arc<FileMetaData>],
    smallest_user: Option<&[u8]>,
    largest_user: Option<&[u8]>,
) -> bool {
    let user_cmp = icmp.user_comparator();
    if !disjoint {
        return files.iter().any(|file| {
            !after_file(user_cmp, smallest_user, file) && !before_file(user_cmp, largest_user, file)
        });
    }

    let index = match smallest_user {
        Some(key) => {
            let small = InternalKey::new(key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            find_file(icmp, files, small.encoded())
        }
        None => 0,
    };
    if index >= files.len() {
        return false;
    }
    !before_file(user_cmp, largest_user, &files[index])
}

/// Seek-charging information produced by [`Version::get`].
#[derive(Default)]
pub struct GetStats {
    /// The first file that was consulted without yielding the key.
    pub seek_file: Option<(Arc<FileMetaData>, usize)>,
}

/// An immutable snapshot of the table layout, one file list per level.
pub struct Version {
    icmp: InternalKeyComparator,
    options: Arc<Options>,
    files: Vec<Vec<Arc<FileMetaData>>>,
    // Level whose size most exceeds its budget, set by finalize().
    compaction_level: usize,
    compaction_score: f64,
    // A file that exhausted its seek allowance, set under the DB mutex.
    seek_compact: Mutex<Option<(Arc<FileMetaData>, usize)>>,
}

impl Version {
    pub(crate) fn new(icmp: InternalKeyComparator, options: Arc<Options>) -> Self {
        Self {
            icmp,
            options,
            files: vec![Vec::new(); NUM_LEVELS],
            compaction_level: 0,
            compaction_score: -1.0,
            seek_compact: Mutex::new(None),
        }
    }

    /// The files at `level`, ordered by smallest key for levels > 0.
    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    /// Number of files at `level`.
    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub(crate) fn compaction_score(&self) -> f64 {
        self.compaction_score
    }

    pub(crate) fn compaction_level(&self) -> usize {
        self.compaction_level
    }

    pub(crate) fn take_seek_compaction(&self) -> Option<(Arc<FileMetaData>, usize)> {
        self.seek_compact.lock().clone()
    }

    pub(crate) fn has_seek_compaction(&self) -> bool {
        self.seek_compact.lock().is_some()
    }

    /// Computes the size-based compaction score after the file lists change.
    pub(crate) fn finalize(&mut self) {
        let mut best_level = 0;
        let mut best_score = -1.0f64;

        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                // File count, not bytes: every L0 file widens every read.
                self.files[0].len() as f64 / crate::config::L0_COMPACTION_TRIGGER as f64
            } else {
                total_file_size(&self.files[level]) as f64 / max_bytes_for_level(level)
            };
            if score > best_score {
                best_level = level;
                best_score = score;
            }
        }

        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }

    /// Looks `lookup` up through the levels, newest first.
    ///
    /// `Ok((None, _))` covers both a missing key and one hidden by a
    /// tombstone. The returned stats carry the seek charge, to be applied
    /// under the DB mutex via [`Version::update_stats`].
    pub fn get(
        &self,
        read_options: &ReadOptions,
        lookup: &LookupKey,
        table_cache: &TableCache,
    ) -> Result<(Option<Bytes>, GetStats)> {
        let user_cmp = self.icmp.user_comparator().clone();
        let user_key = lookup.user_key();
        let internal_key = lookup.internal_key();

        let mut stats = GetStats::default();
        let mut last_read: Option<(Arc<FileMetaData>, usize)> = None;

        let search = |file: &Arc<FileMetaData>,
                          level: usize,
                          stats: &mut GetStats,
                          last_read: &mut Option<(Arc<FileMetaData>, usize)>|
         -> Result<Option<Option<Bytes>>> {
            if last_read.is_some() && stats.seek_file.is_none() {
                // More than one file consulted: charge the first one.
                stats.seek_file = last_read.clone();
            }
            *last_read = Some((file.clone(), level));

            let found =
                table_cache.get(read_options, file.number, file.file_size, internal_key)?;
            if let Some((found_key, value)) = found {
                let parsed = parse_internal_key(&found_key)?;
                if user_cmp.compare(parsed.user_key, user_key) == Ordering::Equal {
                    return match parsed.value_type {
                        ValueType::Value => Ok(Some(Some(value))),
                        ValueType::Deletion => Ok(Some(None)),
                    };
                }
            }
            Ok(None)
        };

        // Level 0: files may overlap; consult newest first.
        let mut level0: Vec<&Arc<FileMetaData>> = self.files[0]
            .iter()
            .filter(|file| {
                user_cmp.compare(user_key, file.smallest.user_key()) != Ordering::Less
                    && user_cmp.compare(user_key, file.largest.user_key()) != Ordering::Greater
            })
            .collect();
        level0.sort_by(|a, b| b.number.cmp(&a.number));
        for file in level0 {
            if let Some(result) = search(file, 0, &mut stats, &mut last_read)? {
                return Ok((result, stats));
            }
        }

        // Deeper levels are disjoint: at most one candidate per level.
        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let index = find_file(&self.icmp, files, internal_key);
            if index >= files.len() {
                continue;
            }
            let file = &files[index];
            if user_cmp.compare(user_key, file.smallest.user_key()) == Ordering::Less {
                continue;
            }
            if let Some(result) = search(file, level, &mut stats, &mut last_read)? {
                return Ok((result, stats));
            }
        }

        Ok((None, stats))
    }

    /// Applies a read's seek charge. Returns true when a file ran out of
    /// seeks and a compaction should be scheduled.
    pub fn update_stats(&self, stats: GetStats) -> bool {
        if let Some((file, level)) = stats.seek_file {
            // Files at the deepest level have nowhere to compact to.
            if level + 1 >= NUM_LEVELS {
                return false;
            }
            let remaining = file.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) - 1;
            let mut seek_compact = self.seek_compact.lock();
            if remaining <= 0 && seek_compact.is_none() {
                *seek_compact = Some((file, level));
                return true;
            }
        }
        false
    }

    /// Samples one iterated key: when two or more files cover it, charges a
    /// seek to the shallowest, mimicking the cost the key imposes on gets.
    pub fn record_read_sample(&self, internal_key: &[u8]) -> bool {
        let parsed = match parse_internal_key(internal_key) {
            Ok(parsed) => parsed,
            Err(_) => return false,
        };
        let user_cmp = self.icmp.user_comparator();

        let mut matches = 0u32;
        let mut first: Option<(Arc<FileMetaData>, usize)> = None;

        // Level 0: linear scan over possibly-overlapping files.
        for file in &self.files[0] {
            if user_cmp.compare(parsed.user_key, file.smallest.user_key()) != Ordering::Less
                && user_cmp.compare(parsed.user_key, file.largest.user_key()) != Ordering::Greater
            {
                matches += 1;
                if first.is_none() {
                    first = Some((file.clone(), 0));
                }
                if matches >= 2 {
                    break;
                }
            }
        }

        // Deeper levels: one binary-searched candidate each.
        let mut level = 1;
        while matches < 2 && level < NUM_LEVELS {
            let files = &self.files[level];
            if !files.is_empty() {
                let small =
                    InternalKey::new(parsed.user_key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
                let index = find_file(&self.icmp, files, small.encoded());
                if index < files.len()
                    && user_cmp.compare(parsed.user_key, files[index].smallest.user_key())
                        != Ordering::Less
                {
                    matches += 1;
                    if first.is_none() {
                        first = Some((files[index].clone(), level));
                    }
                }
            }
            level += 1;
        }

        if matches >= 2 {
            return self.update_stats(GetStats { seek_file: first });
        }
        false
    }

    /// Whether any file at `level` overlaps `[smallest_user, largest_user]`.
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user: Option<&[u8]>,
        largest_user: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_user,
            largest_user,
        )
    }

    /// Level to place a fresh memtable flush at: as deep as possible while
    /// nothing overlaps and the grandparent overlap stays modest.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user: &[u8],
        largest_user: &[u8],
    ) -> usize {
        let mut level = 0;
        if !self.overlap_in_level(0, Some(smallest_user), Some(largest_user)) {
            let start = InternalKey::new(smallest_user, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            let limit = InternalKey::new(largest_user, 0, ValueType::Deletion);
            while level < MAX_MEM_COMPACT_LEVEL {
                if self.overlap_in_level(level + 1, Some(smallest_user), Some(largest_user)) {
                    break;
                }
                if level + 2 < NUM_LEVELS {
                    let overlaps =
                        self.overlapping_inputs(level + 2, Some(&start), Some(&limit));
                    if total_file_size(&overlaps) > max_grandparent_overlap_bytes(&self.options) {
                        break;
                    }
                }
                level += 1;
            }
        }
        level
    }

    /// All files at `level` overlapping `[begin, end]` (open bounds allowed).
    /// At level 0 the range grows until it covers every transitively
    /// overlapping file.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let user_cmp = self.icmp.user_comparator();
        let mut user_begin = begin.map(|k| k.user_key().to_vec());
        let mut user_end = end.map(|k| k.user_key().to_vec());

        let mut inputs: Vec<Arc<FileMetaData>> = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let file = self.files[level][i].clone();
            i += 1;

            let file_start = file.smallest.user_key();
            let file_limit = file.largest.user_key();
            if let Some(begin_key) = user_begin.as_deref() {
                if user_cmp.compare(file_limit, begin_key) == Ordering::Less {
                    continue;
                }
            }
            if let Some(end_key) = user_end.as_deref() {
                if user_cmp.compare(file_start, end_key) == Ordering::Greater {
                    continue;
                }
            }

            if level == 0 {
                // Level-0 files overlap each other: widen the range and
                // restart so every transitive overlap is pulled in.
                let mut restart = false;
                if let Some(begin_key) = user_begin.as_deref() {
                    if user_cmp.compare(file_start, begin_key) == Ordering::Less {
                        user_begin = Some(file_start.to_vec());
                        restart = true;
                    }
                }
                if let Some(end_key) = user_end.as_deref() {
                    if user_cmp.compare(file_limit, end_key) == Ordering::Greater {
                        user_end = Some(file_limit.to_vec());
                        restart = true;
                    }
                }
                if restart {
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
            inputs.push(file);
        }
        inputs
    }

    /// Iterators covering this version: one per level-0 file, then one
    /// concatenating iterator per deeper non-empty level.
    pub fn iters(
        &self,
        read_options: &ReadOptions,
        table_cache: Arc<TableCache>,
    ) -> Result<Vec<Box<dyn KvIter>>> {
        let mut iters: Vec<Box<dyn KvIter>> = Vec::new();
        for file in &self.files[0] {
            iters.push(Box::new(table_cache.iter(
                read_options.clone(),
                file.number,
                file.file_size,
            )?));
        }
        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                iters.push(Box::new(LevelIter::new(
                    self.icmp.clone(),
                    self.files[level].clone(),
                    table_cache.clone(),
                    read_options.clone(),
                )));
            }
        }
        Ok(iters)
    }

    pub(crate) fn set_files(&mut self, level: usize, files: Vec<Arc<FileMetaData>>) {
        self.files[level] = files;
    }

    #[cfg(test)]
    pub(crate) fn add_file_for_test(&mut self, level: usize, file: FileMetaData) {
        let icmp = self.icmp.clone();
        self.files[level].push(Arc::new(file));
        self.files[level]
            .sort_by(move |a, b| icmp.compare(a.smallest.encoded(), b.smallest.encoded()));
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<usize> = (0..NUM_LEVELS).map(|l| self.files[l].len()).collect();
        f.debug_struct("Version").field("files_per_level", &counts).finish()
    }
}

/// Concatenating iterator over a disjoint level: a binary-searched file list
/// on top, a table iterator underneath.
pub struct LevelIter {
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    table_cache: Arc<TableCache>,
    read_options: ReadOptions,
    // files.len() means unpositioned.
    index: usize,
    data_iter: Option<TableIter>,
    status: Option<crate::error::Error>,
}

impl LevelIter {
    /// Creates an iterator over `files`, which must be sorted and disjoint.
    pub fn new(
        icmp: InternalKeyComparator,
        files: Vec<Arc<FileMetaData>>,
        table_cache: Arc<TableCache>,
        read_options: ReadOptions,
    ) -> Self {
        let index = files.len();
        Self { icmp, files, table_cache, read_options, index, data_iter: None, status: None }
    }

    fn open_current_file(&mut self) {
        if self.index >= self.files.len() {
            self.data_iter = None;
            return;
        }
        let file = &self.files[self.index];
        match self.table_cache.iter(self.read_options.clone(), file.number, file.file_size) {
            Ok(iter) => self.data_iter = Some(iter),
            Err(err) => {
                self.status = Some(err);
                self.data_iter = None;
            }
        }
    }

    fn forward_to_valid(&mut self) {
        while self.data_iter.as_ref().map(|it| !it.valid()).unwrap_or(true) {
            if self.index + 1 >= self.files.len() {
                self.index = self.files.len();
                self.data_iter = None;
                return;
            }
            self.index += 1;
            self.open_current_file();
            if let Some(iter) = self.data_iter.as_mut() {
                iter.seek_to_first();
            }
        }
    }

    fn backward_to_valid(&mut self) {
        while self.data_iter.as_ref().map(|it| !it.valid()).unwrap_or(true) {
            if self.index == 0 {
                self.index = self.files.len();
                self.data_iter = None;
                return;
            }
            self.index -= 1;
            self.open_current_file();
            if let Some(iter) = self.data_iter.as_mut() {
                iter.seek_to_last();
            }
        }
    }
}

impl KvIter for LevelIter {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().map(|it| it.valid()).unwrap_or(false)
    }

    fn seek_to_first(&mut self) {
        if self.files.is_empty() {
            return;
        }
        self.index = 0;
        self.open_current_file();
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek_to_first();
        }
        self.forward_to_valid();
    }

    fn seek_to_last(&mut self) {
        if self.files.is_empty() {
            return;
        }
        self.index = self.files.len() - 1;
        self.open_current_file();
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek_to_last();
        }
        self.backward_to_valid();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        self.open_current_file();
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek(target);
        }
        self.forward_to_valid();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().unwrap().next();
        self.forward_to_valid();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().unwrap().prev();
        self.backward_to_valid();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().unwrap().value()
    }

    fn status(&self) -> Result<()> {
        if let Some(err) = &self.status {
            return Err(err.clone());
        }
        if let Some(iter) = &self.data_iter {
            iter.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::BytewiseComparator;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn meta(number: u64, smallest: &[u8], largest: &[u8]) -> FileMetaData {
        FileMetaData::new(
            number,
            1024,
            InternalKey::new(smallest, 100, ValueType::Value),
            InternalKey::new(largest, 100, ValueType::Value),
        )
    }

    fn version_with(levels: &[(usize, u64, &[u8], &[u8])]) -> Version {
        let mut version = Version::new(icmp(), Arc::new(Options::default()));
        for &(level, number, smallest, largest) in levels {
            version.add_file_for_test(level, meta(number, smallest, largest));
        }
        version
    }

    #[test]
    fn test_allowed_seeks_floor() {
        let small = meta(1, b"a", b"b");
        assert_eq!(small.allowed_seeks.load(AtomicOrdering::Relaxed), 100);

        let big = FileMetaData::new(
            2,
            64 * 1024 * 1024,
            InternalKey::new(b"a", 1, ValueType::Value),
            InternalKey::new(b"b", 1, ValueType::Value),
        );
        assert_eq!(big.allowed_seeks.load(AtomicOrdering::Relaxed), 4096);
    }

    #[test]
    fn test_find_file() {
        let cmp = icmp();
        let files: Vec<Arc<FileMetaData>> = vec![
            Arc::new(meta(1, b"c", b"e")),
            Arc::new(meta(2, b"g", b"i")),
            Arc::new(meta(3, b"k", b"m")),
        ];

        let probe = |key: &[u8]| {
            let target = InternalKey::new(key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            find_file(&cmp, &files, target.encoded())
        };
        assert_eq!(probe(b"a"), 0);
        assert_eq!(probe(b"d"), 0);
        assert_eq!(probe(b"f"), 1);
        assert_eq!(probe(b"i"), 1);
        assert_eq!(probe(b"j"), 2);
        assert_eq!(probe(b"z"), 3);
    }

    #[test]
    fn test_overlap_in_level() {
        let version = version_with(&[(1, 10, b"c", b"g"), (1, 11, b"m", b"p")]);
        assert!(version.overlap_in_level(1, Some(b"a"), Some(b"d")));
        assert!(version.overlap_in_level(1, Some(b"e"), Some(b"f")));
        assert!(!version.overlap_in_level(1, Some(b"h"), Some(b"l")));
        assert!(version.overlap_in_level(1, Some(b"n"), None));
        assert!(version.overlap_in_level(1, None, Some(b"c")));
        assert!(!version.overlap_in_level(1, Some(b"q"), None));
        assert!(!version.overlap_in_level(2, Some(b"a"), Some(b"z")));
    }

    #[test]
    fn test_overlapping_inputs_disjoint_level() {
        let version =
            version_with(&[(1, 10, b"a", b"c"), (1, 11, b"e", b"g"), (1, 12, b"i", b"k")]);
        let begin = InternalKey::new(b"b", 100, ValueType::Value);
        let end = InternalKey::new(b"f", 100, ValueType::Value);
        let inputs = version.overlapping_inputs(1, Some(&begin), Some(&end));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![10, 11]);
    }

    #[test]
    fn test_overlapping_inputs_level0_expands() {
        // 10 covers [a,e], 11 covers [d,h]: asking for [a,b] must pull in
        // both, because 11 overlaps 10.
        let version = version_with(&[(0, 10, b"a", b"e"), (0, 11, b"d", b"h")]);
        let begin = InternalKey::new(b"a", 100, ValueType::Value);
        let end = InternalKey::new(b"b", 100, ValueType::Value);
        let inputs = version.overlapping_inputs(0, Some(&begin), Some(&end));
        assert_eq!(inputs.len(), 2);
    }

    #[test]
    fn test_finalize_scores() {
        let mut version = version_with(&[
            (0, 10, b"a", b"b"),
            (0, 11, b"c", b"d"),
            (0, 12, b"e", b"f"),
            (0, 13, b"g", b"h"),
        ]);
        version.finalize();
        assert_eq!(version.compaction_level(), 0);
        assert!(version.compaction_score() >= 1.0);

        let mut empty = Version::new(icmp(), Arc::new(Options::default()));
        empty.finalize();
        assert!(empty.compaction_score() < 1.0);
    }

    #[test]
    fn test_pick_level_for_memtable_output() {
        // Nothing anywhere: goes to MAX_MEM_COMPACT_LEVEL.
        let version = version_with(&[]);
        assert_eq!(version.pick_level_for_memtable_output(b"a", b"b"), MAX_MEM_COMPACT_LEVEL);

        // Overlap at level 0 pins the output at 0.
        let version = version_with(&[(0, 10, b"a", b"m")]);
        assert_eq!(version.pick_level_for_memtable_output(b"b", b"c"), 0);

        // Overlap at level 1 stops promotion below it.
        let version = version_with(&[(1, 10, b"a", b"m")]);
        assert_eq!(version.pick_level_for_memtable_output(b"b", b"c"), 0);

        // Overlap at level 2 allows level 1.
        let version = version_with(&[(2, 10, b"a", b"m")]);
        assert_eq!(version.pick_level_for_memtable_output(b"b", b"c"), 1);
    }

    #[test]
    fn test_update_stats_triggers_once() {
        let version = version_with(&[(1, 10, b"a", b"m")]);
        let file = version.files(1)[0].clone();
        file.allowed_seeks.store(1, AtomicOrdering::Relaxed);

        let charged = version.update_stats(GetStats { seek_file: Some((file.clone(), 1)) });
        assert!(charged);
        assert!(version.has_seek_compaction());

        // Already pending: no second trigger.
        let charged = version.update_stats(GetStats { seek_file: Some((file, 1)) });
        assert!(!charged);
    }
}
