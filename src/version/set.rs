//! The version set: owns the current version, the manifest, and the file
//! number allocator, and picks compactions.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use crate::compaction::Compaction;
use crate::config::{Options, ReadOptions, NUM_LEVELS};
use crate::db::filename::{
    current_file_name, descriptor_file_name, read_current_file, set_current_file,
};
use crate::error::{Error, Result};
use crate::iterator::{KvIter, MergingIter};
use crate::key::{Comparator, InternalKey, InternalKeyComparator, SequenceNumber};
use crate::table_cache::TableCache;
use crate::version::edit::VersionEdit;
use crate::version::{
    expanded_compaction_byte_size_limit, total_file_size, FileMetaData, LevelIter, Version,
};
use crate::wal::{LogReader, LogWriter};

/// Owns the version chain and the manifest.
///
/// All methods are called with the DB mutex held; the version set itself is
/// not internally synchronised.
pub struct VersionSet {
    dbname: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    log_number: u64,
    // Zero except for databases written by older versions of the format.
    prev_log_number: u64,

    current: Arc<Version>,
    // Older versions still pinned by readers; consulted for live-file GC.
    live_versions: Vec<Weak<Version>>,

    manifest_log: Option<LogWriter>,
    // Per-level key at which the next size compaction starts (round robin).
    compact_pointer: [Option<InternalKey>; NUM_LEVELS],
}

impl VersionSet {
    /// Creates an empty version set for `dbname`.
    pub fn new(
        dbname: PathBuf,
        options: Arc<Options>,
        icmp: InternalKeyComparator,
        table_cache: Arc<TableCache>,
    ) -> Self {
        let mut current = Version::new(icmp.clone(), options.clone());
        current.finalize();
        Self {
            dbname,
            icmp,
            table_cache,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            current: Arc::new(current),
            live_versions: Vec::new(),
            manifest_log: None,
            compact_pointer: Default::default(),
            options,
        }
    }

    /// The version reads are served from.
    pub fn current(&self) -> &Arc<Version> {
        &self.current
    }

    /// The internal-key comparator shared by the whole database.
    pub fn icmp(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    /// Allocates a fresh, never-reused file number.
    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Ensures `number` is never allocated again.
    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    /// Number of the manifest file in use (or about to be created).
    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    /// Largest sequence number committed.
    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    /// Advances the committed sequence number.
    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    /// The oldest WAL whose writes are not yet flushed.
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Legacy predecessor log number (zero on current databases).
    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    /// Number of files at `level` in the current version.
    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    /// Total bytes at `level` in the current version.
    pub fn num_level_bytes(&self, level: usize) -> u64 {
        total_file_size(self.current.files(level))
    }

    /// A short per-level file count summary for the log.
    pub fn level_summary(&self) -> String {
        let counts: Vec<String> =
            (0..NUM_LEVELS).map(|l| self.current.num_files(l).to_string()).collect();
        format!("files[ {} ]", counts.join(" "))
    }

    /// Whether a size- or seek-triggered compaction is due.
    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score() >= 1.0 || self.current.has_seek_compaction()
    }

    /// Every file number referenced by the current version or any version a
    /// reader still holds.
    pub fn live_files(&mut self) -> HashSet<u64> {
        self.live_versions.retain(|weak| weak.strong_count() > 0);

        let mut live = HashSet::new();
        let mut collect = |version: &Version| {
            for level in 0..NUM_LEVELS {
                for file in version.files(level) {
                    live.insert(file.number);
                }
            }
        };
        collect(&self.current);
        for weak in &self.live_versions {
            if let Some(version) = weak.upgrade() {
                collect(&version);
            }
        }
        live
    }

    /// Applies `edit` to the current version, persists it to the manifest
    /// (fsynced), and installs the result as current.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        match edit.log_number {
            Some(number) => {
                debug_assert!(number >= self.log_number);
                debug_assert!(number < self.next_file_number);
            }
            None => edit.set_log_number(self.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut version = Version::new(self.icmp.clone(), self.options.clone());
        {
            let mut builder = VersionBuilder::new(self.icmp.clone(), self.current.clone());
            builder.accumulate(edit, &mut self.compact_pointer);
            builder.save_to(&mut version)?;
        }
        version.finalize();

        // First edit after open (or ever): start a manifest and seed it with
        // a snapshot of the current state.
        let mut created_manifest = false;
        if self.manifest_log.is_none() {
            if self.manifest_file_number == 0 {
                self.manifest_file_number = self.new_file_number();
            }
            let path = descriptor_file_name(&self.dbname, self.manifest_file_number);
            let file = File::create(path)?;
            let mut log = LogWriter::new(file);
            let snapshot = self.snapshot_edit();
            log.add_record(&snapshot.encode())?;
            self.manifest_log = Some(log);
            created_manifest = true;
        }

        let log = self.manifest_log.as_mut().expect("manifest log exists");
        log.add_record(&edit.encode())?;
        log.sync()?;
        if created_manifest {
            set_current_file(&self.dbname, self.manifest_file_number)?;
        }

        // Install. The superseded version may still be pinned by readers.
        let old = std::mem::replace(&mut self.current, Arc::new(version));
        self.live_versions.push(Arc::downgrade(&old));
        drop(old);
        self.log_number = edit.log_number.expect("set above");
        self.prev_log_number = edit.prev_log_number.expect("set above");
        Ok(())
    }

    /// An edit reproducing the entire current state, used to head a fresh
    /// manifest.
    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        for (level, pointer) in self.compact_pointer.iter().enumerate() {
            if let Some(key) = pointer {
                edit.set_compact_pointer(level, key.clone());
            }
        }
        for level in 0..NUM_LEVELS {
            for file in self.current.files(level) {
                edit.add_file(
                    level,
                    file.number,
                    file.file_size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
            }
        }
        edit
    }

    /// Rebuilds state from `CURRENT` and the manifest it names.
    ///
    /// Returns whether the caller must write a consolidating snapshot (true
    /// whenever the old manifest is not being reused).
    pub fn recover(&mut self) -> Result<bool> {
        let manifest_name = read_current_file(&self.dbname)?;
        let manifest_path = self.dbname.join(&manifest_name);
        let file = File::open(&manifest_path).map_err(|_| {
            Error::corruption(format!("CURRENT points to missing manifest {}", manifest_name))
        })?;
        let manifest_size = file.metadata()?.len();

        let mut has_log_number = None;
        let mut has_prev_log_number = None;
        let mut has_next_file = None;
        let mut has_last_sequence = None;
        let mut builder = VersionBuilder::new(self.icmp.clone(), self.current.clone());

        let mut corruption: Option<String> = None;
        {
            let reporter: crate::wal::CorruptionReporter<'_> =
                Box::new(|bytes, reason| {
                    log::warn!("manifest corruption ({} bytes): {}", bytes, reason);
                    corruption.get_or_insert_with(|| reason.to_string());
                });
            let mut reader = LogReader::new(file, true, Some(reporter));
            while let Some(record) = reader.read_record() {
                let edit = VersionEdit::decode(&record)?;
                if let Some(name) = &edit.comparator_name {
                    if name != self.icmp.user_comparator().name() {
                        return Err(Error::invalid_argument(format!(
                            "comparator mismatch: manifest uses {}, options supply {}",
                            name,
                            self.icmp.user_comparator().name()
                        )));
                    }
                }
                builder.accumulate(&edit, &mut self.compact_pointer);
                if edit.log_number.is_some() {
                    has_log_number = edit.log_number;
                }
                if edit.prev_log_number.is_some() {
                    has_prev_log_number = edit.prev_log_number;
                }
                if edit.next_file_number.is_some() {
                    has_next_file = edit.next_file_number;
                }
                if edit.last_sequence.is_some() {
                    has_last_sequence = edit.last_sequence;
                }
            }
        }
        if let Some(reason) = corruption {
            return Err(Error::corruption(format!("manifest damaged: {}", reason)));
        }

        let next_file = has_next_file
            .ok_or_else(|| Error::corruption("no next-file entry in manifest"))?;
        let log_number = has_log_number
            .ok_or_else(|| Error::corruption("no log-number entry in manifest"))?;
        let last_sequence = has_last_sequence
            .ok_or_else(|| Error::corruption("no last-sequence entry in manifest"))?;
        let prev_log_number = has_prev_log_number.unwrap_or(0);

        let mut version = Version::new(self.icmp.clone(), self.options.clone());
        builder.save_to(&mut version)?;
        version.finalize();

        self.next_file_number = next_file;
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;

        let old = std::mem::replace(&mut self.current, Arc::new(version));
        self.live_versions.push(Arc::downgrade(&old));
        drop(old);

        if self.try_reuse_manifest(&manifest_path, manifest_size) {
            Ok(false)
        } else {
            self.manifest_file_number = self.new_file_number();
            Ok(true)
        }
    }

    fn try_reuse_manifest(&mut self, manifest_path: &Path, manifest_size: u64) -> bool {
        if !self.options.reuse_logs {
            return false;
        }
        // Only append to a manifest that has not grown past one file's worth
        // of edits; otherwise a fresh, compact one is cheaper to replay.
        if manifest_size >= self.options.max_file_size {
            return false;
        }
        let manifest_number = match manifest_path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(crate::db::filename::parse_file_name)
        {
            Some((crate::db::filename::FileType::Descriptor, number)) => number,
            _ => return false,
        };
        match OpenOptions::new().append(true).open(manifest_path) {
            Ok(file) => {
                log::info!("reusing manifest {}", manifest_path.display());
                self.manifest_log = Some(LogWriter::with_initial_length(file, manifest_size));
                self.manifest_file_number = manifest_number;
                true
            }
            Err(err) => {
                log::warn!("could not reuse manifest {}: {}", manifest_path.display(), err);
                false
            }
        }
    }

    /// Writes the database-creation manifest and points `CURRENT` at it.
    pub fn create_new_db(dbname: &Path, options: &Options) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(options.comparator.name());
        edit.set_log_number(0);
        edit.set_next_file_number(2);
        edit.set_last_sequence(0);

        let manifest = descriptor_file_name(dbname, 1);
        let mut log = LogWriter::new(File::create(&manifest)?);
        let result = log.add_record(&edit.encode()).and_then(|_| log.sync());
        match result {
            Ok(()) => set_current_file(dbname, 1),
            Err(err) => {
                let _ = std::fs::remove_file(&manifest);
                Err(err)
            }
        }
    }

    /// Whether a database already exists at `dbname`.
    pub fn db_exists(dbname: &Path) -> bool {
        current_file_name(dbname).exists()
    }

    /// Picks the next compaction to run, preferring size triggers over seek
    /// triggers. Returns `None` when nothing is due.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current.clone();
        let size_trigger = current.compaction_score() >= 1.0;

        let mut compaction;
        let level;
        if size_trigger {
            level = current.compaction_level();
            debug_assert!(level + 1 < NUM_LEVELS);
            compaction = Compaction::new(&self.options, level, current.clone());

            // Resume after the last compacted key at this level, wrapping.
            for file in current.files(level) {
                let past_pointer = match &self.compact_pointer[level] {
                    Some(pointer) => {
                        self.icmp.compare(file.largest.encoded(), pointer.encoded())
                            == std::cmp::Ordering::Greater
                    }
                    None => true,
                };
                if past_pointer {
                    compaction.inputs[0].push(file.clone());
                    break;
                }
            }
            if compaction.inputs[0].is_empty() {
                if let Some(file) = current.files(level).first() {
                    compaction.inputs[0].push(file.clone());
                }
            }
            if compaction.inputs[0].is_empty() {
                return None;
            }
        } else if let Some((file, seek_level)) = current.take_seek_compaction() {
            level = seek_level;
            compaction = Compaction::new(&self.options, level, current.clone());
            compaction.inputs[0].push(file);
        } else {
            return None;
        }

        // Level-0 files overlap: widen to every file touching the range.
        if level == 0 {
            let (smallest, largest) = compaction.internal_key_range(&self.icmp);
            compaction.inputs[0] =
                current.overlapping_inputs(0, smallest.as_ref(), largest.as_ref());
            debug_assert!(!compaction.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Builds a compaction covering `[begin, end]` at `level` for a manual
    /// request. Returns `None` when the range holds no files.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current.clone();
        let mut inputs = current.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Avoid one huge manual compaction at disjoint levels: stop once the
        // inputs cover a full output file's worth of data.
        if level > 0 {
            let limit = self.options.max_file_size;
            let mut total = 0u64;
            for (i, file) in inputs.iter().enumerate() {
                total += file.file_size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut compaction = Compaction::new(&self.options, level, current);
        compaction.inputs[0] = inputs;
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Completes input selection: boundary fix-ups, the level+1 overlap set,
    /// bounded growth of the level set, and grandparent bookkeeping.
    fn setup_other_inputs(&mut self, compaction: &mut Compaction) {
        let level = compaction.level();
        let current = compaction.input_version().clone();

        add_boundary_inputs(&self.icmp, current.files(level), &mut compaction.inputs[0]);
        let (smallest, largest) = compaction.internal_key_range(&self.icmp);
        compaction.inputs[1] =
            current.overlapping_inputs(level + 1, smallest.as_ref(), largest.as_ref());
        add_boundary_inputs(&self.icmp, current.files(level + 1), &mut compaction.inputs[1]);

        let (mut all_start, mut all_limit) = compaction.internal_key_range(&self.icmp);

        // Try to grow the level set without changing the level+1 set, while
        // keeping the total input size bounded.
        if !compaction.inputs[1].is_empty() {
            let mut expanded0 =
                current.overlapping_inputs(level, all_start.as_ref(), all_limit.as_ref());
            add_boundary_inputs(&self.icmp, current.files(level), &mut expanded0);
            let inputs1_size = total_file_size(&compaction.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > compaction.inputs[0].len()
                && inputs1_size + expanded0_size
                    < expanded_compaction_byte_size_limit(&self.options)
            {
                let mut range_holder = Compaction::new(&self.options, level, current.clone());
                range_holder.inputs[0] = expanded0.clone();
                let (new_start, new_limit) = range_holder.internal_key_range(&self.icmp);
                let expanded1 = current.overlapping_inputs(
                    level + 1,
                    new_start.as_ref(),
                    new_limit.as_ref(),
                );
                if expanded1.len() == compaction.inputs[1].len() {
                    log::info!(
                        "expanding level-{} compaction from {} to {} files",
                        level,
                        compaction.inputs[0].len(),
                        expanded0.len()
                    );
                    compaction.inputs[0] = expanded0;
                    all_start = new_start;
                    all_limit = new_limit;
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            compaction.grandparents =
                current.overlapping_inputs(level + 2, all_start.as_ref(), all_limit.as_ref());
        }

        // Remember the end of this compaction so the next size-triggered one
        // at this level resumes after it.
        if let Some(largest) = all_limit {
            self.compact_pointer[level] = Some(largest.clone());
            compaction.edit_mut().set_compact_pointer(level, largest);
        }
    }

    /// Builds the merged iterator over every input file of `compaction`.
    pub fn make_input_iterator(&self, compaction: &Compaction) -> Result<MergingIter> {
        // Compaction reads are sequential and single-shot: do not displace
        // cached blocks with them.
        let mut read_options = ReadOptions::new();
        read_options.fill_cache = false;
        read_options.verify_checksums = self.options.paranoid_checks;

        let mut iters: Vec<Box<dyn KvIter>> = Vec::new();
        for which in 0..2 {
            if compaction.inputs[which].is_empty() {
                continue;
            }
            if compaction.level() + which == 0 {
                for file in &compaction.inputs[0] {
                    iters.push(Box::new(self.table_cache.iter(
                        read_options.clone(),
                        file.number,
                        file.file_size,
                    )?));
                }
            } else {
                iters.push(Box::new(LevelIter::new(
                    self.icmp.clone(),
                    compaction.inputs[which].clone(),
                    self.table_cache.clone(),
                    read_options.clone(),
                )));
            }
        }
        let cmp: Arc<dyn Comparator> = Arc::new(self.icmp.clone());
        Ok(MergingIter::new(cmp, iters))
    }
}

/// Includes, at a disjoint level, any file whose smallest user key equals
/// the largest user key of the chosen inputs. Versions of one user key can
/// straddle a file boundary; compacting only the earlier file would let an
/// older version surface above a newer one.
fn add_boundary_inputs(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetaData>],
    inputs: &mut Vec<Arc<FileMetaData>>,
) {
    let mut largest = match inputs
        .iter()
        .max_by(|a, b| icmp.compare(a.largest.encoded(), b.largest.encoded()))
    {
        Some(file) => file.largest.clone(),
        None => return,
    };

    loop {
        // The smallest boundary file: largest.user == f.smallest.user but
        // f.smallest sorts after largest (older sequence).
        let boundary = level_files
            .iter()
            .filter(|file| {
                icmp.compare(file.smallest.encoded(), largest.encoded())
                    == std::cmp::Ordering::Greater
                    && icmp
                        .user_comparator()
                        .compare(file.smallest.user_key(), largest.user_key())
                        == std::cmp::Ordering::Equal
            })
            .min_by(|a, b| icmp.compare(a.smallest.encoded(), b.smallest.encoded()))
            .cloned();

        match boundary {
            Some(file) => {
                largest = file.largest.clone();
                if !inputs.iter().any(|f| f.number == file.number) {
                    inputs.push(file);
                }
            }
            None => break,
        }
    }
}

/// Applies edits on top of a base version to produce the next one.
struct VersionBuilder {
    icmp: InternalKeyComparator,
    base: Arc<Version>,
    deleted: Vec<HashSet<u64>>,
    added: Vec<Vec<Arc<FileMetaData>>>,
}

impl VersionBuilder {
    fn new(icmp: InternalKeyComparator, base: Arc<Version>) -> Self {
        Self {
            icmp,
            base,
            deleted: vec![HashSet::new(); NUM_LEVELS],
            added: vec![Vec::new(); NUM_LEVELS],
        }
    }

    /// Folds one edit into the pending state.
    fn accumulate(
        &mut self,
        edit: &VersionEdit,
        compact_pointer: &mut [Option<InternalKey>; NUM_LEVELS],
    ) {
        for (level, key) in &edit.compact_pointers {
            compact_pointer[*level] = Some(key.clone());
        }
        for (level, number) in &edit.deleted_files {
            self.deleted[*level].insert(*number);
        }
        for (level, entry) in &edit.new_files {
            let meta = Arc::new(FileMetaData::new(
                entry.number,
                entry.file_size,
                entry.smallest.clone(),
                entry.largest.clone(),
            ));
            self.deleted[*level].remove(&entry.number);
            self.added[*level].push(meta);
        }
    }

    /// Materialises the pending state into `version`.
    fn save_to(&mut self, version: &mut Version) -> Result<()> {
        for level in 0..NUM_LEVELS {
            let mut files: Vec<Arc<FileMetaData>> = self
                .base
                .files(level)
                .iter()
                .chain(self.added[level].iter())
                .filter(|file| !self.deleted[level].contains(&file.number))
                .cloned()
                .collect();
            let icmp = self.icmp.clone();
            files.sort_by(|a, b| {
                icmp.compare(a.smallest.encoded(), b.smallest.encoded())
                    .then_with(|| a.number.cmp(&b.number))
            });

            // Levels past 0 must stay disjoint; a violation here means the
            // manifest or a compaction produced overlapping files.
            if level > 0 {
                for pair in files.windows(2) {
                    if self
                        .icmp
                        .user_comparator()
                        .compare(pair[0].largest.user_key(), pair[1].smallest.user_key())
                        != std::cmp::Ordering::Less
                    {
                        return Err(Error::corruption(format!(
                            "overlapping files {} and {} at level {}",
                            pair[0].number, pair[1].number, level
                        )));
                    }
                }
            }
            version.set_files(level, files);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{BytewiseComparator, ValueType};
    use tempfile::TempDir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn new_set(dir: &TempDir) -> VersionSet {
        let options = Arc::new(Options::default());
        let cache = Arc::new(TableCache::new(
            dir.path().to_path_buf(),
            options.clone(),
            icmp(),
            None,
        ));
        VersionSet::new(dir.path().to_path_buf(), options, icmp(), cache)
    }

    fn ikey(user_key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(user_key, seq, ValueType::Value)
    }

    #[test]
    fn test_file_number_allocation() {
        let dir = TempDir::new().unwrap();
        let mut set = new_set(&dir);
        assert_eq!(set.new_file_number(), 2);
        assert_eq!(set.new_file_number(), 3);
        set.mark_file_number_used(10);
        assert_eq!(set.new_file_number(), 11);
        set.mark_file_number_used(5);
        assert_eq!(set.new_file_number(), 12);
    }

    #[test]
    fn test_log_and_apply_then_recover() {
        let dir = TempDir::new().unwrap();
        VersionSet::create_new_db(dir.path(), &Options::default()).unwrap();

        {
            let mut set = new_set(&dir);
            assert!(set.recover().unwrap());

            let mut edit = VersionEdit::new();
            let number = set.new_file_number();
            edit.add_file(0, number, 4096, ikey(b"a", 1), ikey(b"m", 9));
            set.set_last_sequence(9);
            set.log_and_apply(&mut edit).unwrap();
            assert_eq!(set.num_level_files(0), 1);

            let mut edit = VersionEdit::new();
            let second = set.new_file_number();
            edit.add_file(1, second, 2048, ikey(b"n", 10), ikey(b"z", 12));
            set.set_last_sequence(12);
            set.log_and_apply(&mut edit).unwrap();
        }

        // Reopen from disk.
        let mut set = new_set(&dir);
        assert!(set.recover().unwrap());
        assert_eq!(set.num_level_files(0), 1);
        assert_eq!(set.num_level_files(1), 1);
        assert_eq!(set.last_sequence(), 12);
        assert!(set.next_file_number > 3);
    }

    #[test]
    fn test_recover_requires_current() {
        let dir = TempDir::new().unwrap();
        let mut set = new_set(&dir);
        assert!(set.recover().is_err());
    }

    #[test]
    fn test_delete_edit_removes_file() {
        let dir = TempDir::new().unwrap();
        VersionSet::create_new_db(dir.path(), &Options::default()).unwrap();
        let mut set = new_set(&dir);
        set.recover().unwrap();

        let number = set.new_file_number();
        let mut edit = VersionEdit::new();
        edit.add_file(2, number, 4096, ikey(b"a", 1), ikey(b"m", 2));
        set.log_and_apply(&mut edit).unwrap();
        assert_eq!(set.num_level_files(2), 1);

        let mut edit = VersionEdit::new();
        edit.remove_file(2, number);
        set.log_and_apply(&mut edit).unwrap();
        assert_eq!(set.num_level_files(2), 0);
    }

    #[test]
    fn test_builder_rejects_overlap() {
        let dir = TempDir::new().unwrap();
        VersionSet::create_new_db(dir.path(), &Options::default()).unwrap();
        let mut set = new_set(&dir);
        set.recover().unwrap();

        let first = set.new_file_number();
        let second = set.new_file_number();
        let mut edit = VersionEdit::new();
        edit.add_file(1, first, 4096, ikey(b"a", 1), ikey(b"m", 2));
        edit.add_file(1, second, 4096, ikey(b"k", 3), ikey(b"z", 4));
        assert!(set.log_and_apply(&mut edit).is_err());
    }

    #[test]
    fn test_live_files_tracks_pinned_versions() {
        let dir = TempDir::new().unwrap();
        VersionSet::create_new_db(dir.path(), &Options::default()).unwrap();
        let mut set = new_set(&dir);
        set.recover().unwrap();

        let number = set.new_file_number();
        let mut edit = VersionEdit::new();
        edit.add_file(0, number, 4096, ikey(b"a", 1), ikey(b"m", 2));
        set.log_and_apply(&mut edit).unwrap();

        // Pin the version holding the file, then delete the file.
        let pinned = set.current().clone();
        let mut edit = VersionEdit::new();
        edit.remove_file(0, number);
        set.log_and_apply(&mut edit).unwrap();

        assert!(set.live_files().contains(&number));
        drop(pinned);
        assert!(!set.live_files().contains(&number));
    }

    #[test]
    fn test_pick_compaction_on_full_level0() {
        let dir = TempDir::new().unwrap();
        VersionSet::create_new_db(dir.path(), &Options::default()).unwrap();
        let mut set = new_set(&dir);
        set.recover().unwrap();

        let mut edit = VersionEdit::new();
        for i in 0..4u64 {
            let number = set.new_file_number();
            edit.add_file(
                0,
                number,
                1 << 20,
                ikey(b"a", i * 10 + 1),
                ikey(b"m", i * 10 + 5),
            );
        }
        set.log_and_apply(&mut edit).unwrap();
        assert!(set.needs_compaction());

        let compaction = set.pick_compaction().expect("level 0 is due");
        assert_eq!(compaction.level(), 0);
        // All four overlapping level-0 files participate.
        assert_eq!(compaction.num_input_files(0), 4);
    }

    #[test]
    fn test_boundary_inputs_pull_in_split_user_key() {
        let files: Vec<Arc<FileMetaData>> = vec![
            Arc::new(FileMetaData::new(10, 100, ikey(b"a", 9), ikey(b"k", 5))),
            // Same user key "k" continues at an older sequence in file 11.
            Arc::new(FileMetaData::new(11, 100, ikey(b"k", 3), ikey(b"p", 2))),
            Arc::new(FileMetaData::new(12, 100, ikey(b"q", 8), ikey(b"z", 1))),
        ];
        let mut inputs = vec![files[0].clone()];
        add_boundary_inputs(&icmp(), &files, &mut inputs);
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![10, 11]);
    }
}
