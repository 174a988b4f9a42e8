//! The database orchestrator: ties the write path, read path, background
//! compaction, recovery and file garbage collection together.

pub mod filename;
mod iter;

pub use iter::DbIterator;

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::batch::WriteBatch;
use crate::config::{
    Options, ReadOptions, WriteOptions, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER,
    NUM_LEVELS,
};
use crate::compaction::Compaction;
use crate::error::{Error, Result};
use crate::iterator::{KvIter, MergingIter};
use crate::key::{
    Comparator, InternalKey, InternalKeyComparator, LookupKey, MAX_SEQUENCE_NUMBER,
    VALUE_TYPE_FOR_SEEK, ValueType,
};
use crate::memtable::{LookupResult, MemTable};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::sstable::reader::BlockCache;
use crate::sstable::TableBuilder;
use crate::table_cache::TableCache;
use crate::version::edit::VersionEdit;
use crate::version::set::VersionSet;
use crate::version::Version;
use crate::wal::{CorruptionReporter, LogReader, LogWriter};
use filename::{
    lock_file_name, log_file_name, parse_file_name, table_file_name, FileType,
};

// Upper bound on a group-committed batch; small writes may only grow by
// 128 KiB so their latency stays low.
const MAX_WRITE_GROUP_BYTES: usize = 1 << 20;
const SMALL_WRITE_BYTES: usize = 128 << 10;

/// One queued writer, parked until its batch is committed (possibly by the
/// writer at the front of the queue).
struct Writer {
    batch: Mutex<Option<WriteBatch>>,
    sync: bool,
    // `force_rotate` writers carry no batch and just want room made.
    force_rotate: bool,
    done: AtomicBool,
    result: Mutex<Option<Result<()>>>,
}

impl Writer {
    fn new(batch: Option<WriteBatch>, sync: bool) -> Arc<Self> {
        Arc::new(Self {
            force_rotate: batch.is_none(),
            batch: Mutex::new(batch),
            sync,
            done: AtomicBool::new(false),
            result: Mutex::new(None),
        })
    }

    fn finish(&self, result: Result<()>) {
        *self.result.lock() = Some(result);
        self.done.store(true, AtomicOrdering::Release);
    }
}

/// A manual compaction request being fed through the background thread.
struct ManualCompaction {
    id: u64,
    level: usize,
    done: bool,
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
}

/// Per-level compaction counters, kept for the stats string.
#[derive(Default, Clone, Copy)]
struct CompactionStats {
    micros: u64,
    bytes_read: u64,
    bytes_written: u64,
}

/// Everything guarded by the single DB-wide mutex.
struct DbState {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    wal: Option<LogWriter>,
    log_file_number: u64,
    versions: VersionSet,
    writers: VecDeque<Arc<Writer>>,
    snapshots: SnapshotList,
    pending_outputs: HashSet<u64>,
    bg_error: Option<Error>,
    background_compaction_scheduled: bool,
    shutting_down: bool,
    manual_compaction: Option<ManualCompaction>,
    next_manual_id: u64,
    stats: [CompactionStats; NUM_LEVELS],
}

/// Shared core of a database handle.
pub(crate) struct DbInner {
    dbname: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    state: Mutex<DbState>,
    // Signalled when a background task completes.
    background_work_finished: Condvar,
    // Wakes the background thread.
    background_work_available: Condvar,
    // Wakes queued writers.
    writers_available: Condvar,
    // Mirrors of mutex-guarded flags for lock-free checks inside the
    // compaction loop.
    shutting_down: AtomicBool,
    has_imm: AtomicBool,
}

/// The database handle.
///
/// ```rust,no_run
/// use siltdb::{DB, Options};
///
/// # fn main() -> Result<(), siltdb::Error> {
/// let db = DB::open("./data", Options::new().create_if_missing(true))?;
/// db.put(b"key", b"value")?;
/// assert_eq!(db.get(b"key")?, Some(b"value".to_vec()));
/// db.delete(b"key")?;
/// # Ok(())
/// # }
/// ```
///
/// A `DB` is internally synchronised: share it across threads with `Arc`.
/// Dropping the handle waits for background work and releases the lock file.
pub struct DB {
    inner: Arc<DbInner>,
    background_thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DB").finish_non_exhaustive()
    }
}

impl DB {
    /// Opens (and if configured, creates) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<DB> {
        options.validate()?;
        let options = Arc::new(options);
        let dbname = path.as_ref().to_path_buf();

        std::fs::create_dir_all(&dbname)?;
        lock_database(&dbname)?;
        let unlock_on_error = UnlockOnDrop { dbname: dbname.clone() };

        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let block_cache = if options.block_cache_size > 0 {
            Some(Arc::new(BlockCache::new(options.block_cache_size)))
        } else {
            None
        };
        let table_cache = Arc::new(TableCache::new(
            dbname.clone(),
            options.clone(),
            icmp.clone(),
            block_cache,
        ));
        let mut versions =
            VersionSet::new(dbname.clone(), options.clone(), icmp.clone(), table_cache.clone());

        if !VersionSet::db_exists(&dbname) {
            if !options.create_if_missing {
                return Err(Error::invalid_argument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    dbname.display()
                )));
            }
            log::info!("creating database {}", dbname.display());
            VersionSet::create_new_db(&dbname, &options)?;
        } else if options.error_if_exists {
            return Err(Error::invalid_argument(format!(
                "{}: exists (error_if_exists is true)",
                dbname.display()
            )));
        }

        versions.recover()?;

        // Replay every WAL newer than the manifest knows about.
        let mut edit = VersionEdit::new();
        let mut max_sequence = 0;
        let min_log = versions.log_number();
        let prev_log = versions.prev_log_number();
        let mut wal_numbers: Vec<u64> = std::fs::read_dir(&dbname)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(parse_file_name))
            .filter(|(file_type, number)| {
                *file_type == FileType::Log && (*number >= min_log || *number == prev_log)
            })
            .map(|(_, number)| number)
            .collect();
        wal_numbers.sort_unstable();
        for number in wal_numbers {
            versions.mark_file_number_used(number);
            replay_wal(&dbname, &options, &icmp, &mut versions, &mut edit, number, &mut max_sequence)?;
        }
        if versions.last_sequence() < max_sequence {
            versions.set_last_sequence(max_sequence);
        }

        // Fresh WAL and memtable; consolidate recovery into the manifest.
        let new_log_number = versions.new_file_number();
        let wal_file = File::create(log_file_name(&dbname, new_log_number))?;
        edit.set_prev_log_number(0);
        edit.set_log_number(new_log_number);
        versions.log_and_apply(&mut edit)?;

        let state = DbState {
            mem: Arc::new(MemTable::new()),
            imm: None,
            wal: Some(LogWriter::new(wal_file)),
            log_file_number: new_log_number,
            versions,
            writers: VecDeque::new(),
            snapshots: SnapshotList::default(),
            pending_outputs: HashSet::new(),
            bg_error: None,
            background_compaction_scheduled: false,
            shutting_down: false,
            manual_compaction: None,
            next_manual_id: 1,
            stats: [CompactionStats::default(); NUM_LEVELS],
        };
        let inner = Arc::new(DbInner {
            dbname,
            options,
            icmp,
            table_cache,
            state: Mutex::new(state),
            background_work_finished: Condvar::new(),
            background_work_available: Condvar::new(),
            writers_available: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
        });

        let thread_inner = inner.clone();
        let background_thread =
            std::thread::Builder::new().name("siltdb-compact".to_string()).spawn(move || {
                background_thread_main(thread_inner);
            })?;

        {
            let mut state = inner.state.lock();
            inner.delete_obsolete_files(&mut state);
            inner.maybe_schedule_compaction(&mut state);
        }

        std::mem::forget(unlock_on_error);
        Ok(DB { inner, background_thread: Some(background_thread) })
    }

    /// Inserts `key` -> `value`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_opt(&WriteOptions::default(), key, value)
    }

    /// Inserts with explicit write options.
    pub fn put_opt(&self, write_options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(write_options, batch)
    }

    /// Removes `key` (by writing a tombstone).
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.delete_opt(&WriteOptions::default(), key)
    }

    /// Removes with explicit write options.
    pub fn delete_opt(&self, write_options: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(write_options, batch)
    }

    /// Applies `batch` atomically.
    pub fn write(&self, write_options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write_internal(write_options, Some(batch))
    }

    /// Reads the latest value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_opt(&ReadOptions::new(), key)
    }

    /// Reads with explicit read options (snapshot, checksum verification).
    pub fn get_opt(&self, read_options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = &self.inner;
        let (sequence, mem, imm, current) = {
            let state = inner.state.lock();
            let sequence = match &read_options.snapshot {
                Some(snapshot) => snapshot.sequence(),
                None => state.versions.last_sequence(),
            };
            (sequence, state.mem.clone(), state.imm.clone(), state.versions.current().clone())
        };

        let lookup = LookupKey::new(key, sequence);
        match mem.get(&lookup) {
            LookupResult::Found(value) => return Ok(Some(value.to_vec())),
            LookupResult::Deleted => return Ok(None),
            LookupResult::Missing => {}
        }
        if let Some(imm) = imm {
            match imm.get(&lookup) {
                LookupResult::Found(value) => return Ok(Some(value.to_vec())),
                LookupResult::Deleted => return Ok(None),
                LookupResult::Missing => {}
            }
        }

        let (value, stats) = current.get(read_options, &lookup, &inner.table_cache)?;
        if current.update_stats(stats) {
            let mut state = inner.state.lock();
            inner.maybe_schedule_compaction(&mut state);
        }
        Ok(value.map(|v| v.to_vec()))
    }

    /// Takes a snapshot of the current state for repeatable reads.
    pub fn snapshot(&self) -> Snapshot {
        let mut state = self.inner.state.lock();
        let sequence = state.versions.last_sequence();
        state.snapshots.pin(sequence)
    }

    /// Returns an iterator over the database (or over a snapshot given in
    /// `read_options`).
    pub fn iter(&self, read_options: &ReadOptions) -> Result<DbIterator> {
        let inner = &self.inner;
        let state = inner.state.lock();
        let sequence = match &read_options.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => state.versions.last_sequence(),
        };

        let current = state.versions.current().clone();
        let mut children: Vec<Box<dyn KvIter>> = Vec::new();
        children.push(Box::new(state.mem.iter()));
        if let Some(imm) = &state.imm {
            children.push(Box::new(imm.iter()));
        }
        children.extend(current.iters(read_options, inner.table_cache.clone())?);
        drop(state);

        let cmp: Arc<dyn Comparator> = Arc::new(inner.icmp.clone());
        let merging = MergingIter::new(cmp, children);
        Ok(DbIterator::new(inner.clone(), current, inner.icmp.clone(), merging, sequence))
    }

    /// Flushes the active memtable to a level-0 table and waits for it.
    pub fn flush(&self) -> Result<()> {
        // Force a rotation, then wait until the immutable memtable drains.
        self.inner.write_internal(&WriteOptions::default(), None)?;
        let inner = &self.inner;
        let mut state = inner.state.lock();
        while state.imm.is_some() && state.bg_error.is_none() {
            inner.background_work_finished.wait(&mut state);
        }
        match &state.bg_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Compacts the key range `[begin, end]` (whole database when both are
    /// `None`) all the way down, waiting for completion.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        // Deepest level with any overlap bounds the work.
        let max_level = {
            let state = self.inner.state.lock();
            let current = state.versions.current();
            let mut max_level = 1;
            for level in 1..NUM_LEVELS {
                if current.overlap_in_level(level, begin, end) {
                    max_level = level;
                }
            }
            max_level
        };

        self.flush()?;
        for level in 0..max_level {
            self.manual_compact_level(level, begin, end)?;
        }
        Ok(())
    }

    fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let begin_key =
            begin.map(|key| InternalKey::new(key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK));
        let end_key = end.map(|key| InternalKey::new(key, 0, ValueType::Deletion));

        enum Step {
            Install,
            WaitOther,
            WaitMine,
            Finished,
        }

        let inner = &self.inner;
        let mut my_id = None;
        let mut state = inner.state.lock();
        loop {
            if let Some(err) = &state.bg_error {
                return Err(err.clone());
            }
            if state.shutting_down {
                return Err(Error::not_supported("database is shutting down"));
            }

            let step = match (&state.manual_compaction, my_id) {
                (Some(manual), Some(id)) if manual.id == id => {
                    if manual.done {
                        Step::Finished
                    } else {
                        Step::WaitMine
                    }
                }
                (Some(_), _) => Step::WaitOther,
                (None, _) => Step::Install,
            };

            match step {
                Step::Finished => {
                    state.manual_compaction = None;
                    return Ok(());
                }
                Step::WaitMine => {
                    inner.maybe_schedule_compaction(&mut state);
                    inner.background_work_finished.wait(&mut state);
                }
                Step::WaitOther => {
                    // Someone else's manual compaction is in flight.
                    inner.background_work_finished.wait(&mut state);
                }
                Step::Install => {
                    let id = state.next_manual_id;
                    state.next_manual_id += 1;
                    state.manual_compaction = Some(ManualCompaction {
                        id,
                        level,
                        done: false,
                        begin: begin_key.clone(),
                        end: end_key.clone(),
                    });
                    my_id = Some(id);
                    inner.maybe_schedule_compaction(&mut state);
                }
            }
        }
    }

    /// Number of table files at `level`, for introspection and tests.
    pub fn num_files_at_level(&self, level: usize) -> usize {
        self.inner.state.lock().versions.num_level_files(level)
    }

    /// A human-readable per-level summary of files and compaction totals.
    pub fn stats_string(&self) -> String {
        let state = self.inner.state.lock();
        let mut out = String::from("level  files  bytes   read(MB)  written(MB)\n");
        for level in 0..NUM_LEVELS {
            let files = state.versions.num_level_files(level);
            let bytes = state.versions.num_level_bytes(level);
            let stats = &state.stats[level];
            if files > 0 || stats.micros > 0 {
                out.push_str(&format!(
                    "{:5}  {:5}  {:6}  {:8.1}  {:10.1}\n",
                    level,
                    files,
                    bytes,
                    stats.bytes_read as f64 / (1 << 20) as f64,
                    stats.bytes_written as f64 / (1 << 20) as f64,
                ));
            }
        }
        out
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            self.inner.shutting_down.store(true, AtomicOrdering::Release);
            self.inner.background_work_available.notify_all();
        }
        if let Some(handle) = self.background_thread.take() {
            let _ = handle.join();
        }
        unlock_database(&self.inner.dbname);
    }
}

impl DbInner {
    /// The serialised write path: queue up, group-commit at the front.
    fn write_internal(&self, write_options: &WriteOptions, batch: Option<WriteBatch>) -> Result<()> {
        let writer = Writer::new(batch, write_options.sync);

        let mut state = self.state.lock();
        state.writers.push_back(writer.clone());
        while !writer.done.load(AtomicOrdering::Acquire)
            && !state.writers.front().map(|w| Arc::ptr_eq(w, &writer)).unwrap_or(false)
        {
            self.writers_available.wait(&mut state);
        }
        if writer.done.load(AtomicOrdering::Acquire) {
            return writer.result.lock().take().expect("completed writer has a result");
        }

        // This writer leads the queue and commits for a whole group.
        let mut status = self.make_room_for_write(&mut state, writer.force_rotate);
        let mut group: Vec<Arc<Writer>> = vec![writer.clone()];

        if status.is_ok() && !writer.force_rotate {
            let mut batch = writer.batch.lock().take().expect("front writer owns its batch");
            self.build_write_group(&state, &writer, &mut batch, &mut group);

            let last_sequence = state.versions.last_sequence();
            batch.set_sequence(last_sequence + 1);
            let count = batch.count() as u64;
            let sync = group.iter().any(|w| w.sync);

            // Release the mutex during the WAL append and memtable insert:
            // only the front writer can be here.
            let mut wal = state.wal.take().expect("wal present outside rotation");
            let mem = state.mem.clone();
            let mut wal_error = false;
            MutexGuard::unlocked(&mut state, || {
                status = wal.add_record(batch.contents());
                if status.is_err() {
                    wal_error = true;
                }
                if status.is_ok() && sync {
                    status = wal.sync();
                    if status.is_err() {
                        wal_error = true;
                    }
                }
                if status.is_ok() {
                    status = batch.insert_into(&mem);
                }
            });
            state.wal = Some(wal);
            if wal_error {
                // The WAL tail state is indeterminate: poison the database.
                self.record_background_error(&mut state, status.clone().unwrap_err());
            }
            if status.is_ok() {
                state.versions.set_last_sequence(last_sequence + count);
            }
        }

        for member in &group {
            state.writers.pop_front();
            if !Arc::ptr_eq(member, &writer) {
                member.finish(status.clone());
            }
        }
        self.writers_available.notify_all();
        status
    }

    /// Folds queued writers into the front writer's batch, bounded in size
    /// and never upgrading a non-sync group to include a sync writer.
    fn build_write_group(
        &self,
        state: &DbState,
        front: &Arc<Writer>,
        batch: &mut WriteBatch,
        group: &mut Vec<Arc<Writer>>,
    ) {
        let mut budget = MAX_WRITE_GROUP_BYTES;
        let size = batch.approximate_size();
        if size <= SMALL_WRITE_BYTES {
            budget = size + SMALL_WRITE_BYTES;
        }

        let mut total = size;
        for candidate in state.writers.iter().skip(1) {
            if candidate.sync && !front.sync {
                // Folding a sync write into a non-sync commit would skip its
                // fsync.
                break;
            }
            if candidate.force_rotate {
                break;
            }
            let candidate_batch = candidate.batch.lock().take().expect("queued writer has batch");
            total += candidate_batch.approximate_size();
            if total > budget {
                // Put it back; it will lead its own group.
                *candidate.batch.lock() = Some(candidate_batch);
                break;
            }
            batch.append(&candidate_batch);
            group.push(candidate.clone());
        }
    }

    /// Blocks (or rotates the memtable) until the write path may proceed.
    fn make_room_for_write(&self, state: &mut MutexGuard<'_, DbState>, force: bool) -> Result<()> {
        let mut force = force;
        let mut allow_delay = !force;
        loop {
            if let Some(err) = &state.bg_error {
                return Err(err.clone());
            }
            if allow_delay
                && state.versions.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER
            {
                // Back off once to let the compactor gain ground, instead of
                // stalling this writer for seconds later.
                MutexGuard::unlocked(state, || {
                    std::thread::sleep(Duration::from_millis(1));
                });
                allow_delay = false;
                continue;
            }
            if !force
                && state.mem.approximate_memory_usage() <= self.options.write_buffer_size
            {
                return Ok(());
            }
            if state.imm.is_some() {
                log::debug!("current memtable full; waiting for flush");
                self.background_work_finished.wait(state);
                continue;
            }
            if state.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
                log::debug!("too many level-0 files; waiting");
                self.background_work_finished.wait(state);
                continue;
            }

            // Rotate: new WAL, freeze the memtable, wake the compactor.
            let new_log_number = state.versions.new_file_number();
            let file = File::create(log_file_name(&self.dbname, new_log_number))?;
            state.wal = Some(LogWriter::new(file));
            state.log_file_number = new_log_number;
            let full = std::mem::replace(&mut state.mem, Arc::new(MemTable::new()));
            state.imm = Some(full);
            self.has_imm.store(true, AtomicOrdering::Release);
            self.maybe_schedule_compaction(state);
            force = false;
        }
    }

    /// Coalesces schedule requests into at most one queued background task.
    fn maybe_schedule_compaction(&self, state: &mut DbState) {
        if state.background_compaction_scheduled
            || state.shutting_down
            || state.bg_error.is_some()
        {
            return;
        }
        if state.imm.is_none()
            && state.manual_compaction.is_none()
            && !state.versions.needs_compaction()
        {
            return;
        }
        state.background_compaction_scheduled = true;
        self.background_work_available.notify_one();
    }

    fn record_background_error(&self, state: &mut DbState, err: Error) {
        if state.bg_error.is_none() {
            log::error!("background error (sticky): {}", err);
            state.bg_error = Some(err);
        }
        self.background_work_finished.notify_all();
    }

    /// One background work unit: a memtable flush, a manual compaction step,
    /// or a picked compaction.
    fn background_compaction(&self, state: &mut MutexGuard<'_, DbState>) {
        if state.imm.is_some() {
            self.compact_mem_table(state);
            return;
        }

        let state_ref: &mut DbState = &mut *state;
        let is_manual = state_ref.manual_compaction.is_some();
        let compaction = if let Some(manual) = state_ref.manual_compaction.as_mut() {
            let compaction = state_ref.versions.compact_range(
                manual.level,
                manual.begin.as_ref(),
                manual.end.as_ref(),
            );
            manual.done = compaction.is_none();
            log::info!(
                "manual compaction at level {} ({} more work after this)",
                manual.level,
                if manual.done { "no" } else { "possibly" },
            );
            compaction
        } else {
            state_ref.versions.pick_compaction()
        };

        let mut manual_end: Option<InternalKey> = None;
        let mut status = Ok(());
        match compaction {
            None => {}
            Some(mut compaction) if !is_manual && compaction.is_trivial_move() => {
                let file = compaction.input(0, 0).clone();
                let level = compaction.level();
                let edit = compaction.edit_mut();
                edit.remove_file(level, file.number);
                edit.add_file(
                    level + 1,
                    file.number,
                    file.file_size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
                status = state.versions.log_and_apply(&mut compaction.edit);
                log::info!(
                    "moved {:06} ({} bytes) to level {}: {}",
                    file.number,
                    file.file_size,
                    level + 1,
                    state.versions.level_summary()
                );
            }
            Some(mut compaction) => {
                if is_manual {
                    // Remember how far this pass reaches so the request can
                    // resume after it.
                    let (_, limit) = compaction.internal_key_range(&self.icmp);
                    manual_end = limit;
                }
                status = self.do_compaction_work(state, &mut compaction);
                drop(compaction);
                self.delete_obsolete_files(state);
            }
        }

        match status {
            Ok(()) => {}
            Err(err) => {
                if !state.shutting_down {
                    self.record_background_error(state, err);
                }
            }
        }

        if is_manual {
            let state_ref: &mut DbState = &mut *state;
            let had_error = state_ref.bg_error.is_some();
            let manual = state_ref.manual_compaction.as_mut().expect("manual still installed");
            if had_error {
                manual.done = true;
            }
            if !manual.done {
                // Only part of the range was compacted; resume after it.
                manual.begin = manual_end;
            }
        }
    }

    /// Flushes the immutable memtable into a level-0 table.
    fn compact_mem_table(&self, state: &mut MutexGuard<'_, DbState>) {
        let imm = state.imm.clone().expect("immutable memtable present");
        let mut edit = VersionEdit::new();
        let base = state.versions.current().clone();

        let mut status = self.write_level0_table(state, &imm, &mut edit, Some(&base));
        drop(base);

        if status.is_ok() && state.shutting_down {
            status = Err(Error::not_supported("deleting DB during memtable flush"));
        }
        if status.is_ok() {
            edit.set_prev_log_number(0);
            // Earlier logs are no longer needed.
            edit.set_log_number(state.log_file_number);
            status = state.versions.log_and_apply(&mut edit);
        }

        match status {
            Ok(()) => {
                state.imm = None;
                self.has_imm.store(false, AtomicOrdering::Release);
                self.delete_obsolete_files(state);
            }
            Err(err) => {
                self.record_background_error(state, err);
            }
        }
    }

    /// Builds one table from `mem` and records it in `edit`, placed at the
    /// deepest level it does not conflict with.
    fn write_level0_table(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
        base: Option<&Arc<Version>>,
    ) -> Result<()> {
        let start = std::time::Instant::now();
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        log::info!("level-0 table {:06}: started", number);

        let dbname = self.dbname.clone();
        let options = self.options.clone();
        let icmp = self.icmp.clone();
        let mem = mem.clone();
        let mut built = Ok(None);
        MutexGuard::unlocked(state, || {
            built = build_table(&dbname, &options, &icmp, number, &mut mem.iter());
        });

        state.pending_outputs.remove(&number);
        match built {
            Ok(Some((file_size, smallest, largest))) => {
                log::info!("level-0 table {:06}: {} bytes", number, file_size);
                let level = match base {
                    Some(base) => base
                        .pick_level_for_memtable_output(smallest.user_key(), largest.user_key()),
                    None => 0,
                };
                edit.add_file(level, number, file_size, smallest, largest);
                let stats = &mut state.stats[level];
                stats.micros += start.elapsed().as_micros() as u64;
                stats.bytes_written += file_size;
                Ok(())
            }
            Ok(None) => {
                // Empty memtable: nothing was written, no file was created.
                Ok(())
            }
            Err(err) => {
                log::warn!("level-0 table {:06}: build failed: {}", number, err);
                let _ = std::fs::remove_file(table_file_name(&self.dbname, number));
                Err(err)
            }
        }
    }

    /// The main compaction merge: walks the inputs in internal-key order,
    /// drops shadowed versions and obsolete tombstones, and writes bounded
    /// output files.
    fn do_compaction_work(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        compaction: &mut Compaction,
    ) -> Result<()> {
        let start = std::time::Instant::now();
        log::info!(
            "compacting {}@{} + {}@{} files",
            compaction.num_input_files(0),
            compaction.level(),
            compaction.num_input_files(1),
            compaction.level() + 1,
        );

        // Records below every live snapshot can be collapsed.
        let smallest_snapshot = match state.snapshots.smallest() {
            Some(sequence) => sequence,
            None => state.versions.last_sequence(),
        };

        let mut input = state.versions.make_input_iterator(compaction)?;
        let level = compaction.level();
        let icmp = self.icmp.clone();

        let mut outputs: Vec<(u64, u64, InternalKey, InternalKey)> = Vec::new();
        let mut work_status: Result<()> = Ok(());
        let mut bytes_read = 0u64;
        for which in 0..2 {
            for i in 0..compaction.num_input_files(which) {
                bytes_read += compaction.input(which, i).file_size;
            }
        }

        MutexGuard::unlocked(state, || {
            work_status = self.compaction_merge_loop(
                compaction,
                &mut input,
                &icmp,
                smallest_snapshot,
                &mut outputs,
            );
        });

        if work_status.is_ok() && state.shutting_down {
            work_status = Err(Error::not_supported("deleting DB during compaction"));
        }
        if work_status.is_ok() {
            work_status = input.status();
        }
        drop(input);

        let bytes_written: u64 = outputs.iter().map(|(_, size, _, _)| size).sum();
        let stats = &mut state.stats[level + 1];
        stats.micros += start.elapsed().as_micros() as u64;
        stats.bytes_read += bytes_read;
        stats.bytes_written += bytes_written;

        if work_status.is_ok() {
            compaction.add_input_deletions();
            for (number, file_size, smallest, largest) in &outputs {
                compaction.edit_mut().add_file(
                    level + 1,
                    *number,
                    *file_size,
                    smallest.clone(),
                    largest.clone(),
                );
            }
            work_status = state.versions.log_and_apply(&mut compaction.edit);
        }

        for (number, _, _, _) in &outputs {
            state.pending_outputs.remove(number);
        }
        if work_status.is_err() {
            // Failed outputs are unreferenced; GC will remove them once the
            // error clears on reopen.
            for (number, _, _, _) in &outputs {
                let _ = std::fs::remove_file(table_file_name(&self.dbname, *number));
            }
        }

        log::info!("compacted to: {}", state.versions.level_summary());
        work_status
    }

    /// The mutex-free part of a compaction: merge, drop, and write outputs.
    /// Reacquires the mutex briefly for file-number allocation and to give
    /// an immutable memtable priority.
    fn compaction_merge_loop(
        &self,
        compaction: &mut Compaction,
        input: &mut MergingIter,
        icmp: &InternalKeyComparator,
        smallest_snapshot: u64,
        outputs: &mut Vec<(u64, u64, InternalKey, InternalKey)>,
    ) -> Result<()> {
        let mut builder: Option<(u64, TableBuilder, InternalKey)> = None;
        let mut last_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = MAX_SEQUENCE_NUMBER;

        let finish_output = |builder: Option<(u64, TableBuilder, InternalKey)>,
                             outputs: &mut Vec<(u64, u64, InternalKey, InternalKey)>,
                             current_largest: &Option<InternalKey>|
         -> Result<()> {
            if let Some((number, table_builder, smallest)) = builder {
                let largest = current_largest.clone().expect("output has at least one key");
                let file_size = table_builder.finish()?;
                outputs.push((number, file_size, smallest, largest));
                log::info!("generated table {:06}: {} bytes", number, file_size);
            }
            Ok(())
        };

        let mut current_largest: Option<InternalKey> = None;
        input.seek_to_first();
        while input.valid() {
            if self.shutting_down.load(AtomicOrdering::Acquire) {
                break;
            }

            // An arriving memtable flush outranks compaction work.
            if self.has_imm.load(AtomicOrdering::Acquire) {
                let mut state = self.state.lock();
                if state.imm.is_some() {
                    self.compact_mem_table(&mut state);
                    self.background_work_finished.notify_all();
                }
            }

            let key = input.key().to_vec();
            if compaction.should_stop_before(&key, icmp) && builder.is_some() {
                finish_output(builder.take(), outputs, &current_largest)?;
            }

            // Decide whether this version of the key survives.
            let mut drop_entry = false;
            match crate::key::parse_internal_key(&key) {
                Err(_) => {
                    // Keep corrupt keys so the damage stays visible.
                    last_user_key = None;
                    last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                }
                Ok(parsed) => {
                    let first_occurrence = last_user_key
                        .as_deref()
                        .map(|last| {
                            icmp.user_comparator().compare(last, parsed.user_key)
                                != std::cmp::Ordering::Equal
                        })
                        .unwrap_or(true);
                    if first_occurrence {
                        last_user_key = Some(parsed.user_key.to_vec());
                        last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    }

                    if last_sequence_for_key <= smallest_snapshot {
                        // Shadowed by a newer version every reader can see.
                        drop_entry = true;
                    } else if parsed.value_type == ValueType::Deletion
                        && parsed.sequence <= smallest_snapshot
                        && compaction.is_base_level_for_key(parsed.user_key, icmp)
                    {
                        // Obsolete tombstone: no deeper level holds the key,
                        // and no snapshot can observe the deletion itself.
                        drop_entry = true;
                    }
                    last_sequence_for_key = parsed.sequence;
                }
            }

            if !drop_entry {
                if builder.is_none() {
                    let number = {
                        let mut state = self.state.lock();
                        let number = state.versions.new_file_number();
                        state.pending_outputs.insert(number);
                        number
                    };
                    let file = File::create(table_file_name(&self.dbname, number))?;
                    let table_builder =
                        TableBuilder::new(self.options.clone(), icmp.clone(), file);
                    let smallest = InternalKey::decode(&key)?;
                    builder = Some((number, table_builder, smallest));
                }
                let (_, table_builder, _) = builder.as_mut().expect("just opened");
                table_builder.add(&key, input.value())?;
                current_largest = Some(InternalKey::decode(&key)?);

                if table_builder.file_size() >= compaction.max_output_file_size() {
                    finish_output(builder.take(), outputs, &current_largest)?;
                }
            }

            input.next();
        }

        if self.shutting_down.load(AtomicOrdering::Acquire) {
            if let Some((number, table_builder, _)) = builder.take() {
                table_builder.abandon();
                let _ = std::fs::remove_file(table_file_name(&self.dbname, number));
            }
            return Err(Error::not_supported("deleting DB during compaction"));
        }

        finish_output(builder.take(), outputs, &current_largest)?;
        Ok(())
    }

    /// Removes files no longer referenced by any version, the WAL chain, or
    /// the pending compaction outputs.
    fn delete_obsolete_files(&self, state: &mut MutexGuard<'_, DbState>) {
        if state.bg_error.is_some() {
            // The version state may be wrong; deleting now could lose data.
            return;
        }

        let state_ref: &mut DbState = &mut *state;
        let mut live = state_ref.versions.live_files();
        live.extend(state_ref.pending_outputs.iter().copied());
        let log_number = state_ref.versions.log_number();
        let prev_log_number = state_ref.versions.prev_log_number();
        let manifest_number = state_ref.versions.manifest_file_number();

        let entries = match std::fs::read_dir(&self.dbname) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("cannot list {}: {}", self.dbname.display(), err);
                return;
            }
        };

        let mut to_delete: Vec<(PathBuf, FileType, u64)> = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((file_type, number)) = parse_file_name(name) else { continue };
            let keep = match file_type {
                FileType::Log => number >= log_number || number == prev_log_number,
                FileType::Descriptor => number >= manifest_number,
                FileType::Table => live.contains(&number),
                FileType::Temp => live.contains(&number),
                FileType::Current | FileType::DbLock => true,
            };
            if !keep {
                if file_type == FileType::Table {
                    self.table_cache.evict(number);
                }
                log::info!("deleting obsolete {:?} file {:06}", file_type, number);
                to_delete.push((entry.path(), file_type, number));
            }
        }

        // The actual unlinks do not need the mutex.
        MutexGuard::unlocked(state, || {
            for (path, _, _) in to_delete {
                if let Err(err) = std::fs::remove_file(&path) {
                    log::warn!("delete of {} failed: {}", path.display(), err);
                }
            }
        });
    }

    /// Charges a sampled read against `version`; schedules a compaction
    /// when a file exhausts its allowance.
    pub(crate) fn record_read_sample(&self, version: &Version, internal_key: &[u8]) {
        if version.record_read_sample(internal_key) {
            let mut state = self.state.lock();
            self.maybe_schedule_compaction(&mut state);
        }
    }
}

/// Body of the dedicated background thread: runs one task at a time.
fn background_thread_main(inner: Arc<DbInner>) {
    let mut state = inner.state.lock();
    loop {
        while !state.shutting_down && !state.background_compaction_scheduled {
            inner.background_work_available.wait(&mut state);
        }
        if state.shutting_down {
            break;
        }

        inner.background_compaction(&mut state);
        state.background_compaction_scheduled = false;

        // The last pass may have left more to do (e.g. cascading levels).
        inner.maybe_schedule_compaction(&mut state);
        inner.background_work_finished.notify_all();
    }
    state.background_compaction_scheduled = false;
    inner.background_work_finished.notify_all();
}

/// Writes the contents of `iter` into table file `number`. Returns `None`
/// without creating the file when the iterator is empty.
fn build_table(
    dbname: &Path,
    options: &Arc<Options>,
    icmp: &InternalKeyComparator,
    number: u64,
    iter: &mut dyn KvIter,
) -> Result<Option<(u64, InternalKey, InternalKey)>> {
    let path = table_file_name(dbname, number);
    iter.seek_to_first();
    if !iter.valid() {
        return Ok(None);
    }

    let file = File::create(&path)?;
    let mut builder = TableBuilder::new(options.clone(), icmp.clone(), file);
    let smallest = InternalKey::decode(iter.key())?;
    let mut largest = smallest.clone();
    while iter.valid() {
        largest = InternalKey::decode(iter.key())?;
        builder.add(iter.key(), iter.value())?;
        iter.next();
    }
    iter.status()?;

    let file_size = builder.finish()?;
    debug_assert!(file_size > 0);
    Ok(Some((file_size, smallest, largest)))
}

/// Replays one WAL into level-0 tables during open.
fn replay_wal(
    dbname: &Path,
    options: &Arc<Options>,
    icmp: &InternalKeyComparator,
    versions: &mut VersionSet,
    edit: &mut VersionEdit,
    number: u64,
    max_sequence: &mut u64,
) -> Result<()> {
    let path = log_file_name(dbname, number);
    let file = File::open(&path)?;
    log::info!("recovering log {:06}", number);

    let paranoid = options.paranoid_checks;
    let mut damage: Option<String> = None;
    let mut mem: Option<Arc<MemTable>> = None;

    {
        let reporter: CorruptionReporter<'_> = Box::new(|bytes, reason| {
            log::warn!("log {:06} corruption ({} bytes): {}", number, bytes, reason);
            damage.get_or_insert_with(|| reason.to_string());
        });
        let mut reader = LogReader::new(file, true, Some(reporter));

        while let Some(record) = reader.read_record() {
            if record.len() < 12 {
                log::warn!("log {:06}: record smaller than a batch header", number);
                continue;
            }
            let batch = WriteBatch::from_contents(record)?;
            let mem_ref = mem.get_or_insert_with(|| Arc::new(MemTable::new()));
            batch.insert_into(mem_ref)?;

            let last = batch.sequence() + batch.count() as u64 - 1;
            if last > *max_sequence {
                *max_sequence = last;
            }

            if mem_ref.approximate_memory_usage() > options.write_buffer_size {
                let full = mem.take().expect("memtable present");
                let table_number = versions.new_file_number();
                if let Some((file_size, smallest, largest)) =
                    build_table(dbname, options, icmp, table_number, &mut full.iter())?
                {
                    edit.add_file(0, table_number, file_size, smallest, largest);
                }
            }
        }
    }

    if paranoid {
        if let Some(reason) = damage {
            return Err(Error::corruption(format!("log {:06} damaged: {}", number, reason)));
        }
    }

    if let Some(full) = mem {
        let table_number = versions.new_file_number();
        if let Some((file_size, smallest, largest)) =
            build_table(dbname, options, icmp, table_number, &mut full.iter())?
        {
            edit.add_file(0, table_number, file_size, smallest, largest);
        }
    }
    Ok(())
}

// In-process registry of locked database directories, alongside the LOCK
// file on disk. One process cannot open the same database twice.
static LOCKED_DBS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

fn lock_database(dbname: &Path) -> Result<()> {
    // Hold the on-disk marker open for the database's lifetime.
    let _ = File::create(lock_file_name(dbname))?;
    let canonical = dbname.canonicalize()?;
    let mut locked = LOCKED_DBS.get_or_init(|| Mutex::new(HashSet::new())).lock();
    if !locked.insert(canonical) {
        return Err(Error::invalid_argument(format!(
            "{}: already open in this process",
            dbname.display()
        )));
    }
    Ok(())
}

fn unlock_database(dbname: &Path) {
    if let Ok(canonical) = dbname.canonicalize() {
        if let Some(locked) = LOCKED_DBS.get() {
            locked.lock().remove(&canonical);
        }
    }
}

struct UnlockOnDrop {
    dbname: PathBuf,
}

impl Drop for UnlockOnDrop {
    fn drop(&mut self) {
        unlock_database(&self.dbname);
    }
}
