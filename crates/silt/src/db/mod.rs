//! The database façade and its shared state.
//!
//! One mutex ([`DbInner::state`]) guards all mutable catalog state: the
//! memtables, the writer queue, the version set, snapshot list, and
//! compaction bookkeeping. One background thread per database performs
//! flushes and compactions, woken over a channel and reporting completion
//! through [`DbInner::background_work_finished`]. Long I/O (WAL appends,
//! MANIFEST writes, table builds) happens with the mutex released.

mod background;
mod open;
mod write;

pub(crate) use self::open::build_table_from_memtable;
pub(crate) use self::write::apply_batch_to_memtable;

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrder};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{error, info, warn};

use silt_vfs::{Filesystem, StdFs};

use crate::compaction::CompactionStats;
use crate::config::NUM_LEVELS;
use crate::error::{Error, Result};
use crate::filenames::DbFile;
use crate::format::{InternalKey, InternalKeyComparator, LookupKey, SequenceNumber, ValueType};
use crate::iter::{InternalIterator, LevelIter, MergingIterator};
use crate::memtable::Memtable;
use crate::options::{Options, ReadOptions, WriteOptions};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::table_cache::TableCache;
use crate::version::VersionSet;
use crate::wal::LogWriter;
use crate::write_batch::WriteBatch;
use crate::db_iter::DbIterator;

use self::write::PendingWriter;


/// An open database handle. Cheap to clone; all clones share one engine.
///
/// The generic parameter selects the filesystem; tests run whole databases
/// against [`MemFs`](silt_vfs::MemFs).
#[derive(Clone)]
pub struct Db<FS: Filesystem = StdFs> {
    inner: Arc<DbInner<FS>>,
}

/// A request for the background thread.
pub(crate) enum BackgroundTask {
    /// Wake up and look for work (a scheduled flush or compaction).
    Work,
    /// Finish up and exit the thread.
    Shutdown,
}

pub(crate) struct DbInner<FS: Filesystem> {
    pub(crate) fs:          FS,
    pub(crate) db_path:     PathBuf,
    pub(crate) options:     Arc<Options>,
    pub(crate) icmp:        InternalKeyComparator,
    pub(crate) table_cache: Arc<TableCache<FS>>,

    pub(crate) state: Mutex<DbState<FS>>,
    /// Signaled when the background thread finishes a round of work, and
    /// when writers should re-check room. Tied to [`DbInner::state`].
    pub(crate) background_work_finished: Condvar,
    pub(crate) background_tx: Sender<BackgroundTask>,

    pub(crate) shutting_down: AtomicBool,
    /// Mirror of `state.imm.is_some()`, so the compaction loop can notice a
    /// sealed memtable without taking the mutex per entry.
    pub(crate) has_imm: AtomicBool,
    /// Seeds for per-iterator sampling RNGs.
    iterator_seed: AtomicU64,
    /// Distinguishes concurrent `compact_range` requests.
    pub(crate) manual_compaction_id: AtomicU64,
}

/// Everything guarded by the database mutex.
pub(crate) struct DbState<FS: Filesystem> {
    pub(crate) mem: Arc<Memtable>,
    /// The sealed memtable being (or about to be) flushed.
    pub(crate) imm: Option<Arc<Memtable>>,

    /// The live write-ahead log. `None` only transiently, while the writer
    /// at the head of the queue appends with the mutex released.
    pub(crate) wal:             Option<LogWriter<FS::WritableFile>>,
    pub(crate) log_file_number: u64,

    pub(crate) versions:  VersionSet<FS>,
    pub(crate) snapshots: SnapshotList,

    /// Output files of in-flight flushes/compactions; protected from
    /// obsolete-file collection until their edit lands (or they abort).
    pub(crate) pending_outputs: HashSet<u64>,

    pub(crate) writers: VecDeque<PendingWriter>,
    /// Scratch batch for group commits, kept for its allocation.
    pub(crate) group_scratch: WriteBatch,

    pub(crate) background_compaction_scheduled: bool,
    /// A failed WAL append or MANIFEST write poisons all future writes
    /// until the database is reopened.
    pub(crate) background_error: Option<Error>,

    pub(crate) manual_compaction: Option<ManualCompaction>,

    pub(crate) stats: [CompactionStats; NUM_LEVELS],

    /// Held for the lifetime of the open database.
    pub(crate) db_lock: Option<FS::Lockfile>,
}

/// A `compact_range` request being serviced by the background thread, one
/// level at a time, possibly in several picker rounds.
#[derive(Debug)]
pub(crate) struct ManualCompaction {
    pub(crate) id:    u64,
    pub(crate) level: usize,
    pub(crate) done:  bool,
    pub(crate) begin: Option<InternalKey>,
    pub(crate) end:   Option<InternalKey>,
}

impl<FS: Filesystem> Db<FS> {
    /// Read the value for `key`, at `read_opts.snapshot` if given, else the
    /// most recent state.
    pub fn get(&self, read_opts: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = &self.inner;

        let (sequence, mem, imm, version) = {
            let state = inner.state.lock();
            let sequence = match &read_opts.snapshot {
                Some(snapshot) => snapshot.sequence(),
                None => state.versions.last_sequence(),
            };
            (
                sequence,
                Arc::clone(&state.mem),
                state.imm.clone(),
                state.versions.current(),
            )
        };

        let lookup = LookupKey::new(key, sequence);

        // Memtables first (newest data), then the current version's files.
        let mut outcome = mem.get(&lookup);
        if outcome.is_none() {
            if let Some(imm) = &imm {
                outcome = imm.get(&lookup);
            }
        }

        if let Some(found) = outcome {
            return match found {
                Some(value) => Ok(Some(value)),
                None => Ok(None),
            };
        }

        let version_get = version.get(&inner.table_cache, read_opts, &inner.icmp, &lookup)?;

        if let Some((level, file)) = version_get.seek_file {
            if version.charge_seek(level, &file) {
                let mut state = inner.state.lock();
                inner.maybe_schedule_compaction(&mut state);
            }
        }

        Ok(version_get.outcome.flatten())
    }

    /// Insert or overwrite one key.
    pub fn put(&self, write_opts: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(write_opts, batch)
    }

    /// Remove one key (writes a deletion entry; space returns at compaction).
    pub fn delete(&self, write_opts: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(write_opts, batch)
    }

    /// Apply a batch atomically. See the `write` module for the grouping
    /// pipeline.
    pub fn write(&self, write_opts: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write(write_opts, batch)
    }

    /// A stable read view of the current state.
    pub fn snapshot(&self) -> Snapshot {
        let mut state = self.inner.state.lock();
        let sequence = state.versions.last_sequence();
        state.snapshots.acquire(sequence)
    }

    /// Explicitly release a snapshot. Equivalent to dropping every clone of
    /// it; provided for symmetry with [`Db::snapshot`].
    pub fn release_snapshot(&self, snapshot: Snapshot) {
        drop(snapshot);
    }

    /// An iterator over the database at `read_opts.snapshot` (or the state
    /// as of this call). Pins the memtables and table files it reads.
    pub fn iter(&self, read_opts: &ReadOptions) -> DbIterator {
        let inner = &self.inner;
        let state = inner.state.lock();

        let sequence = match &read_opts.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => state.versions.last_sequence(),
        };

        let version = state.versions.current();
        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        children.push(Box::new(state.mem.iter()));
        if let Some(imm) = &state.imm {
            children.push(Box::new(imm.iter()));
        }
        // Level 0: every file separately (they overlap).
        for file in &version.files[0] {
            match inner.table_cache.iter(file.number, file.file_size, read_opts) {
                Ok(table_iter) => children.push(Box::new(table_iter)),
                Err(err) => {
                    // Surface through the iterator status by way of an
                    // always-errored placeholder level.
                    warn!(file = file.number, error = %err, "table unavailable for iterator");
                    children.push(Box::new(LevelIter::new(
                        inner.icmp.clone(),
                        vec![Arc::clone(file)],
                        Arc::clone(&inner.table_cache),
                        read_opts.clone(),
                    )));
                }
            }
        }
        for level in 1..NUM_LEVELS {
            if version.files[level].is_empty() {
                continue;
            }
            children.push(Box::new(LevelIter::new(
                inner.icmp.clone(),
                version.files[level].clone(),
                Arc::clone(&inner.table_cache),
                read_opts.clone(),
            )));
        }
        drop(state);

        let merged = MergingIterator::new(inner.icmp.clone(), children);

        // The sampler pins the version (so its files outlive the iterator)
        // and can wake the background thread when a sample arms compaction.
        let sampled_version = Arc::clone(&version);
        let icmp = inner.icmp.clone();
        let weak_inner = Arc::downgrade(inner);
        let sampler = Box::new(move |internal_key: &[u8]| {
            if sampled_version.record_read_sample(&icmp, internal_key) {
                if let Some(strong) = weak_inner.upgrade() {
                    let mut state = strong.state.lock();
                    strong.maybe_schedule_compaction(&mut state);
                }
            }
        });

        let seed = inner.iterator_seed.fetch_add(1, AtomicOrder::Relaxed);
        DbIterator::new(
            Box::new(merged),
            Arc::clone(&inner.options.comparator),
            sequence,
            sampler,
            seed,
        )
    }

    /// Expose an internal statistic; `None` for unrecognized names.
    ///
    /// Recognized: `silt.num-files-at-level<N>`, `silt.stats`,
    /// `silt.sstables`, `silt.approximate-memory-usage`.
    pub fn property(&self, name: &str) -> Option<String> {
        let name = name.strip_prefix("silt.")?;
        let state = self.inner.state.lock();

        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(state.versions.num_level_files(level).to_string());
        }

        match name {
            "stats" => {
                let mut out = String::from(
                    "                               Compactions\n\
                     Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
                     --------------------------------------------------\n",
                );
                let version = state.versions.current();
                for level in 0..NUM_LEVELS {
                    let files = version.num_files(level);
                    let stats = state.stats[level];
                    if files == 0 && stats.micros == 0 {
                        continue;
                    }
                    out.push_str(&format!(
                        "{:3} {:8} {:8.0} {:9.3} {:8.1} {:9.1}\n",
                        level,
                        files,
                        version.level_bytes(level) as f64 / 1048576.0,
                        stats.micros as f64 / 1e6,
                        stats.bytes_read as f64 / 1048576.0,
                        stats.bytes_written as f64 / 1048576.0,
                    ));
                }
                Some(out)
            }
            "sstables" => {
                let version = state.versions.current();
                let mut out = String::new();
                for level in 0..NUM_LEVELS {
                    out.push_str(&format!("--- level {level} ---\n"));
                    for file in &version.files[level] {
                        out.push_str(&format!(
                            "{}:{}[{:?} .. {:?}]\n",
                            file.number, file.file_size, file.smallest, file.largest,
                        ));
                    }
                }
                Some(out)
            }
            "approximate-memory-usage" => {
                let mut total = state.mem.approximate_memory_usage();
                if let Some(imm) = &state.imm {
                    total += imm.approximate_memory_usage();
                }
                Some(total.to_string())
            }
            _ => None,
        }
    }

    /// Approximate on-disk bytes each `[start, limit)` user-key range
    /// occupies. Unflushed (memtable) data does not count.
    pub fn approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        let state = self.inner.state.lock();
        let version = state.versions.current();

        ranges
            .iter()
            .map(|(start, limit)| {
                let start_key =
                    InternalKey::new(start, SequenceNumber::MAX, ValueType::Value);
                let limit_key =
                    InternalKey::new(limit, SequenceNumber::MAX, ValueType::Value);
                let start_offset = state.versions.approximate_offset_of(
                    &self.inner.table_cache,
                    &version,
                    start_key.as_bytes(),
                );
                let limit_offset = state.versions.approximate_offset_of(
                    &self.inner.table_cache,
                    &version,
                    limit_key.as_bytes(),
                );
                limit_offset.saturating_sub(start_offset)
            })
            .collect()
    }

    /// Compact the user-key range `[begin, end]` (`None` means unbounded on
    /// that side): flush the memtable if it overlaps, then run manual
    /// compactions level by level until the range has been pushed past every
    /// level that overlapped it.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let inner = &self.inner;

        let max_level_with_files = {
            let state = inner.state.lock();
            let version = state.versions.current();
            // At least one pass (level 0 into 1) even when only level 0
            // holds data.
            (1..NUM_LEVELS)
                .filter(|&level| version.overlap_in_level(&inner.icmp, level, begin, end))
                .max()
                .unwrap_or(1)
        };

        // The memtable may hold keys in the range; push them to a table
        // first so the per-level passes below see them.
        inner.flush_memtable()?;

        for level in 0..max_level_with_files {
            inner.manual_compact_level(level, begin, end)?;
        }
        Ok(())
    }

    /// Flush the memtable and wait for the flush to complete. Mostly useful
    /// in tests and before measuring on-disk sizes.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush_memtable()
    }

    /// Close the database: waits for background work to quiesce, stops the
    /// background thread, and releases the directory lock.
    ///
    /// Dropping the last handle closes implicitly (without error reporting).
    pub fn close(self) -> Result<()> {
        self.inner.shutdown();
        Ok(())
    }
}

impl<FS: Filesystem> DbInner<FS> {
    /// Wake the background thread if there is work and none is scheduled.
    pub(crate) fn maybe_schedule_compaction(&self, state: &mut DbState<FS>) {
        if state.background_compaction_scheduled {
            return;
        }
        if self.shutting_down.load(AtomicOrder::Acquire) {
            return;
        }
        if state.background_error.is_some() {
            return;
        }
        let work_waiting = state.imm.is_some()
            || state.manual_compaction.as_ref().is_some_and(|manual| !manual.done)
            || state.versions.needs_compaction();
        if !work_waiting {
            return;
        }

        state.background_compaction_scheduled = true;
        if self.background_tx.send(BackgroundTask::Work).is_err() {
            // The background thread is gone (shutdown race); nothing to do.
            state.background_compaction_scheduled = false;
        }
    }

    /// Latch `err` as the background error, failing all future writes, and
    /// wake anything waiting on background progress.
    pub(crate) fn record_background_error(&self, state: &mut DbState<FS>, err: Error) {
        if state.background_error.is_none() {
            error!(error = %err, "background error; writes are fenced off");
            state.background_error = Some(err);
        }
        self.background_work_finished.notify_all();
    }

    /// Remove files the catalog no longer references. Deletion runs with the
    /// mutex released; the MANIFEST is the truth, so an undeletable file is
    /// merely garbage, never a correctness problem.
    pub(crate) fn delete_obsolete_files(&self, state: &mut MutexGuard<'_, DbState<FS>>) {
        if state.background_error.is_some() {
            // After a background error the catalog may not reflect reality;
            // leave everything in place.
            return;
        }

        let mut live = state.versions.live_files();
        live.extend(state.pending_outputs.iter().copied());
        let log_number = state.versions.log_number();
        let prev_log_number = state.versions.prev_log_number();
        let manifest_number = state.versions.manifest_file_number();

        let Ok(children) = self.fs.children(&self.db_path) else {
            return;
        };

        let mut to_delete = Vec::new();
        for child in children {
            let Some(parsed) = DbFile::parse(&child) else {
                continue;
            };
            let keep = match parsed {
                DbFile::Log(number) => {
                    number >= log_number || number == prev_log_number
                }
                DbFile::Manifest(number) => number >= manifest_number,
                DbFile::Table(number) | DbFile::LegacyTable(number) => live.contains(&number),
                DbFile::Temp(number) => live.contains(&number),
                DbFile::Current | DbFile::Lock | DbFile::InfoLog | DbFile::OldInfoLog => true,
            };
            if keep {
                continue;
            }

            if let DbFile::Table(number) | DbFile::LegacyTable(number) = parsed {
                self.table_cache.evict(number);
            }
            info!(file = %child.display(), "deleting obsolete file");
            to_delete.push(self.db_path.join(child));
        }

        MutexGuard::unlocked(state, || {
            for path in to_delete {
                if let Err(err) = self.fs.delete(&path) {
                    warn!(file = %path.display(), error = %err, "could not delete obsolete file");
                }
            }
        });
    }

    /// Stop the background thread and release the lock file. Idempotent.
    pub(crate) fn shutdown(&self) {
        if self.shutting_down.swap(true, AtomicOrder::SeqCst) {
            return;
        }

        {
            let mut state = self.state.lock();
            while state.background_compaction_scheduled {
                self.background_work_finished.wait(&mut state);
            }
        }
        let _ = self.background_tx.send(BackgroundTask::Shutdown);

        let mut state = self.state.lock();
        if let Some(lockfile) = state.db_lock.take() {
            if let Err(err) = self.fs.unlock(lockfile) {
                warn!(error = %err, "failed to release database lock");
            }
        }
        info!(path = %self.db_path.display(), "database closed");
    }
}

impl<FS: Filesystem> Drop for DbInner<FS> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<FS: Filesystem> std::fmt::Debug for Db<FS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.inner.db_path)
            .finish_non_exhaustive()
    }
}

/// Destroy the database at `path`: delete every file the engine recognizes
/// and then the directory itself (left in place if foreign files remain).
pub fn destroy_db<FS: Filesystem>(fs: &FS, path: &Path) -> Result<()> {
    let children = match fs.children(path) {
        Ok(children) => children,
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let lock_path = DbFile::Lock.path_in(path);
    let lockfile = fs.lock(&lock_path)?;

    let mut result = Ok(());
    for child in children {
        let Some(parsed) = DbFile::parse(&child) else {
            continue;
        };
        if parsed == DbFile::Lock {
            continue;
        }
        if let Err(err) = fs.delete(&path.join(&child)) {
            if result.is_ok() {
                result = Err(err.into());
            }
        }
    }

    let _ = fs.unlock(lockfile);
    let _ = fs.delete(&lock_path);
    result
}
