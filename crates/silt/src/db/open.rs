//! Opening a database: locking, catalog recovery, write-ahead log replay,
//! and engine startup.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};

use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use silt_sstable::filter::FilterPolicy;
use silt_sstable::table::{BlockCache, TableBuildOptions, TableBuilder, TableReadOptions};
use silt_vfs::{Filesystem, WritableFile as _};

use crate::config::{DEFAULT_BLOCK_CACHE_BYTES, TABLE_CACHE_HEADROOM};
use crate::error::{Error, Result};
use crate::filenames::{DbFile, set_current_file};
use crate::format::{InternalFilterPolicy, InternalKey, InternalKeyComparator, SequenceNumber};
use crate::memtable::Memtable;
use crate::options::Options;
use crate::snapshot::SnapshotList;
use crate::table_cache::TableCache;
use crate::version::{VersionEdit, VersionSet};
use crate::wal::{LogReader, LogWriter};
use crate::write_batch::WriteBatch;
use super::write::apply_batch_to_memtable;
use super::{Db, DbInner, DbState};


impl<FS: Filesystem> Db<FS> {
    /// Open (or create, per `options`) the database at `path`.
    pub fn open(fs: FS, path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let options = Arc::new(options);
        let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));

        if options.create_if_missing {
            fs.create_dir_all(&db_path)?;
        }

        let lock_path = DbFile::Lock.path_in(&db_path);
        let mut lockfile = Some(fs.lock(&lock_path)?);

        let result = open_locked(&fs, &db_path, &options, &icmp, &mut lockfile);
        if result.is_err() {
            if let Some(lock) = lockfile.take() {
                let _ = fs.unlock(lock);
            }
        }
        result
    }
}

fn open_locked<FS: Filesystem>(
    fs:       &FS,
    db_path:  &Path,
    options:  &Arc<Options>,
    icmp:     &InternalKeyComparator,
    lockfile: &mut Option<FS::Lockfile>,
) -> Result<Db<FS>> {
    let current_path = DbFile::Current.path_in(db_path);
    let current_exists = fs.exists(&current_path)?;

    if !current_exists {
        if !options.create_if_missing {
            return Err(Error::not_found(format!(
                "{}: database does not exist (create_if_missing is false)",
                db_path.display(),
            )));
        }
        create_empty_db(fs, db_path, options)?;
    } else if options.error_if_exists {
        return Err(Error::invalid_argument(format!(
            "{}: database already exists (error_if_exists is true)",
            db_path.display(),
        )));
    }

    let block_cache = options
        .block_cache
        .clone()
        .unwrap_or_else(|| Arc::new(BlockCache::new(DEFAULT_BLOCK_CACHE_BYTES)));
    let table_read_opts = TableReadOptions {
        cmp: Arc::new(icmp.clone()),
        filter_policy: internal_filter_policy(options),
        block_cache: Some(block_cache),
        paranoid_checks: options.paranoid_checks,
    };
    let table_cache = Arc::new(TableCache::new(
        fs.clone(),
        db_path.to_path_buf(),
        table_read_opts,
        options.max_open_files.saturating_sub(TABLE_CACHE_HEADROOM).max(1),
    ));

    let mut versions = VersionSet::new(
        fs.clone(),
        db_path.to_path_buf(),
        Arc::clone(options),
        icmp.clone(),
    );
    let mut save_manifest = versions.recover()?;

    verify_table_files_exist(fs, db_path, &mut versions)?;

    // Replay every log at or after the catalog's log number (plus the
    // previous log, if a memtable switch was mid-flight at the crash).
    let min_log = versions.log_number();
    let prev_log = versions.prev_log_number();
    let mut log_numbers: Vec<u64> = fs
        .children(db_path)?
        .into_iter()
        .filter_map(|child| match DbFile::parse(&child) {
            Some(DbFile::Log(number)) if number >= min_log || number == prev_log => Some(number),
            _ => None,
        })
        .collect();
    log_numbers.sort_unstable();

    let mut edit = VersionEdit::new();
    let mut max_sequence = versions.last_sequence();
    let mut reused: Option<ReusedLog<FS>> = None;

    for (index, &log_number) in log_numbers.iter().enumerate() {
        let is_last = index == log_numbers.len() - 1;
        let replay = replay_log_file(
            fs,
            db_path,
            options,
            icmp,
            &mut versions,
            &mut edit,
            log_number,
            is_last,
        )?;

        versions.mark_file_number_used(log_number);
        if replay.max_sequence > max_sequence {
            max_sequence = replay.max_sequence;
        }
        if replay.wrote_tables {
            save_manifest = true;
        }
        reused = replay.reused;
    }
    versions.set_last_sequence(max_sequence);

    // Settle on a live log + memtable: the reused one, or a fresh pair.
    let (wal, log_file_number, mem) = match reused {
        Some(reused) => {
            info!(log = reused.log_number, "reusing write-ahead log");
            (reused.writer, reused.log_number, reused.mem)
        }
        None => {
            let log_number = versions.new_file_number();
            let log_path = DbFile::Log(log_number).path_in(db_path);
            let file = fs.open_writable(&log_path)?;
            (
                LogWriter::new(file),
                log_number,
                Arc::new(Memtable::new(icmp.clone())),
            )
        }
    };

    let (background_tx, background_rx) = crossbeam_channel::unbounded();

    let inner = Arc::new(DbInner {
        fs: fs.clone(),
        db_path: db_path.to_path_buf(),
        options: Arc::clone(options),
        icmp: icmp.clone(),
        table_cache,
        state: Mutex::new(DbState {
            mem,
            imm: None,
            wal: Some(wal),
            log_file_number,
            versions,
            snapshots: SnapshotList::new(),
            pending_outputs: std::collections::HashSet::new(),
            writers: std::collections::VecDeque::new(),
            group_scratch: WriteBatch::new(),
            background_compaction_scheduled: false,
            background_error: None,
            manual_compaction: None,
            stats: Default::default(),
            db_lock: lockfile.take(),
        }),
        background_work_finished: Condvar::new(),
        background_tx,
        shutting_down: AtomicBool::new(false),
        has_imm: AtomicBool::new(false),
        iterator_seed: AtomicU64::new(1),
        manual_compaction_id: AtomicU64::new(1),
    });

    {
        let mut state = inner.state.lock();
        if save_manifest {
            edit.prev_log_number = Some(0);
            edit.log_number = Some(state.log_file_number);
            inner.log_and_apply(&mut state, edit)?;
        }
        inner.delete_obsolete_files(&mut state);
        inner.maybe_schedule_compaction(&mut state);
    }

    let thread_inner = Arc::clone(&inner);
    std::thread::Builder::new()
        .name("silt-background".to_owned())
        .spawn(move || super::background::background_thread_main(thread_inner, background_rx))
        .map_err(|err| Error::io(format!("cannot spawn background thread: {err}")))?;

    info!(path = %db_path.display(), "database opened");
    Ok(Db { inner })
}

/// The reusable tail log discovered during replay (`reuse_logs` only).
struct ReusedLog<FS: Filesystem> {
    log_number: u64,
    writer:     LogWriter<FS::WritableFile>,
    mem:        Arc<Memtable>,
}

struct LogReplay<FS: Filesystem> {
    max_sequence: SequenceNumber,
    wrote_tables: bool,
    reused:       Option<ReusedLog<FS>>,
}

/// Replay one write-ahead log into a memtable, spilling to level-0 tables
/// whenever the memtable fills. With `reuse_logs`, a cleanly read final log
/// is handed back still-live instead of being flushed.
fn replay_log_file<FS: Filesystem>(
    fs:          &FS,
    db_path:     &Path,
    options:     &Arc<Options>,
    icmp:        &InternalKeyComparator,
    versions:    &mut VersionSet<FS>,
    edit:        &mut VersionEdit,
    log_number:  u64,
    is_last_log: bool,
) -> Result<LogReplay<FS>> {
    let log_path = DbFile::Log(log_number).path_in(db_path);
    let file = fs.open_sequential(&log_path)?;

    let mut dropped_bytes = 0_usize;
    let mut first_corruption: Option<String> = None;
    let mut reader = LogReader::new(file, |bytes: usize, reason: &str| {
        warn!(log = log_number, bytes, reason, "log corruption during replay");
        dropped_bytes += bytes;
        if first_corruption.is_none() {
            first_corruption = Some(reason.to_owned());
        }
    });

    let mut mem: Option<Arc<Memtable>> = None;
    let mut max_sequence = SequenceNumber::ZERO;
    let mut wrote_tables = false;

    while let Some(record) = reader.read_record() {
        let batch = WriteBatch::from_contents(&record)?;
        let batch_start = batch.sequence();

        let memtable = mem.get_or_insert_with(|| Arc::new(Memtable::new(icmp.clone())));
        apply_batch_to_memtable(&batch, batch_start, memtable)?;

        let last = SequenceNumber(batch_start.0 + u64::from(batch.count()).saturating_sub(1));
        if last > max_sequence {
            max_sequence = last;
        }

        if memtable.approximate_memory_usage() > options.write_buffer_size {
            let memtable = mem.take().expect("just inserted");
            flush_recovered_memtable(fs, db_path, options, icmp, versions, edit, &memtable)?;
            wrote_tables = true;
        }
    }
    drop(reader);

    if let Some(reason) = first_corruption {
        if options.paranoid_checks {
            return Err(Error::corruption(format!(
                "log {log_number}: {reason} ({dropped_bytes} bytes dropped)",
            )));
        }
        info!(
            log = log_number,
            dropped_bytes, "ignoring log tail corruption (paranoid checks off)",
        );
    }

    // The final log can stay live: its memtable was not spilled and its
    // contents were read cleanly, so appending continues where it left off.
    let mut reused = None;
    if options.reuse_logs && is_last_log && !wrote_tables && dropped_bytes == 0 {
        let size = fs.size_of(&log_path)?;
        let append = fs.open_appendable(&log_path)?;
        reused = Some(ReusedLog {
            log_number,
            writer: LogWriter::with_offset(append, size),
            mem: mem
                .take()
                .unwrap_or_else(|| Arc::new(Memtable::new(icmp.clone()))),
        });
    }

    if let Some(memtable) = mem {
        if !memtable.is_empty() {
            flush_recovered_memtable(fs, db_path, options, icmp, versions, edit, &memtable)?;
            wrote_tables = true;
        }
    }

    Ok(LogReplay {
        max_sequence,
        wrote_tables,
        reused,
    })
}

/// Write a recovered memtable as one level-0 table, recording it in `edit`.
fn flush_recovered_memtable<FS: Filesystem>(
    fs:       &FS,
    db_path:  &Path,
    options:  &Arc<Options>,
    icmp:     &InternalKeyComparator,
    versions: &mut VersionSet<FS>,
    edit:     &mut VersionEdit,
    mem:      &Memtable,
) -> Result<()> {
    let number = versions.new_file_number();
    match build_table_from_memtable(fs, db_path, options, icmp, number, mem)? {
        Some((file_size, smallest, largest)) => {
            info!(file = number, size = file_size, "recovered log flushed to level 0");
            edit.add_file(0, number, file_size, smallest, largest);
        }
        None => versions.reuse_file_number(number),
    }
    Ok(())
}

/// Build one table file from a memtable. Shared by recovery, repair, and
/// the background flusher.
pub(crate) fn build_table_from_memtable<FS: Filesystem>(
    fs:      &FS,
    db_path: &Path,
    options: &Options,
    icmp:    &InternalKeyComparator,
    number:  u64,
    mem:     &Memtable,
) -> Result<Option<(u64, InternalKey, InternalKey)>> {
    use crate::iter::InternalIterator as _;

    let mut iter = mem.iter();
    iter.seek_to_first();
    if !iter.valid() {
        return Ok(None);
    }

    let path = DbFile::Table(number).path_in(db_path);
    let result = (|| {
        let file = fs.open_writable(&path)?;
        let mut builder = TableBuilder::new(build_options(options, icmp), file);

        let smallest = InternalKey(iter.key().to_vec());
        let mut largest = Vec::new();
        while iter.valid() {
            largest.clear();
            largest.extend_from_slice(iter.key());
            builder.add(iter.key(), iter.value())?;
            iter.next();
        }

        let (mut file, file_size) = builder.finish()?;
        file.sync_data()?;
        drop(file);
        Ok(Some((file_size, smallest, InternalKey(largest))))
    })();

    if result.is_err() {
        let _ = fs.delete(&path);
    }
    result
}

/// Table-building options derived from the database options.
pub(super) fn build_options(options: &Options, icmp: &InternalKeyComparator) -> TableBuildOptions {
    TableBuildOptions {
        cmp: Arc::new(icmp.clone()),
        filter_policy: options.filter_policy.clone().map(|user_policy| {
            Arc::new(InternalFilterPolicy { user_policy }) as Arc<dyn FilterPolicy>
        }),
        compression: options.compression,
        block_size: options.block_size,
        block_restart_interval: options.block_restart_interval,
    }
}

fn internal_filter_policy(options: &Options) -> Option<Arc<dyn FilterPolicy>> {
    options.filter_policy.clone().map(|user_policy| {
        Arc::new(InternalFilterPolicy { user_policy }) as Arc<dyn FilterPolicy>
    })
}

impl<FS: Filesystem> DbInner<FS> {
    pub(crate) fn table_build_options(&self) -> TableBuildOptions {
        build_options(&self.options, &self.icmp)
    }
}

/// Every table the recovered catalog references must exist on disk.
fn verify_table_files_exist<FS: Filesystem>(
    fs:       &FS,
    db_path:  &Path,
    versions: &mut VersionSet<FS>,
) -> Result<()> {
    for number in versions.live_files() {
        let primary = DbFile::Table(number).path_in(db_path);
        let legacy = DbFile::LegacyTable(number).path_in(db_path);
        let found = fs.exists(&primary).unwrap_or(false) || fs.exists(&legacy).unwrap_or(false);
        if !found {
            return Err(Error::corruption(format!(
                "catalog references missing table file {number:06}",
            )));
        }
    }
    Ok(())
}

/// Write the initial catalog of a brand-new database: `MANIFEST-1` with an
/// empty snapshot, pointed at by `CURRENT`.
fn create_empty_db<FS: Filesystem>(fs: &FS, db_path: &Path, options: &Options) -> Result<()> {
    let mut edit = VersionEdit::new();
    edit.comparator_name = Some(options.comparator.name().to_owned());
    edit.log_number = Some(0);
    edit.next_file_number = Some(2);
    edit.last_sequence = Some(SequenceNumber::ZERO);

    let manifest_path = DbFile::Manifest(1).path_in(db_path);
    let result = (|| {
        let file = fs.open_writable(&manifest_path)?;
        let mut writer = LogWriter::new(file);
        let mut record = Vec::new();
        edit.encode(&mut record);
        writer.add_record(&record)?;
        writer.sync()?;
        drop(writer);
        set_current_file(fs, db_path, 1)
    })();

    if result.is_err() {
        let _ = fs.delete(&manifest_path);
    }
    result
}
