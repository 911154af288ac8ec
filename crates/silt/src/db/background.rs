//! Background work: memtable flushes and compactions.
//!
//! One thread per database runs [`background_thread_main`]. It wakes when
//! the foreground sends [`BackgroundTask::Work`], performs at most one unit
//! of work (a flush takes priority over a compaction), reschedules itself if
//! more work remains, and broadcasts completion.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Receiver;
use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use silt_sstable::table::TableBuilder;
use silt_vfs::{Filesystem, WritableFile as _};

use crate::compaction::{Compaction, CompactionStats};
use crate::error::{Error, Result};
use crate::filenames::DbFile;
use crate::format::{InternalKey, ParsedInternalKey, SequenceNumber, ValueType};
use crate::iter::{InternalIterator, LevelIter, MergingIterator};
use crate::memtable::Memtable;
use crate::options::ReadOptions;
use crate::version::VersionEdit;
use super::{BackgroundTask, DbInner, DbState, ManualCompaction};


pub(super) fn background_thread_main<FS: Filesystem>(
    inner:    Arc<DbInner<FS>>,
    receiver: Receiver<BackgroundTask>,
) {
    while let Ok(task) = receiver.recv() {
        match task {
            BackgroundTask::Shutdown => break,
            BackgroundTask::Work => inner.background_call(),
        }
    }
    debug!("background thread exiting");
}

impl<FS: Filesystem> DbInner<FS> {
    fn background_call(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.background_compaction_scheduled);

        if !self.shutting_down.load(std::sync::atomic::Ordering::Acquire)
            && state.background_error.is_none()
        {
            self.background_compaction(&mut state);
        }

        state.background_compaction_scheduled = false;
        // The just-finished round may have unblocked more work (e.g. a flush
        // exposed a size-triggered compaction).
        self.maybe_schedule_compaction(&mut state);
        self.background_work_finished.notify_all();
    }

    fn background_compaction(&self, state: &mut MutexGuard<'_, DbState<FS>>) {
        if state.imm.is_some() {
            if let Err(err) = self.compact_memtable(state) {
                self.record_background_error(state, err);
            }
            return;
        }

        // Manual requests preempt the automatic picker.
        let (compaction, is_manual) = {
            let state_ref = &mut **state;
            match &mut state_ref.manual_compaction {
                Some(manual) if !manual.done => {
                    let compaction = state_ref.versions.compact_range(
                        manual.level,
                        manual.begin.as_ref(),
                        manual.end.as_ref(),
                    );
                    if compaction.is_none() {
                        manual.done = true;
                    }
                    (compaction, true)
                }
                _ => (state_ref.versions.pick_compaction(), false),
            }
        };

        let Some(mut compaction) = compaction else {
            return;
        };

        // Where a manual round got to; the next round resumes after it.
        let manual_progress = compaction
            .inputs[0]
            .iter()
            .map(|file| &file.largest)
            .max_by(|a, b| {
                use silt_sstable::Comparator as _;
                self.icmp.cmp(a.as_bytes(), b.as_bytes())
            })
            .cloned();

        let result = if !is_manual && compaction.is_trivial_move() {
            self.apply_trivial_move(state, &mut compaction)
        } else {
            let result = self.do_compaction_work(state, &mut compaction);
            self.delete_obsolete_files(state);
            result
        };

        if let Err(err) = &result {
            if self.shutting_down.load(std::sync::atomic::Ordering::Acquire) {
                // Expected noise while tearing down.
            } else {
                self.record_background_error(state, err.clone());
            }
        }

        if is_manual {
            if let Some(manual) = &mut state.manual_compaction {
                if result.is_err() {
                    // Give up on the rest of the range.
                    manual.done = true;
                } else if !manual.done {
                    // This round covered everything up to `manual_progress`.
                    manual.begin = manual_progress;
                }
            }
        }
    }

    /// Move a single input file one level down without rewriting it.
    fn apply_trivial_move(
        &self,
        state:      &mut MutexGuard<'_, DbState<FS>>,
        compaction: &mut Compaction,
    ) -> Result<()> {
        let file = Arc::clone(&compaction.inputs[0][0]);
        let level = compaction.level;

        compaction.edit.delete_file(level, file.number);
        compaction.edit.add_file(
            level + 1,
            file.number,
            file.file_size,
            file.smallest.clone(),
            file.largest.clone(),
        );
        let edit = std::mem::take(&mut compaction.edit);
        let result = self.log_and_apply(state, edit);

        if result.is_ok() {
            info!(
                file = file.number,
                from = level,
                to = level + 1,
                size = file.file_size,
                "trivial move",
            );
        }
        result
    }

    /// Flush the sealed memtable into a level-0 (or pushed-down) table and
    /// retire its log.
    pub(super) fn compact_memtable(
        &self,
        state: &mut MutexGuard<'_, DbState<FS>>,
    ) -> Result<()> {
        let imm = state.imm.clone().expect("compact_memtable requires a sealed memtable");
        let base = state.versions.current();

        let mut edit = VersionEdit::new();
        let file = self.write_table(state, &imm, Some(&*base))?;
        if let Some((level, number, file_size, smallest, largest)) = file {
            edit.add_file(level, number, file_size, smallest, largest);
        }

        if self.shutting_down.load(std::sync::atomic::Ordering::Acquire) {
            return Err(Error::io("shutting down during memtable flush"));
        }

        // The flushed data is durable in the table; its log (and any older
        // one) is no longer needed.
        edit.prev_log_number = Some(0);
        edit.log_number = Some(state.log_file_number);
        self.log_and_apply(state, edit)?;

        state.imm = None;
        self.has_imm.store(false, std::sync::atomic::Ordering::Release);
        self.delete_obsolete_files(state);
        Ok(())
    }

    /// Build one table file from `mem` (with the mutex released) and decide
    /// its level. `None` when the memtable was empty.
    fn write_table(
        &self,
        state: &mut MutexGuard<'_, DbState<FS>>,
        mem:   &Memtable,
        base:  Option<&crate::version::Version>,
    ) -> Result<Option<(usize, u64, u64, InternalKey, InternalKey)>> {
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        let started = Instant::now();
        info!(file = number, "memtable flush started");

        let build_result = MutexGuard::unlocked(state, || self.build_table(number, mem));

        state.pending_outputs.remove(&number);

        let built = match build_result {
            Ok(built) => built,
            Err(err) => {
                warn!(file = number, error = %err, "memtable flush failed");
                return Err(err);
            }
        };
        let Some((file_size, smallest, largest)) = built else {
            state.versions.reuse_file_number(number);
            return Ok(None);
        };

        let level = match base {
            Some(base) => base.pick_level_for_memtable_output(
                &self.icmp,
                self.options.max_file_size,
                smallest.user_key(),
                largest.user_key(),
            ),
            None => 0,
        };

        let stats = CompactionStats {
            micros:        started.elapsed().as_micros() as u64,
            bytes_read:    0,
            bytes_written: file_size,
        };
        state.stats[level].add(&stats);
        info!(file = number, size = file_size, level, "memtable flush finished");

        Ok(Some((level, number, file_size, smallest, largest)))
    }

    /// Write all of `mem` into table file `number`. Runs without the mutex.
    fn build_table(
        &self,
        number: u64,
        mem:    &Memtable,
    ) -> Result<Option<(u64, InternalKey, InternalKey)>> {
        super::open::build_table_from_memtable(
            &self.fs,
            &self.db_path,
            &self.options,
            &self.icmp,
            number,
            mem,
        )
    }

    /// Merge the compaction inputs, collapse per-key history below the
    /// snapshot horizon, write the outputs, and install the edit.
    fn do_compaction_work(
        &self,
        state:      &mut MutexGuard<'_, DbState<FS>>,
        compaction: &mut Compaction,
    ) -> Result<()> {
        let started = Instant::now();
        info!(
            level = compaction.level,
            inputs = compaction.num_input_files(0),
            next_level_inputs = compaction.num_input_files(1),
            "compaction started",
        );

        // Entries still visible to the oldest live snapshot must survive.
        let smallest_snapshot = state
            .snapshots
            .oldest()
            .unwrap_or_else(|| state.versions.last_sequence());

        let mut input = self.compaction_input_iterator(compaction);
        let mut outputs = CompactionOutputs::new();

        let merge_result = MutexGuard::unlocked(state, || {
            self.merge_compaction_inputs(
                compaction,
                &mut input,
                &mut outputs,
                smallest_snapshot,
            )
        });
        drop(input);

        // Whatever happened, stop protecting the outputs; on success they
        // are in the edit (and the catalog) before the next deletion pass.
        let stats = CompactionStats {
            micros: started.elapsed().as_micros() as u64,
            bytes_read: compaction.inputs.iter().flatten().map(|f| f.file_size).sum(),
            bytes_written: outputs.finished.iter().map(|out| out.file_size).sum(),
        };
        state.stats[compaction.level + 1].add(&stats);

        let result = merge_result.and_then(|()| {
            self.install_compaction_results(state, compaction, &outputs)
        });

        for output in &outputs.finished {
            state.pending_outputs.remove(&output.number);
        }

        match &result {
            Ok(()) => {
                info!(
                    level = compaction.level,
                    outputs = outputs.finished.len(),
                    bytes = stats.bytes_written,
                    summary = %state.versions.current().level_summary(),
                    "compaction finished",
                );
            }
            Err(err) => {
                warn!(level = compaction.level, error = %err, "compaction failed");
                // Orphaned output files are collected by the next
                // delete_obsolete_files pass.
            }
        }
        result
    }

    /// The merge loop proper. Runs without the database mutex, taking it
    /// briefly to allocate output numbers and to prioritize memtable
    /// flushes.
    fn merge_compaction_inputs(
        &self,
        compaction:        &mut Compaction,
        input:             &mut MergingIterator,
        outputs:           &mut CompactionOutputs<FS>,
        smallest_snapshot: SequenceNumber,
    ) -> Result<()> {
        input.seek_to_first();

        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = SequenceNumber::MAX;

        while input.valid() {
            if self.shutting_down.load(std::sync::atomic::Ordering::Acquire) {
                return Err(Error::io("shutting down during compaction"));
            }

            // A writer may be stalled on a sealed memtable; flushing it is
            // always more urgent than compaction progress.
            if self.has_imm.load(std::sync::atomic::Ordering::Acquire) {
                let mut state = self.state.lock();
                if state.imm.is_some() {
                    if let Err(err) = self.compact_memtable(&mut state) {
                        self.record_background_error(&mut state, err);
                    }
                    self.background_work_finished.notify_all();
                }
            }

            let key = input.key();

            if outputs.builder.is_some() && compaction.should_stop_before(&self.icmp, key) {
                outputs.finish_current()?;
            }

            // Decide whether this entry is needed by anyone.
            let mut drop_entry = false;
            match ParsedInternalKey::decode(key) {
                Err(_) => {
                    // Carry corruption through to the output rather than
                    // silently hiding it.
                    current_user_key = None;
                    last_sequence_for_key = SequenceNumber::MAX;
                }
                Ok(parsed) => {
                    let first_occurrence = current_user_key
                        .as_deref()
                        .is_none_or(|current| {
                            self.icmp.cmp_user(parsed.user_key, current)
                                != std::cmp::Ordering::Equal
                        });
                    if first_occurrence {
                        current_user_key = Some(parsed.user_key.to_vec());
                        last_sequence_for_key = SequenceNumber::MAX;
                    }

                    if last_sequence_for_key <= smallest_snapshot {
                        // A newer entry for this key at or below the horizon
                        // already made it out; this one is invisible.
                        drop_entry = true;
                    } else if parsed.value_type == ValueType::Deletion
                        && parsed.sequence <= smallest_snapshot
                        && compaction.is_base_level_for_key(&self.icmp, parsed.user_key)
                    {
                        // A tombstone with nothing left to shadow.
                        drop_entry = true;
                    }
                    last_sequence_for_key = parsed.sequence;
                }
            }

            if !drop_entry {
                if outputs.builder.is_none() {
                    let number = {
                        let mut state = self.state.lock();
                        let number = state.versions.new_file_number();
                        state.pending_outputs.insert(number);
                        number
                    };
                    outputs.open(self, number)?;
                }
                outputs.add(key, input.value())?;
                if outputs.current_size() >= compaction.max_output_file_size() {
                    outputs.finish_current()?;
                }
            }

            input.next();
        }

        input.status()?;
        if outputs.builder.is_some() {
            outputs.finish_current()?;
        }
        Ok(())
    }

    /// One merged stream over all input files, reading around the cache.
    fn compaction_input_iterator(&self, compaction: &Compaction) -> MergingIterator {
        let read_opts = ReadOptions {
            verify_checksums: self.options.paranoid_checks,
            fill_cache:       false,
            snapshot:         None,
        };

        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        for (which, files) in compaction.inputs.iter().enumerate() {
            if files.is_empty() {
                continue;
            }
            if compaction.level == 0 && which == 0 {
                // Level-0 inputs overlap; each file iterates on its own.
                for file in files {
                    match self.table_cache.iter(file.number, file.file_size, &read_opts) {
                        Ok(iter) => children.push(Box::new(iter)),
                        Err(_) => {
                            // Let the level iterator rediscover the error so
                            // it surfaces through `status`.
                            children.push(Box::new(LevelIter::new(
                                self.icmp.clone(),
                                vec![Arc::clone(file)],
                                Arc::clone(&self.table_cache),
                                read_opts.clone(),
                            )));
                        }
                    }
                }
            } else {
                children.push(Box::new(LevelIter::new(
                    self.icmp.clone(),
                    files.clone(),
                    Arc::clone(&self.table_cache),
                    read_opts.clone(),
                )));
            }
        }
        MergingIterator::new(self.icmp.clone(), children)
    }

    fn install_compaction_results(
        &self,
        state:      &mut MutexGuard<'_, DbState<FS>>,
        compaction: &mut Compaction,
        outputs:    &CompactionOutputs<FS>,
    ) -> Result<()> {
        compaction.add_input_deletions();
        let output_level = compaction.level + 1;
        for output in &outputs.finished {
            compaction.edit.add_file(
                output_level,
                output.number,
                output.file_size,
                output.smallest.clone(),
                output.largest.clone(),
            );
        }
        let edit = std::mem::take(&mut compaction.edit);
        self.log_and_apply(state, edit)
    }

    /// Apply an edit: build the successor version, write the MANIFEST record
    /// with the mutex released, and promote on success.
    ///
    /// A failed MANIFEST write is latched as the background error *here*,
    /// before anyone can run an obsolete-file sweep against a catalog whose
    /// on-disk half no longer matches.
    pub(crate) fn log_and_apply(
        &self,
        state: &mut MutexGuard<'_, DbState<FS>>,
        edit:  VersionEdit,
    ) -> Result<()> {
        let mut token = state.versions.prepare_apply(edit)?;
        let result = MutexGuard::unlocked(state, || token.write());
        state.versions.install(token, &result);
        if let Err(err) = &result {
            self.record_background_error(state, err.clone());
        }
        result
    }

    /// Seal the live memtable (through the write queue) and wait until the
    /// background thread has flushed it.
    pub(crate) fn flush_memtable(&self) -> Result<()> {
        self.write_rotation_barrier()?;

        let mut state = self.state.lock();
        while state.imm.is_some()
            && state.background_error.is_none()
            && !self.shutting_down.load(std::sync::atomic::Ordering::Acquire)
        {
            self.background_work_finished.wait(&mut state);
        }
        if let Some(err) = &state.background_error {
            return Err(err.clone());
        }
        Ok(())
    }

    /// Run a manual compaction of one level over a user-key range,
    /// cooperating with the background thread until the range is done.
    pub(crate) fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end:   Option<&[u8]>,
    ) -> Result<()> {
        // Bounds as internal keys: the begin bound starts before every
        // version of its user key, the end bound after every version.
        let begin = begin.map(|user_key| {
            InternalKey::new(user_key, SequenceNumber::MAX, ValueType::Value)
        });
        let end = end.map(|user_key| {
            InternalKey::new(user_key, SequenceNumber::ZERO, ValueType::Deletion)
        });

        let my_id = self
            .manual_compaction_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut state = self.state.lock();
        let mut installed = false;
        loop {
            if let Some(err) = &state.background_error {
                return Err(err.clone());
            }
            if self.shutting_down.load(std::sync::atomic::Ordering::Acquire) {
                return Err(Error::io("database is shutting down"));
            }

            match &state.manual_compaction {
                Some(manual) if manual.id == my_id => {
                    if manual.done {
                        state.manual_compaction = None;
                        return Ok(());
                    }
                    self.maybe_schedule_compaction(&mut state);
                    self.background_work_finished.wait(&mut state);
                }
                Some(_) => {
                    // Another manual compaction is in flight; wait our turn.
                    self.background_work_finished.wait(&mut state);
                }
                None => {
                    if installed {
                        // Our request was consumed and cleared; done.
                        return Ok(());
                    }
                    state.manual_compaction = Some(ManualCompaction {
                        id: my_id,
                        level,
                        done: false,
                        begin: begin.clone(),
                        end: end.clone(),
                    });
                    installed = true;
                    self.maybe_schedule_compaction(&mut state);
                }
            }
        }
    }
}

/// The output files of one compaction as they are produced.
struct CompactionOutputs<FS: Filesystem> {
    finished:         Vec<FinishedOutput>,
    builder:          Option<TableBuilder<FS::WritableFile>>,
    current_number:   u64,
    current_smallest: Vec<u8>,
    current_largest:  Vec<u8>,
}

struct FinishedOutput {
    number:    u64,
    file_size: u64,
    smallest:  InternalKey,
    largest:   InternalKey,
}

impl<FS: Filesystem> CompactionOutputs<FS> {
    fn new() -> Self {
        Self {
            finished:         Vec::new(),
            builder:          None,
            current_number:   0,
            current_smallest: Vec::new(),
            current_largest:  Vec::new(),
        }
    }

    fn open(&mut self, inner: &DbInner<FS>, number: u64) -> Result<()> {
        debug_assert!(self.builder.is_none());
        let path = DbFile::Table(number).path_in(&inner.db_path);
        let file = inner.fs.open_writable(&path)?;
        self.builder = Some(TableBuilder::new(inner.table_build_options(), file));
        self.current_number = number;
        self.current_smallest.clear();
        self.current_largest.clear();
        Ok(())
    }

    fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let builder = self.builder.as_mut().expect("output open");
        if builder.num_entries() == 0 {
            self.current_smallest.clear();
            self.current_smallest.extend_from_slice(key);
        }
        self.current_largest.clear();
        self.current_largest.extend_from_slice(key);
        builder.add(key, value)?;
        Ok(())
    }

    fn current_size(&self) -> u64 {
        self.builder
            .as_ref()
            .map(TableBuilder::file_size_estimate)
            .unwrap_or(0)
    }

    fn finish_current(&mut self) -> Result<()> {
        let builder = self.builder.take().expect("output open");
        let (mut file, file_size) = builder.finish()?;
        file.sync_data()?;
        drop(file);

        self.finished.push(FinishedOutput {
            number:    self.current_number,
            file_size,
            smallest:  InternalKey(std::mem::take(&mut self.current_smallest)),
            largest:   InternalKey(self.current_largest.clone()),
        });
        self.current_largest.clear();
        Ok(())
    }
}
