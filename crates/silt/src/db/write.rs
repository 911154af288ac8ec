//! The write pipeline.
//!
//! Writers queue up under the database mutex. The writer at the head becomes
//! the *leader*: it makes room (possibly sealing the memtable), folds the
//! batches of adjacent compatible waiters into one group, assigns the
//! group's sequence range, appends it to the WAL and applies it to the
//! memtable with the mutex released, then wakes the group. A waiter whose
//! batch was committed by a leader just returns that result; one that
//! reaches the head of the queue becomes the next leader.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

use silt_vfs::Filesystem;

use crate::config::{L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER};
use crate::error::{Error, Result};
use crate::filenames::DbFile;
use crate::format::SequenceNumber;
use crate::memtable::Memtable;
use crate::options::WriteOptions;
use crate::wal::LogWriter;
use crate::write_batch::{BatchEntry, WriteBatch};
use super::{DbInner, DbState};


/// Group size cap; a small leader lowers it so tiny writes are not delayed
/// behind a megabyte of grouping.
const MAX_GROUP_BYTES: usize = 1 << 20;
const SMALL_WRITE_BYTES: usize = 128 << 10;

/// What a queued writer is currently expected to do.
#[derive(Debug)]
pub(crate) enum WriterPhase {
    /// Sit tight; a leader may pick the batch up.
    Waiting,
    /// The writer reached the head of the queue and must lead a group.
    Lead,
    /// A leader committed (or failed) this writer's batch.
    Done(Result<()>),
}

/// Shared slot a queued writer parks on.
#[derive(Debug)]
pub(crate) struct WriterNotify {
    pub(crate) phase: Mutex<WriterPhase>,
    pub(crate) cv:    Condvar,
}

/// One entry in the writer queue. The batch lives here until a leader folds
/// it into a group. A `None` batch is a *barrier*: it forces a memtable
/// rotation (sealing even a small memtable) and commits nothing.
#[derive(Debug)]
pub(crate) struct PendingWriter {
    pub(crate) batch:  Option<WriteBatch>,
    pub(crate) sync:   bool,
    pub(crate) notify: Arc<WriterNotify>,
}

impl<FS: Filesystem> DbInner<FS> {
    pub(crate) fn write(&self, write_opts: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.queue_write(write_opts, Some(batch))
    }

    /// Queue a barrier that seals the current memtable and schedules its
    /// flush. Used by [`flush_memtable`](DbInner::flush_memtable).
    pub(crate) fn write_rotation_barrier(&self) -> Result<()> {
        self.queue_write(&WriteOptions::new(), None)
    }

    fn queue_write(&self, write_opts: &WriteOptions, batch: Option<WriteBatch>) -> Result<()> {
        let notify = Arc::new(WriterNotify {
            phase: Mutex::new(WriterPhase::Waiting),
            cv:    Condvar::new(),
        });

        {
            let mut state = self.state.lock();
            let is_leader = state.writers.is_empty();
            state.writers.push_back(PendingWriter {
                batch,
                sync: write_opts.sync,
                notify: Arc::clone(&notify),
            });
            if is_leader {
                return self.lead_write(state);
            }
        }

        // Park until a leader either commits this batch or hands over
        // leadership.
        {
            let mut phase = notify.phase.lock();
            loop {
                match &*phase {
                    WriterPhase::Done(result) => return result.clone(),
                    WriterPhase::Lead => break,
                    WriterPhase::Waiting => notify.cv.wait(&mut phase),
                }
            }
        }

        let state = self.state.lock();
        self.lead_write(state)
    }

    /// Run a commit group from the head of the queue. The caller must be the
    /// writer at the head.
    fn lead_write(&self, mut state: MutexGuard<'_, DbState<FS>>) -> Result<()> {
        let force_rotation = state.writers[0].batch.is_none();

        let result = match self.make_room_for_write(&mut state, force_rotation) {
            Err(err) => {
                // Nothing was grouped; fail only the leader's own batch.
                // Followers get their chance (and will fail fast on a
                // latched error).
                state.writers.pop_front();
                Err(err)
            }
            // `commit_group` pops every member of the group it commits.
            Ok(()) => self.commit_group(&mut state),
        };

        // Hand leadership to the new head, if any.
        if let Some(next) = state.writers.front() {
            let mut phase = next.notify.phase.lock();
            *phase = WriterPhase::Lead;
            next.notify.cv.notify_one();
        }

        result
    }

    /// Fold a group, assign sequences, write the WAL, apply to the memtable,
    /// pop and wake the group. Returns the leader's (group's) result.
    fn commit_group(&self, state: &mut MutexGuard<'_, DbState<FS>>) -> Result<()> {
        if state.writers[0].batch.is_none() {
            // A rotation barrier: the work happened in make_room_for_write.
            state.writers.pop_front();
            return Ok(());
        }

        let group_size = self.plan_group(state);
        let sync = state.writers[0].sync;

        // Assemble the group batch: reuse the leader's batch for a group of
        // one, otherwise fold everything into the scratch batch.
        let mut batch = if group_size == 1 {
            state.writers[0].batch.take().expect("leader batch checked above")
        } else {
            let mut scratch = std::mem::replace(&mut state.group_scratch, WriteBatch::new());
            scratch.clear();
            for pending in state.writers.iter().take(group_size) {
                let follower = pending.batch.as_ref().expect("barriers are not grouped");
                scratch.append(follower);
            }
            scratch
        };

        let start_sequence = state.versions.last_sequence().add(1);
        let end_sequence = state.versions.last_sequence().add(u64::from(batch.count()));
        batch.set_sequence(start_sequence);

        // The WAL writer and memtable leave the mutex for the duration of
        // the append: the head writer has exclusive write access to both by
        // queue position, and readers of the memtable are lock-free.
        let mut wal = state.wal.take().expect("WAL present while writers queued");
        let mem = Arc::clone(&state.mem);

        let result = MutexGuard::unlocked(state, || {
            let append = wal
                .add_record(batch.contents())
                .map_err(Error::from)
                .and_then(|()| {
                    if sync {
                        wal.sync().map_err(Error::from)
                    } else {
                        Ok(())
                    }
                });

            match append {
                Ok(()) => apply_batch_to_memtable(&batch, start_sequence, &mem),
                Err(err) => Err(err),
            }
        });

        state.wal = Some(wal);

        match &result {
            Ok(()) => {
                state.versions.set_last_sequence(end_sequence);
            }
            Err(err) => {
                // The WAL may hold a torn record; everything after it would
                // be unreadable. Fence off further writes.
                self.record_background_error(state, err.clone());
            }
        }

        // Return the scratch batch's allocation for reuse.
        if group_size > 1 {
            batch.clear();
            state.group_scratch = batch;
        }

        // Pop and wake the group. The leader (front) takes its result by
        // return value.
        for index in 0..group_size {
            let pending = state.writers.pop_front().expect("group members queued");
            if index > 0 {
                let mut phase = pending.notify.phase.lock();
                *phase = WriterPhase::Done(result.clone());
                pending.notify.cv.notify_one();
            }
        }

        result
    }

    /// How many writers from the head of the queue commit together.
    fn plan_group(&self, state: &DbState<FS>) -> usize {
        let leader = &state.writers[0];
        let leader_bytes = leader.batch.as_ref().expect("leader carries a batch").byte_size();

        let mut max_bytes = MAX_GROUP_BYTES;
        if leader_bytes <= SMALL_WRITE_BYTES {
            max_bytes = leader_bytes + SMALL_WRITE_BYTES;
        }

        let mut total = leader_bytes;
        let mut group_size = 1;
        for pending in state.writers.iter().skip(1) {
            if pending.sync != leader.sync {
                break;
            }
            let Some(follower) = &pending.batch else {
                // Barriers lead their own (empty) group.
                break;
            };
            total += follower.byte_size();
            if total > max_bytes {
                break;
            }
            group_size += 1;
        }
        group_size
    }

    /// Ensure the memtable can take a write, per the staged backpressure
    /// protocol: one optional 1 ms slowdown, waiting out an in-flight flush,
    /// waiting out a level-0 pileup, or sealing the memtable and scheduling
    /// its flush.
    pub(crate) fn make_room_for_write(
        &self,
        state: &mut MutexGuard<'_, DbState<FS>>,
        force: bool,
    ) -> Result<()> {
        let mut force = force;
        let mut allow_delay = !force;

        loop {
            if let Some(err) = &state.background_error {
                return Err(err.clone());
            }

            if allow_delay
                && state.versions.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER
            {
                // Let the compactor breathe: lose 1 ms here instead of
                // seconds at the hard stop. Taken at most once per write.
                allow_delay = false;
                MutexGuard::unlocked(state, || {
                    std::thread::sleep(Duration::from_millis(1));
                });
                continue;
            }

            if !force
                && state.mem.approximate_memory_usage() <= self.options.write_buffer_size
            {
                return Ok(());
            }

            if state.imm.is_some() {
                // The previous memtable is still being flushed; wait.
                debug!("write waits: previous memtable still flushing");
                self.background_work_finished.wait(state);
                continue;
            }

            if state.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
                debug!("write waits: too many level-0 files");
                self.background_work_finished.wait(state);
                continue;
            }

            // Seal the current memtable and switch to a fresh one with a
            // fresh log.
            let new_log_number = state.versions.new_file_number();
            let log_path = DbFile::Log(new_log_number).path_in(&self.db_path);
            let log_file = match self.fs.open_writable(&log_path) {
                Ok(file) => file,
                Err(err) => {
                    // Leave the number for reuse and fail this write; the
                    // current memtable and WAL remain consistent.
                    state.versions.reuse_file_number(new_log_number);
                    return Err(err.into());
                }
            };

            state.wal = Some(LogWriter::new(log_file));
            state.log_file_number = new_log_number;
            state.imm = Some(Arc::clone(&state.mem));
            self.has_imm.store(true, std::sync::atomic::Ordering::Release);
            state.mem = Arc::new(Memtable::new(self.icmp.clone()));
            force = false;
            self.maybe_schedule_compaction(state);
        }
    }
}

/// Replay a batch into a memtable, one sequence number per record. Fails
/// (without applying further records) on a malformed batch, which can only
/// come from a corrupt log record during recovery.
pub(crate) fn apply_batch_to_memtable(
    batch:          &WriteBatch,
    start_sequence: SequenceNumber,
    mem:            &Memtable,
) -> Result<()> {
    let mut sequence = start_sequence;
    for entry in batch.iter() {
        match entry? {
            BatchEntry::Put { key, value } => {
                mem.add(sequence, crate::format::ValueType::Value, key, value);
            }
            BatchEntry::Delete { key } => {
                mem.add(sequence, crate::format::ValueType::Deletion, key, b"");
            }
        }
        sequence = sequence.add(1);
    }
    Ok(())
}
