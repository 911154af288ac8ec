//! The catalog: which table files exist, per level, and how reads and
//! compactions consult them.

pub(crate) mod edit;

mod builder;
mod set;

pub(crate) use self::edit::VersionEdit;
pub(crate) use self::set::VersionSet;

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrder};

use parking_lot::Mutex;

use silt_vfs::Filesystem;

use crate::config::{
    GRANDPARENT_OVERLAP_FACTOR, L0_COMPACTION_TRIGGER, MAX_BYTES_FOR_LEVEL_BASE,
    MAX_MEM_COMPACT_LEVEL, NUM_LEVELS,
};
use crate::error::Result;
use crate::format::{
    InternalKey, InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType,
};
use crate::options::ReadOptions;
use crate::table_cache::TableCache;


/// Metadata for one on-disk table file. Shared by every `Version` whose
/// level map includes the file.
#[derive(Debug)]
pub(crate) struct FileMetadata {
    pub number:    u64,
    pub file_size: u64,
    pub smallest:  InternalKey,
    pub largest:   InternalKey,
    /// Point lookups that graze this file without being answered by it
    /// decrement this; at zero the file becomes a compaction candidate.
    allowed_seeks: AtomicI64,
}

pub(crate) type FileRef = Arc<FileMetadata>;

impl FileMetadata {
    #[must_use]
    pub(crate) fn new(
        number:    u64,
        file_size: u64,
        smallest:  InternalKey,
        largest:   InternalKey,
    ) -> Self {
        // One seek costs roughly what compacting 16 KiB costs, so a file
        // earns one "free" seek per 16 KiB of its size, floor 100.
        let allowed_seeks = (file_size / 16384).max(100) as i64;
        Self {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed_seeks),
        }
    }

    /// Charge one seek; true when the budget just ran out.
    fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, AtomicOrder::Relaxed) == 1
    }
}

/// The result of a point lookup against a version.
#[derive(Debug)]
pub(crate) struct VersionGet {
    /// `None`: no level said anything. `Some(None)`: deleted.
    /// `Some(Some(v))`: found.
    pub outcome:   Option<Option<Vec<u8>>>,
    /// A file that was probed without answering, eligible for a seek charge.
    pub seek_file: Option<(usize, FileRef)>,
}

/// An immutable snapshot of the level→files mapping.
///
/// Versions are shared (`Arc`) with iterators and in-flight compactions;
/// table files are deleted only when no live version references them.
#[derive(Debug)]
pub(crate) struct Version {
    pub(crate) files: [Vec<FileRef>; NUM_LEVELS],

    /// Best level for the next size compaction and its score (≥ 1 means
    /// compaction is due). Computed once when the version is built.
    pub(crate) compaction_level: usize,
    pub(crate) compaction_score: f64,

    /// Set when some file exhausts its seek budget; consumed by the picker.
    seek_compaction: Mutex<Option<(usize, FileRef)>>,
}

impl Version {
    #[must_use]
    pub(crate) fn empty() -> Self {
        Self::new(std::array::from_fn(|_| Vec::new()))
    }

    #[must_use]
    pub(crate) fn new(files: [Vec<FileRef>; NUM_LEVELS]) -> Self {
        let (compaction_level, compaction_score) = score_levels(&files);
        Self {
            files,
            compaction_level,
            compaction_score,
            seek_compaction: Mutex::new(None),
        }
    }

    #[must_use]
    pub(crate) fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    #[must_use]
    pub(crate) fn level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.files[level])
    }

    #[must_use]
    pub(crate) fn needs_compaction(&self) -> bool {
        self.compaction_score >= 1.0 || self.seek_compaction.lock().is_some()
    }

    pub(crate) fn take_seek_compaction(&self) -> Option<(usize, FileRef)> {
        self.seek_compaction.lock().take()
    }

    /// Record that `file` (at `level`) was probed without answering a
    /// lookup. Returns true if this armed a seek compaction.
    pub(crate) fn charge_seek(&self, level: usize, file: &FileRef) -> bool {
        if file.charge_seek() {
            let mut slot = self.seek_compaction.lock();
            if slot.is_none() {
                *slot = Some((level, Arc::clone(file)));
            }
            return true;
        }
        false
    }

    /// Look `lookup` up in this version's files, newest level first.
    pub(crate) fn get<FS: Filesystem>(
        &self,
        table_cache: &TableCache<FS>,
        read_opts:   &ReadOptions,
        icmp:        &InternalKeyComparator,
        lookup:      &LookupKey,
    ) -> Result<VersionGet> {
        let user_key = lookup.user_key();
        let internal_key = lookup.internal_key();

        let mut seek_file: Option<(usize, FileRef)> = None;
        let mut last_probed: Option<(usize, FileRef)> = None;

        for level in 0..NUM_LEVELS {
            let candidates = self.candidates_for(level, icmp, user_key, internal_key);

            for file in candidates {
                if seek_file.is_none() {
                    // More than one file probed: the first one pays.
                    seek_file = last_probed.take();
                }
                last_probed = Some((level, Arc::clone(&file)));

                let found =
                    table_cache.get(file.number, file.file_size, read_opts, internal_key)?;
                let Some((entry_key, entry_value)) = found else {
                    continue;
                };
                let parsed = ParsedInternalKey::decode(&entry_key)?;
                if icmp.cmp_user(parsed.user_key, user_key) != Ordering::Equal {
                    continue;
                }
                let outcome = match parsed.value_type {
                    ValueType::Value    => Some(Some(entry_value)),
                    ValueType::Deletion => Some(None),
                };
                return Ok(VersionGet { outcome, seek_file });
            }
        }

        Ok(VersionGet {
            outcome: None,
            seek_file,
        })
    }

    /// The files of `level` that might hold `internal_key`, in probe order.
    fn candidates_for(
        &self,
        level:        usize,
        icmp:         &InternalKeyComparator,
        user_key:     &[u8],
        internal_key: &[u8],
    ) -> Vec<FileRef> {
        let files = &self.files[level];

        if level == 0 {
            // Level-0 files overlap; collect all whose range covers the key
            // and probe newest file first.
            let mut candidates: Vec<FileRef> = files
                .iter()
                .filter(|file| {
                    icmp.cmp_user(file.smallest.user_key(), user_key).is_le()
                        && icmp.cmp_user(user_key, file.largest.user_key()).is_le()
                })
                .cloned()
                .collect();
            candidates.sort_unstable_by_key(|file| std::cmp::Reverse(file.number));
            return candidates;
        }

        // Deeper levels are disjoint and sorted: at most one candidate.
        let index = find_file(icmp, files, internal_key);
        let Some(file) = files.get(index) else {
            return Vec::new();
        };
        if icmp.cmp_user(user_key, file.smallest.user_key()) == Ordering::Less {
            return Vec::new();
        }
        vec![Arc::clone(file)]
    }

    /// Note a read at `internal_key` (sampled by iterators). If two or more
    /// files overlap the key, charge the first: an iterator passing through
    /// here repeatedly is doing the work a compaction would remove.
    pub(crate) fn record_read_sample(
        &self,
        icmp:         &InternalKeyComparator,
        internal_key: &[u8],
    ) -> bool {
        let Ok(parsed) = ParsedInternalKey::decode(internal_key) else {
            return false;
        };
        let user_key = parsed.user_key;

        let mut first_overlap: Option<(usize, FileRef)> = None;
        let mut overlaps = 0;

        for level in 0..NUM_LEVELS {
            for file in &self.files[level] {
                let covers = icmp.cmp_user(file.smallest.user_key(), user_key).is_le()
                    && icmp.cmp_user(user_key, file.largest.user_key()).is_le();
                if !covers {
                    continue;
                }
                overlaps += 1;
                if first_overlap.is_none() {
                    first_overlap = Some((level, Arc::clone(file)));
                }
                if overlaps >= 2 {
                    let (level, file) = first_overlap.expect("set on first overlap");
                    return self.charge_seek(level, &file);
                }
            }
            // Only level 0 can produce a second overlap within one level;
            // keep scanning deeper levels for the cross-level case.
        }
        false
    }

    /// All files in `level` whose key range intersects
    /// `[begin, end]` (either bound absent means unbounded). For level 0 the
    /// range grows transitively, because its files overlap each other.
    #[must_use]
    pub(crate) fn overlapping_inputs(
        &self,
        icmp:  &InternalKeyComparator,
        level: usize,
        begin: Option<&InternalKey>,
        end:   Option<&InternalKey>,
    ) -> Vec<FileRef> {
        let mut begin_user = begin.map(|key| key.user_key().to_vec());
        let mut end_user = end.map(|key| key.user_key().to_vec());

        let mut inputs: Vec<FileRef> = Vec::new();
        let mut index = 0;
        while index < self.files[level].len() {
            let file = &self.files[level][index];
            index += 1;

            let starts_after_range = begin_user
                .as_deref()
                .is_some_and(|begin| icmp.cmp_user(file.largest.user_key(), begin).is_lt());
            let ends_before_range = end_user
                .as_deref()
                .is_some_and(|end| icmp.cmp_user(file.smallest.user_key(), end).is_gt());
            if starts_after_range || ends_before_range {
                continue;
            }

            inputs.push(Arc::clone(file));

            if level == 0 {
                // This file may drag the range wider; restart with the
                // widened range so transitive overlaps are included.
                let mut widened = false;
                if let Some(begin) = &begin_user {
                    if icmp.cmp_user(file.smallest.user_key(), begin).is_lt() {
                        begin_user = Some(file.smallest.user_key().to_vec());
                        widened = true;
                    }
                }
                if let Some(end) = &end_user {
                    if icmp.cmp_user(file.largest.user_key(), end).is_gt() {
                        end_user = Some(file.largest.user_key().to_vec());
                        widened = true;
                    }
                }
                if widened {
                    inputs.clear();
                    index = 0;
                }
            }
        }
        inputs
    }

    /// Whether any file in `level` overlaps the user-key range.
    #[must_use]
    pub(crate) fn overlap_in_level(
        &self,
        icmp:          &InternalKeyComparator,
        level:         usize,
        smallest_user: Option<&[u8]>,
        largest_user:  Option<&[u8]>,
    ) -> bool {
        let files = &self.files[level];
        if level == 0 {
            return files.iter().any(|file| {
                let after = smallest_user
                    .is_some_and(|begin| icmp.cmp_user(file.largest.user_key(), begin).is_lt());
                let before = largest_user
                    .is_some_and(|end| icmp.cmp_user(file.smallest.user_key(), end).is_gt());
                !(after || before)
            });
        }

        // Disjoint level: binary search for the first file that could
        // contain the range start.
        let index = match smallest_user {
            Some(smallest_user) => {
                let probe = InternalKey::new(
                    smallest_user,
                    crate::format::SequenceNumber::MAX,
                    ValueType::Value,
                );
                find_file(icmp, files, probe.as_bytes())
            }
            None => 0,
        };
        let Some(file) = files.get(index) else {
            return false;
        };
        !largest_user.is_some_and(|end| icmp.cmp_user(file.smallest.user_key(), end).is_gt())
    }

    /// The level a freshly flushed memtable covering
    /// `[smallest_user, largest_user]` should land in: push below level 0
    /// while nothing there overlaps and the grandparent overlap stays cheap.
    #[must_use]
    pub(crate) fn pick_level_for_memtable_output(
        &self,
        icmp:          &InternalKeyComparator,
        max_file_size: u64,
        smallest_user: &[u8],
        largest_user:  &[u8],
    ) -> usize {
        if self.overlap_in_level(icmp, 0, Some(smallest_user), Some(largest_user)) {
            return 0;
        }

        let begin = InternalKey::new(
            smallest_user,
            crate::format::SequenceNumber::MAX,
            ValueType::Value,
        );
        let end = InternalKey::new(largest_user, crate::format::SequenceNumber(0), ValueType::Deletion);

        let mut level = 0;
        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(icmp, level + 1, Some(smallest_user), Some(largest_user)) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let grandparents =
                    self.overlapping_inputs(icmp, level + 2, Some(&begin), Some(&end));
                if total_file_size(&grandparents) > GRANDPARENT_OVERLAP_FACTOR * max_file_size {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// A short per-level file count summary for logs.
    #[must_use]
    pub(crate) fn level_summary(&self) -> String {
        let counts: Vec<String> = self
            .files
            .iter()
            .map(|files| files.len().to_string())
            .collect();
        format!("files[ {} ]", counts.join(" "))
    }
}

/// Index of the first file whose largest key is `>= internal_key`, in a
/// sorted, disjoint file list. `files.len()` when there is none.
#[must_use]
pub(crate) fn find_file(
    icmp:         &InternalKeyComparator,
    files:        &[FileRef],
    internal_key: &[u8],
) -> usize {
    use silt_sstable::Comparator as _;

    let mut left = 0;
    let mut right = files.len();
    while left < right {
        let middle = (left + right) / 2;
        if icmp.cmp(files[middle].largest.as_bytes(), internal_key) == Ordering::Less {
            left = middle + 1;
        } else {
            right = middle;
        }
    }
    left
}

#[must_use]
pub(crate) fn total_file_size(files: &[FileRef]) -> u64 {
    files.iter().map(|file| file.file_size).sum()
}

/// The level most in need of size compaction, and its score.
fn score_levels(files: &[Vec<FileRef>; NUM_LEVELS]) -> (usize, f64) {
    let mut best_level = 0;
    // Level 0 is scored by file count: with overlapping files, every read
    // merges all of them, so the count matters more than the bytes (and a
    // small write buffer must not trigger a compaction storm).
    let mut best_score = files[0].len() as f64 / L0_COMPACTION_TRIGGER as f64;

    // The last level has nowhere to compact into, so it is never scored.
    let mut max_bytes = MAX_BYTES_FOR_LEVEL_BASE;
    for (level, level_files) in files.iter().enumerate().take(NUM_LEVELS - 1).skip(1) {
        let score = total_file_size(level_files) as f64 / max_bytes;
        if score > best_score {
            best_level = level;
            best_score = score;
        }
        max_bytes *= 10.0;
    }

    (best_level, best_score)
}
