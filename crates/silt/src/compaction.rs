//! What a single compaction will do: its input files, the level+2 files that
//! bound output size, and the bookkeeping for dropping shadowed entries.

use std::sync::Arc;

use silt_sstable::Comparator as _;

use crate::config::{GRANDPARENT_OVERLAP_FACTOR, NUM_LEVELS};
use crate::format::InternalKeyComparator;
use crate::version::{FileRef, Version, VersionEdit, total_file_size};


/// A planned compaction from `level` into `level + 1`.
///
/// Holds an `Arc` to the version it was planned against, pinning every input
/// file until the compaction finishes or is abandoned.
#[derive(Debug)]
pub(crate) struct Compaction {
    pub(crate) level:         usize,
    pub(crate) input_version: Arc<Version>,
    /// `inputs[0]`: files from `level`; `inputs[1]`: overlapping files from
    /// `level + 1`.
    pub(crate) inputs:        [Vec<FileRef>; 2],
    /// Files in `level + 2` overlapping the compaction's key range.
    pub(crate) grandparents:  Vec<FileRef>,
    /// The edit that will delete the inputs and add the outputs.
    pub(crate) edit:          VersionEdit,

    max_file_size:      u64,
    /// Cursor state for [`should_stop_before`](Compaction::should_stop_before).
    grandparent_index:  usize,
    seen_key:           bool,
    overlapped_bytes:   u64,
    /// Per-level cursors for [`is_base_level_for_key`]
    /// (amortizes the scan: keys arrive in increasing order).
    ///
    /// [`is_base_level_for_key`]: Compaction::is_base_level_for_key
    level_pointers:     [usize; NUM_LEVELS],
}

impl Compaction {
    pub(crate) fn new(
        level:         usize,
        max_file_size: u64,
        input_version: Arc<Version>,
    ) -> Self {
        Self {
            level,
            input_version,
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            edit: VersionEdit::new(),
            max_file_size,
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_pointers: [0; NUM_LEVELS],
        }
    }

    #[must_use]
    pub(crate) fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    #[must_use]
    pub(crate) fn max_output_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// A compaction that can be performed by renaming a single input file
    /// into the next level: nothing to merge with, and not enough
    /// grandparent overlap to make the move regrettable.
    #[must_use]
    pub(crate) fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents)
                <= GRANDPARENT_OVERLAP_FACTOR * self.max_file_size
    }

    /// Record the deletion of every input file in the edit.
    pub(crate) fn add_input_deletions(&mut self) {
        for (which, input_level) in [self.level, self.level + 1].into_iter().enumerate() {
            for file in &self.inputs[which] {
                self.edit.delete_file(input_level, file.number);
            }
        }
    }

    /// Whether `user_key` cannot exist in any level below this compaction's
    /// output level - in which case a deletion entry for it has nothing left
    /// to shadow and can be dropped.
    ///
    /// Keys must be queried in non-decreasing order across calls.
    #[must_use]
    pub(crate) fn is_base_level_for_key(
        &mut self,
        icmp:     &InternalKeyComparator,
        user_key: &[u8],
    ) -> bool {
        for level in (self.level + 2)..NUM_LEVELS {
            let files = &self.input_version.files[level];
            let pointer = &mut self.level_pointers[level];
            while *pointer < files.len() {
                let file = &files[*pointer];
                if icmp.cmp_user(user_key, file.largest.user_key()).is_gt() {
                    // Past this file; later keys are too, so advance for good.
                    *pointer += 1;
                    continue;
                }
                if icmp.cmp_user(user_key, file.smallest.user_key()).is_ge() {
                    return false;
                }
                break;
            }
        }
        true
    }

    /// Whether the output file being built should be closed before an entry
    /// with `internal_key` is added, because the output's overlap with the
    /// grandparent level would grow past the budget.
    #[must_use]
    pub(crate) fn should_stop_before(
        &mut self,
        icmp:         &InternalKeyComparator,
        internal_key: &[u8],
    ) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && icmp.cmp(
                internal_key,
                self.grandparents[self.grandparent_index].largest.as_bytes(),
            ) == std::cmp::Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > GRANDPARENT_OVERLAP_FACTOR * self.max_file_size {
            // Too much overlap accumulated; cut here and start counting for
            // the next output file.
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }
}

/// Running totals for one level's compactions, surfaced by the `stats`
/// property.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CompactionStats {
    pub micros:        u64,
    pub bytes_read:    u64,
    pub bytes_written: u64,
}

impl CompactionStats {
    pub(crate) fn add(&mut self, other: &CompactionStats) {
        self.micros += other.micros;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }
}


#[cfg(test)]
mod tests {
    use silt_sstable::BytewiseComparator;

    use crate::format::{InternalKey, SequenceNumber, ValueType};
    use crate::version::FileMetadata;
    use super::*;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn file(number: u64, size: u64, smallest: &[u8], largest: &[u8]) -> FileRef {
        Arc::new(FileMetadata::new(
            number,
            size,
            InternalKey::new(smallest, SequenceNumber(10), ValueType::Value),
            InternalKey::new(largest, SequenceNumber(10), ValueType::Value),
        ))
    }

    #[test]
    fn single_file_without_overlap_is_a_trivial_move() {
        let mut compaction = Compaction::new(1, 2 << 20, Arc::new(Version::empty()));
        compaction.inputs[0].push(file(9, 1000, b"a", b"b"));
        assert!(compaction.is_trivial_move());

        compaction.inputs[1].push(file(10, 1000, b"a", b"c"));
        assert!(!compaction.is_trivial_move());
    }

    #[test]
    fn heavy_grandparent_overlap_blocks_trivial_move() {
        let mut compaction = Compaction::new(1, 1000, Arc::new(Version::empty()));
        compaction.inputs[0].push(file(9, 1000, b"a", b"b"));
        compaction.grandparents.push(file(11, 20_000, b"a", b"z"));
        assert!(!compaction.is_trivial_move());
    }

    #[test]
    fn base_level_scan_advances_monotonically() {
        let icmp = icmp();
        let mut files: [Vec<FileRef>; NUM_LEVELS] = std::array::from_fn(|_| Vec::new());
        files[3] = vec![file(1, 100, b"f", b"h"), file(2, 100, b"p", b"r")];
        let version = Arc::new(Version::new(files));

        let mut compaction = Compaction::new(1, 2 << 20, version);
        assert!(compaction.is_base_level_for_key(&icmp, b"a"));
        assert!(!compaction.is_base_level_for_key(&icmp, b"g"));
        assert!(compaction.is_base_level_for_key(&icmp, b"k"));
        assert!(!compaction.is_base_level_for_key(&icmp, b"q"));
        assert!(compaction.is_base_level_for_key(&icmp, b"z"));
    }

    #[test]
    fn outputs_are_cut_at_grandparent_budget() {
        let icmp = icmp();
        let mut compaction = Compaction::new(1, 150, Arc::new(Version::empty()));
        // Budget: 10 * 150 bytes. Three 600-byte grandparents.
        compaction.grandparents = vec![
            file(1, 600, b"b", b"c"),
            file(2, 600, b"e", b"f"),
            file(3, 600, b"h", b"i"),
        ];

        let key = |user: &[u8]| {
            InternalKey::new(user, SequenceNumber(5), ValueType::Value)
        };

        assert!(!compaction.should_stop_before(&icmp, key(b"a").as_bytes()));
        assert!(!compaction.should_stop_before(&icmp, key(b"d").as_bytes()));
        assert!(!compaction.should_stop_before(&icmp, key(b"g").as_bytes()));
        // 1800 bytes of grandparents passed; budget 1500 exceeded.
        assert!(compaction.should_stop_before(&icmp, key(b"j").as_bytes()));
        // Counter reset after the cut.
        assert!(!compaction.should_stop_before(&icmp, key(b"k").as_bytes()));
    }
}
