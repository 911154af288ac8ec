//! Applies a sequence of [`VersionEdit`]s on top of a base [`Version`] to
//! produce the next one.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use silt_sstable::Comparator as _;

use crate::config::NUM_LEVELS;
use crate::error::{Error, Result};
use crate::format::InternalKeyComparator;
use super::edit::VersionEdit;
use super::{FileRef, Version};


/// Per-level pending state while edits are folded in.
#[derive(Default)]
struct LevelState {
    deleted: HashSet<u64>,
    added:   Vec<FileRef>,
}

pub(super) struct VersionBuilder<'a> {
    icmp:   &'a InternalKeyComparator,
    base:   &'a Version,
    levels: [LevelState; NUM_LEVELS],
}

impl<'a> VersionBuilder<'a> {
    pub(super) fn new(icmp: &'a InternalKeyComparator, base: &'a Version) -> Self {
        Self {
            icmp,
            base,
            levels: std::array::from_fn(|_| LevelState::default()),
        }
    }

    /// Fold one edit into the pending state.
    pub(super) fn apply(&mut self, edit: &VersionEdit) {
        for (level, number) in &edit.deleted_files {
            self.levels[*level].deleted.insert(*number);
        }
        for (level, file) in &edit.new_files {
            let metadata: FileRef = Arc::new(file.clone().into_metadata());
            self.levels[*level].deleted.remove(&file.number);
            self.levels[*level].added.push(metadata);
        }
    }

    /// Produce the resulting version.
    ///
    /// With `validate` set, adjacent files in each level beyond 0 are checked
    /// for disjointness; a violation is a corrupt catalog.
    pub(super) fn finish(self, validate: bool) -> Result<Version> {
        let Self { icmp, base, levels } = self;

        let by_smallest = |a: &FileRef, b: &FileRef| {
            match icmp.cmp(a.smallest.as_bytes(), b.smallest.as_bytes()) {
                Ordering::Equal => a.number.cmp(&b.number),
                unequal => unequal,
            }
        };

        let mut files: [Vec<FileRef>; NUM_LEVELS] = std::array::from_fn(|_| Vec::new());

        for (level, mut state) in levels.into_iter().enumerate() {
            let base_files = &base.files[level];

            // Order additions by the comparator (not byte order; they can
            // differ), then merge with the already-sorted base files.
            state.added.sort_by(by_smallest);
            let mut merged = Vec::with_capacity(base_files.len() + state.added.len());
            let mut additions = state.added.into_iter().peekable();
            for base_file in base_files {
                while let Some(added) = additions.peek() {
                    if by_smallest(added, base_file) == Ordering::Less {
                        merged.push(additions.next().expect("peeked"));
                    } else {
                        break;
                    }
                }
                merged.push(Arc::clone(base_file));
            }
            merged.extend(additions);

            merged.retain(|file| !state.deleted.contains(&file.number));

            if validate && level > 0 {
                for pair in merged.windows(2) {
                    let earlier_largest = pair[0].largest.as_bytes();
                    let later_smallest = pair[1].smallest.as_bytes();
                    if icmp.cmp(earlier_largest, later_smallest) != Ordering::Less {
                        return Err(Error::corruption(format!(
                            "level {level}: files {} and {} overlap",
                            pair[0].number, pair[1].number,
                        )));
                    }
                }
            }

            files[level] = merged;
        }

        Ok(Version::new(files))
    }
}


#[cfg(test)]
mod tests {
    use crate::format::{InternalKey, SequenceNumber, ValueType};
    use silt_sstable::BytewiseComparator;
    use super::*;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn ikey(user_key: &[u8]) -> InternalKey {
        InternalKey::new(user_key, SequenceNumber(100), ValueType::Value)
    }

    fn numbers(version: &Version, level: usize) -> Vec<u64> {
        version.files[level].iter().map(|file| file.number).collect()
    }

    #[test]
    fn additions_merge_sorted_with_base() {
        let icmp = icmp();
        let empty = Version::empty();

        // A base with files covering "a".."c" and "t".."z".
        let mut edit = VersionEdit::new();
        edit.add_file(1, 1, 1000, ikey(b"a"), ikey(b"c"));
        edit.add_file(1, 2, 1000, ikey(b"t"), ikey(b"z"));
        let mut builder = VersionBuilder::new(&icmp, &empty);
        builder.apply(&edit);
        let base = builder.finish(true).unwrap();

        // Add a file in the gap; it lands between the base files.
        let mut edit = VersionEdit::new();
        edit.add_file(1, 10, 1000, ikey(b"m"), ikey(b"p"));
        let mut builder = VersionBuilder::new(&icmp, &base);
        builder.apply(&edit);
        let version = builder.finish(true).unwrap();

        assert_eq!(numbers(&version, 1), vec![1, 10, 2]);
    }

    #[test]
    fn deletions_remove_base_files() {
        let icmp = icmp();
        let empty = Version::empty();

        let mut edit = VersionEdit::new();
        edit.add_file(2, 5, 1000, ikey(b"a"), ikey(b"b"));
        edit.add_file(2, 6, 1000, ikey(b"c"), ikey(b"d"));
        let mut builder = VersionBuilder::new(&icmp, &empty);
        builder.apply(&edit);
        let base = builder.finish(true).unwrap();

        let mut edit = VersionEdit::new();
        edit.delete_file(2, 5);
        let mut builder = VersionBuilder::new(&icmp, &base);
        builder.apply(&edit);
        let version = builder.finish(true).unwrap();

        assert_eq!(numbers(&version, 2), vec![6]);
    }

    #[test]
    fn overlapping_files_fail_validation() {
        let icmp = icmp();
        let empty = Version::empty();

        let mut edit = VersionEdit::new();
        edit.add_file(3, 7, 1000, ikey(b"a"), ikey(b"m"));
        edit.add_file(3, 8, 1000, ikey(b"k"), ikey(b"z"));
        let mut builder = VersionBuilder::new(&icmp, &empty);
        builder.apply(&edit);
        assert!(builder.finish(true).is_err());
    }

    #[test]
    fn level0_may_overlap() {
        let icmp = icmp();
        let empty = Version::empty();

        let mut edit = VersionEdit::new();
        edit.add_file(0, 7, 1000, ikey(b"a"), ikey(b"m"));
        edit.add_file(0, 8, 1000, ikey(b"k"), ikey(b"z"));
        let mut builder = VersionBuilder::new(&icmp, &empty);
        builder.apply(&edit);
        assert!(builder.finish(true).is_ok());
    }
}
