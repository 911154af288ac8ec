//! Iteration plumbing at internal-key granularity.
//!
//! Everything that can yield ordered internal entries - the memtable, one
//! table file, a whole level - implements [`InternalIterator`]; the
//! [`MergingIterator`] fuses any number of them into one ordered stream, and
//! the user-facing iterator (`db_iter`) collapses that stream to user keys.

use std::cmp::Ordering;
use std::sync::Arc;

use silt_sstable::Comparator as _;
use silt_sstable::table::TableIter;
use silt_vfs::Filesystem;

use crate::error::{Error, Result};
use crate::format::InternalKeyComparator;
use crate::options::ReadOptions;
use crate::table_cache::TableCache;
use crate::version::{FileRef, find_file};


/// A cursor over internal entries in internal-key order.
///
/// The capability set is {valid, seek-to-first/last, seek, next, prev, key,
/// value, status}; `key`/`value` may only be called while `valid()`, and
/// `status` surfaces any error that silently invalidated the cursor.
pub(crate) trait InternalIterator: Send {
    fn valid(&self) -> bool;
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    /// Position at the first entry with internal key `>= target`.
    fn seek(&mut self, target: &[u8]);
    fn next(&mut self);
    fn prev(&mut self);
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn status(&self) -> Result<()>;
}

impl<F: silt_vfs::RandomAccessFile> InternalIterator for TableIter<F> {
    fn valid(&self) -> bool {
        TableIter::valid(self)
    }

    fn seek_to_first(&mut self) {
        TableIter::seek_to_first(self);
    }

    fn seek_to_last(&mut self) {
        TableIter::seek_to_last(self);
    }

    fn seek(&mut self, target: &[u8]) {
        TableIter::seek(self, target);
    }

    fn next(&mut self) {
        TableIter::next(self);
    }

    fn prev(&mut self) {
        TableIter::prev(self);
    }

    fn key(&self) -> &[u8] {
        TableIter::key(self)
    }

    fn value(&self) -> &[u8] {
        TableIter::value(self)
    }

    fn status(&self) -> Result<()> {
        TableIter::status(self).map_err(Error::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// An n-way merge of child iterators, in internal-key order.
///
/// Children are scanned linearly per step; with at most a dozen or so
/// children (memtables + level 0 + one per deeper level) that beats heap
/// bookkeeping.
pub(crate) struct MergingIterator {
    icmp:      InternalKeyComparator,
    children:  Vec<Box<dyn InternalIterator>>,
    current:   Option<usize>,
    direction: Direction,
}

impl MergingIterator {
    #[must_use]
    pub(crate) fn new(
        icmp:     InternalKeyComparator,
        children: Vec<Box<dyn InternalIterator>>,
    ) -> Self {
        Self {
            icmp,
            children,
            current:   None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (index, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            let is_smaller = match smallest {
                None => true,
                Some(best) => {
                    self.icmp.cmp(child.key(), self.children[best].key()) == Ordering::Less
                }
            };
            if is_smaller {
                smallest = Some(index);
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (index, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            let is_larger = match largest {
                None => true,
                Some(best) => {
                    self.icmp.cmp(child.key(), self.children[best].key()) == Ordering::Greater
                }
            };
            if is_larger {
                largest = Some(index);
            }
        }
        self.current = largest;
    }
}

impl InternalIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Backward;
        self.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn next(&mut self) {
        let current = self.current.expect("next() on an invalid merging iterator");

        if self.direction == Direction::Backward {
            // All other children sit before the current key; move each to
            // its first entry after it, so stepping forward is uniform.
            let current_key = self.children[current].key().to_vec();
            for (index, child) in self.children.iter_mut().enumerate() {
                if index == current {
                    continue;
                }
                child.seek(&current_key);
                if child.valid()
                    && self.icmp.cmp(&current_key, child.key()) == Ordering::Equal
                {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let current = self.current.expect("prev() on an invalid merging iterator");

        if self.direction == Direction::Forward {
            // All other children sit at or after the current key; move each
            // to its last entry before it.
            let current_key = self.children[current].key().to_vec();
            for (index, child) in self.children.iter_mut().enumerate() {
                if index == current {
                    continue;
                }
                child.seek(&current_key);
                if child.valid() {
                    // Child is at the first entry >= current_key; the entry
                    // before that (if any) is what backward iteration wants.
                    child.prev();
                } else {
                    // Every entry is < current_key.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Backward;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        let current = self.current.expect("key() on an invalid merging iterator");
        self.children[current].key()
    }

    fn value(&self) -> &[u8] {
        let current = self.current.expect("value() on an invalid merging iterator");
        self.children[current].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MergingIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergingIterator")
            .field("children", &self.children.len())
            .field("current", &self.current)
            .field("direction", &self.direction)
            .finish()
    }
}

/// Iterates one sorted, disjoint level: a cursor over the level's file list
/// paired with a table iterator over the file it rests on.
pub(crate) struct LevelIter<FS: Filesystem> {
    icmp:        InternalKeyComparator,
    files:       Vec<FileRef>,
    table_cache: Arc<TableCache<FS>>,
    read_opts:   ReadOptions,

    /// Index into `files`; `files.len()` means exhausted.
    index:       usize,
    data:        Option<TableIter<FS::RandomAccessFile>>,
    error:       Option<String>,
}

impl<FS: Filesystem> LevelIter<FS> {
    #[must_use]
    pub(crate) fn new(
        icmp:        InternalKeyComparator,
        files:       Vec<FileRef>,
        table_cache: Arc<TableCache<FS>>,
        read_opts:   ReadOptions,
    ) -> Self {
        let index = files.len();
        Self {
            icmp,
            files,
            table_cache,
            read_opts,
            index,
            data: None,
            error: None,
        }
    }

    /// Open the table at `self.index`, or clear the data iterator when the
    /// index is out of range.
    fn load_file(&mut self) {
        if self.index >= self.files.len() {
            self.data = None;
            return;
        }
        let file = &self.files[self.index];
        match self
            .table_cache
            .iter(file.number, file.file_size, &self.read_opts)
        {
            Ok(table_iter) => self.data = Some(table_iter),
            Err(err) => {
                if self.error.is_none() {
                    self.error = Some(err.to_string());
                }
                self.data = None;
            }
        }
    }

    fn skip_forward(&mut self) {
        while !self.data.as_ref().is_some_and(TableIter::valid) {
            if self.error.is_some() || self.index >= self.files.len() {
                self.data = None;
                return;
            }
            self.index += 1;
            self.load_file();
            if let Some(data) = &mut self.data {
                data.seek_to_first();
            }
        }
    }

    fn skip_backward(&mut self) {
        while !self.data.as_ref().is_some_and(TableIter::valid) {
            if self.error.is_some() || self.index == 0 {
                self.data = None;
                return;
            }
            self.index -= 1;
            self.load_file();
            if let Some(data) = &mut self.data {
                data.seek_to_last();
            }
        }
    }
}

impl<FS: Filesystem> InternalIterator for LevelIter<FS> {
    fn valid(&self) -> bool {
        self.data.as_ref().is_some_and(TableIter::valid)
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
        self.load_file();
        if let Some(data) = &mut self.data {
            data.seek_to_first();
        }
        if !self.valid() {
            // An empty first file cannot occur, but an open error can.
            self.skip_forward_from_invalid();
        }
    }

    fn seek_to_last(&mut self) {
        if self.files.is_empty() {
            return;
        }
        self.index = self.files.len() - 1;
        self.load_file();
        if let Some(data) = &mut self.data {
            data.seek_to_last();
        }
        self.skip_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        self.load_file();
        if let Some(data) = &mut self.data {
            data.seek(target);
        }
        self.skip_forward_from_invalid();
    }

    fn next(&mut self) {
        if let Some(data) = &mut self.data {
            data.next();
        }
        self.skip_forward_from_invalid();
    }

    fn prev(&mut self) {
        if let Some(data) = &mut self.data {
            data.prev();
        }
        self.skip_backward();
    }

    fn key(&self) -> &[u8] {
        self.data.as_ref().expect("key() on an invalid level iterator").key()
    }

    fn value(&self) -> &[u8] {
        self.data
            .as_ref()
            .expect("value() on an invalid level iterator")
            .value()
    }

    fn status(&self) -> Result<()> {
        if let Some(message) = &self.error {
            return Err(Error::corruption(message.clone()));
        }
        if let Some(data) = &self.data {
            data.status().map_err(Error::from)?;
        }
        Ok(())
    }
}

impl<FS: Filesystem> LevelIter<FS> {
    /// `skip_forward`, usable right after a seek that may have exhausted the
    /// current file.
    fn skip_forward_from_invalid(&mut self) {
        if !self.valid() {
            self.skip_forward();
        }
    }
}

impl<FS: Filesystem> std::fmt::Debug for LevelIter<FS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelIter")
            .field("files", &self.files.len())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
