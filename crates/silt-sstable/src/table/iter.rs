use std::sync::Arc;

use silt_vfs::RandomAccess;

use crate::block::BlockIter;
use crate::error::{TableError, TableResult};
use crate::format::BlockHandle;
use super::{ReadAccess, Table};


/// Iterates a whole table: an index-block cursor paired with a cursor over
/// the data block the index currently points at.
///
/// Blocks are fetched lazily (through the block cache) as the index cursor
/// moves. Errors - I/O or corruption - make the iterator invalid and are
/// reported through [`TableIter::status`].
pub struct TableIter<F> {
    table:       Arc<Table<F>>,
    access:      ReadAccess,
    index_iter:  BlockIter,
    data_iter:   Option<BlockIter>,
    /// Handle of the block `data_iter` is over, to skip redundant reloads
    /// when the index lands on the same entry again.
    data_handle: Option<BlockHandle>,
    corruption:  Option<String>,
}

impl<F: RandomAccess> TableIter<F> {
    pub(super) fn new(table: Arc<Table<F>>, access: ReadAccess) -> Self {
        let index_iter = table.index_iter();
        Self {
            table,
            access,
            index_iter,
            data_iter:   None,
            data_handle: None,
            corruption:  None,
        }
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(BlockIter::valid)
    }

    pub fn status(&self) -> TableResult<()> {
        if let Some(message) = &self.corruption {
            return Err(TableError::corruption(message.clone()));
        }
        self.index_iter.status()?;
        if let Some(data_iter) = &self.data_iter {
            data_iter.status()?;
        }
        Ok(())
    }

    /// # Panics
    /// Panics if the iterator is not `valid()`.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        self.data_iter
            .as_ref()
            .expect("key() on an invalid table iterator")
            .key()
    }

    /// # Panics
    /// Panics if the iterator is not `valid()`.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        self.data_iter
            .as_ref()
            .expect("value() on an invalid table iterator")
            .value()
    }

    pub fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.load_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek_to_first();
        }
        self.skip_empty_blocks_forward();
    }

    pub fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.load_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek_to_last();
        }
        self.skip_empty_blocks_backward();
    }

    /// Position on the first entry with key `>= target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.load_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek(target);
        }
        self.skip_empty_blocks_forward();
    }

    /// # Panics
    /// Panics if the iterator is not `valid()`.
    pub fn next(&mut self) {
        let data_iter = self
            .data_iter
            .as_mut()
            .expect("next() on an invalid table iterator");
        data_iter.next();
        self.skip_empty_blocks_forward();
    }

    /// # Panics
    /// Panics if the iterator is not `valid()`.
    pub fn prev(&mut self) {
        let data_iter = self
            .data_iter
            .as_mut()
            .expect("prev() on an invalid table iterator");
        data_iter.prev();
        self.skip_empty_blocks_backward();
    }

    /// While the data cursor is exhausted, move the index forward and enter
    /// the next block from its start.
    fn skip_empty_blocks_forward(&mut self) {
        while !self.valid() {
            if self.take_data_error() || !self.index_iter.valid() {
                self.data_iter = None;
                self.data_handle = None;
                return;
            }
            self.index_iter.next();
            self.load_data_block();
            if let Some(data_iter) = &mut self.data_iter {
                data_iter.seek_to_first();
            }
        }
    }

    /// While the data cursor is exhausted, move the index backward and enter
    /// the previous block from its end.
    fn skip_empty_blocks_backward(&mut self) {
        while !self.valid() {
            if self.take_data_error() || !self.index_iter.valid() {
                self.data_iter = None;
                self.data_handle = None;
                return;
            }
            self.index_iter.prev();
            self.load_data_block();
            if let Some(data_iter) = &mut self.data_iter {
                data_iter.seek_to_last();
            }
        }
    }

    /// Whether the current data cursor stopped because of corruption rather
    /// than running off either end; if so, latch its message before the
    /// cursor is dropped.
    fn take_data_error(&mut self) -> bool {
        let error = self
            .data_iter
            .as_ref()
            .and_then(|data_iter| data_iter.status().err());
        match error {
            Some(err) => {
                if self.corruption.is_none() {
                    self.corruption = Some(err.to_string());
                }
                true
            }
            None => false,
        }
    }

    /// Point `data_iter` at the block the index cursor references, or clear
    /// it when the index is exhausted (or its value corrupt).
    fn load_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            self.data_handle = None;
            return;
        }

        let handle = match BlockHandle::decode_from(self.index_iter.value()) {
            Ok((handle, _)) => handle,
            Err(err) => {
                self.corrupt(&format!("bad index entry: {err}"));
                return;
            }
        };

        if self.data_handle == Some(handle) && self.data_iter.is_some() {
            return;
        }

        match self.table.read_data_block(handle, self.access) {
            Ok(block) => {
                self.data_iter = Some(BlockIter::new(block, self.table.comparator()));
                self.data_handle = Some(handle);
            }
            Err(err) => {
                self.corrupt(&err.to_string());
            }
        }
    }

    fn corrupt(&mut self, message: &str) {
        if self.corruption.is_none() {
            self.corruption = Some(message.to_owned());
        }
        self.data_iter = None;
        self.data_handle = None;
    }
}

impl<F> std::fmt::Debug for TableIter<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableIter")
            .field("valid", &self.data_iter.as_ref().is_some_and(BlockIter::valid))
            .field("corruption", &self.corruption)
            .finish_non_exhaustive()
    }
}
