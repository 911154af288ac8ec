//! Open table files, cached by file number.

use std::path::PathBuf;
use std::sync::Arc;

use silt_sstable::table::{ReadAccess, Table, TableIter, TableReadOptions};
use silt_sstable::cache::ShardedCache;
use silt_vfs::Filesystem;

use crate::error::Result;
use crate::filenames::table_file_path;
use crate::options::ReadOptions;


/// An LRU of open tables (file handle + parsed index and filter), keyed by
/// file number with unit charge, capacity `max_open_files` minus headroom.
///
/// Iterators and point lookups pin the `Arc<Table>` they use, so eviction
/// (which closes the file) never races an in-progress read.
#[derive(Debug)]
pub(crate) struct TableCache<FS: Filesystem> {
    fs:         FS,
    db_path:    PathBuf,
    table_opts: TableReadOptions,
    cache:      ShardedCache<u64, Table<FS::RandomAccessFile>>,
}

impl<FS: Filesystem> TableCache<FS> {
    pub(crate) fn new(
        fs:         FS,
        db_path:    PathBuf,
        table_opts: TableReadOptions,
        capacity:   usize,
    ) -> Self {
        Self {
            fs,
            db_path,
            table_opts,
            cache: ShardedCache::new(capacity),
        }
    }

    /// The open table for file `number`, opening (and caching) it on miss.
    pub(crate) fn table(
        &self,
        number:    u64,
        file_size: u64,
    ) -> Result<Arc<Table<FS::RandomAccessFile>>> {
        if let Some(table) = self.cache.lookup(&number) {
            return Ok(table);
        }

        let path = table_file_path(&self.fs, &self.db_path, number);
        let file = self.fs.open_random_access(&path)?;
        let table = Table::open(self.table_opts.clone(), file, file_size)?;
        Ok(self.cache.insert(number, table, 1))
    }

    /// Point-probe table `number`: the first entry at or after
    /// `internal_key` within its index-selected block, filter permitting.
    pub(crate) fn get(
        &self,
        number:       u64,
        file_size:    u64,
        read_opts:    &ReadOptions,
        internal_key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let table = self.table(number, file_size)?;
        Ok(table.get(access_from(read_opts), internal_key)?)
    }

    /// An iterator over table `number`.
    pub(crate) fn iter(
        &self,
        number:    u64,
        file_size: u64,
        read_opts: &ReadOptions,
    ) -> Result<TableIter<FS::RandomAccessFile>> {
        let table = self.table(number, file_size)?;
        Ok(table.iter(access_from(read_opts)))
    }

    /// Drop the cached handle for a deleted file.
    pub(crate) fn evict(&self, number: u64) {
        self.cache.erase(&number);
    }
}

pub(crate) fn access_from(read_opts: &ReadOptions) -> ReadAccess {
    ReadAccess {
        verify_checksums: read_opts.verify_checksums,
        fill_cache:       read_opts.fill_cache,
    }
}
