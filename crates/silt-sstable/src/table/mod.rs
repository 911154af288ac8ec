//! Table files: building, opening, point lookup, and iteration.

mod builder;
mod iter;

pub use self::builder::TableBuilder;
pub use self::iter::TableIter;

use std::sync::Arc;

use silt_vfs::RandomAccess;

use crate::block::{Block, BlockIter};
use crate::cache::{BlockCacheKey, ShardedCache};
use crate::comparator::Comparator;
use crate::compress::Compression;
use crate::error::{TableError, TableResult};
use crate::filter::FilterPolicy;
use crate::filter_block::FilterBlockReader;
use crate::format::{
    BLOCK_TRAILER_LEN, BlockHandle, FILTER_META_PREFIX, Footer, unmask_checksum,
};


/// The shared cache type for uncompressed data blocks.
pub type BlockCache = ShardedCache<BlockCacheKey, Block>;

/// Options for building a table file.
#[derive(Debug, Clone)]
pub struct TableBuildOptions {
    pub cmp:                    Arc<dyn Comparator>,
    pub filter_policy:          Option<Arc<dyn FilterPolicy>>,
    pub compression:            Compression,
    /// Target uncompressed size of a data block; a block is cut at the first
    /// entry that brings it over this size.
    pub block_size:             usize,
    pub block_restart_interval: usize,
}

/// Options fixed at table-open time.
#[derive(Debug, Clone)]
pub struct TableReadOptions {
    pub cmp:           Arc<dyn Comparator>,
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
    pub block_cache:   Option<Arc<BlockCache>>,
    /// Verify block checksums while opening the table (footer-adjacent
    /// blocks); per-read verification is controlled by [`ReadAccess`].
    pub paranoid_checks: bool,
}

/// Per-read options.
#[derive(Debug, Clone, Copy)]
pub struct ReadAccess {
    pub verify_checksums: bool,
    /// Whether blocks read on behalf of this operation should populate the
    /// block cache. Scans that should not wipe the cache set this to false.
    pub fill_cache:       bool,
}

impl Default for ReadAccess {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache:       true,
        }
    }
}

/// An open, immutable table file.
///
/// Holds the parsed index block and filter; data blocks are read on demand,
/// through the block cache when one is configured. Shared via `Arc` between
/// the table cache and any open iterators.
#[derive(Debug)]
pub struct Table<F> {
    file:             F,
    opts:             TableReadOptions,
    /// This table's namespace in the block cache.
    cache_id:         u64,
    index_block:      Arc<Block>,
    filter:           Option<FilterBlockReader>,
    /// Where the metaindex begins; everything before it is entry data, which
    /// makes it the "end" answer for approximate offsets.
    metaindex_offset: u64,
}

impl<F: RandomAccess> Table<F> {
    /// Open a table file: read and verify the footer, load the index block,
    /// and load the filter block if a policy is configured.
    ///
    /// Filter problems are swallowed (the filter is an optimization); footer
    /// or index problems fail the open.
    pub fn open(opts: TableReadOptions, file: F, file_size: u64) -> TableResult<Self> {
        let footer_offset = file_size
            .checked_sub(Footer::ENCODED_LEN as u64)
            .ok_or_else(|| TableError::corruption("file too short to be a table"))?;

        let mut footer_bytes = [0_u8; Footer::ENCODED_LEN];
        file.read_exact_at(footer_offset, &mut footer_bytes)?;
        let footer = Footer::decode_from(&footer_bytes)?;

        let verify = opts.paranoid_checks;
        let index_contents = read_block_raw(&file, footer.index, verify)?;
        let index_block = Arc::new(Block::new(index_contents)?);

        let cache_id = opts
            .block_cache
            .as_ref()
            .map(|cache| cache.new_id())
            .unwrap_or(0);

        let mut table = Self {
            file,
            opts,
            cache_id,
            index_block,
            filter: None,
            metaindex_offset: footer.metaindex.offset,
        };
        table.filter = table.try_read_filter(footer.metaindex, verify);
        Ok(table)
    }

    fn try_read_filter(
        &self,
        metaindex_handle: BlockHandle,
        verify:           bool,
    ) -> Option<FilterBlockReader> {
        let policy = self.opts.filter_policy.as_ref()?;

        let metaindex_contents = read_block_raw(&self.file, metaindex_handle, verify).ok()?;
        let metaindex = Arc::new(Block::new(metaindex_contents).ok()?);

        let mut filter_key = FILTER_META_PREFIX.to_vec();
        filter_key.extend_from_slice(policy.name().as_bytes());

        // The metaindex is always in bytewise order, irrespective of the
        // table's comparator.
        let bytewise: Arc<dyn Comparator> = Arc::new(crate::comparator::BytewiseComparator);
        let mut metaindex_iter = BlockIter::new(metaindex, bytewise);
        metaindex_iter.seek(&filter_key);
        if !metaindex_iter.valid() || metaindex_iter.key() != filter_key.as_slice() {
            return None;
        }

        let (filter_handle, _) = BlockHandle::decode_from(metaindex_iter.value()).ok()?;
        let filter_contents = read_block_raw(&self.file, filter_handle, verify).ok()?;
        FilterBlockReader::new(Arc::clone(policy), filter_contents)
    }

    /// Find the first entry with key `>= key` that lives in the data block
    /// the index points at for `key`. Returns its (key, value).
    ///
    /// This is the table half of a point `get`: the caller decides whether
    /// the returned entry actually matches (same user key, visible sequence).
    pub fn get(&self, access: ReadAccess, key: &[u8]) -> TableResult<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter =
            BlockIter::new(Arc::clone(&self.index_block), Arc::clone(&self.opts.cmp));
        index_iter.seek(key);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let (handle, _) = BlockHandle::decode_from(index_iter.value())?;

        if let Some(filter) = &self.filter {
            if !filter.key_may_match(handle.offset, key) {
                return Ok(None);
            }
        }

        let block = self.read_data_block(handle, access)?;
        let mut block_iter = BlockIter::new(block, Arc::clone(&self.opts.cmp));
        block_iter.seek(key);
        if !block_iter.valid() {
            block_iter.status()?;
            return Ok(None);
        }
        Ok(Some((block_iter.key().to_vec(), block_iter.value().to_vec())))
    }

    /// An iterator over all entries, in comparator order.
    #[must_use]
    pub fn iter(self: &Arc<Self>, access: ReadAccess) -> TableIter<F> {
        TableIter::new(Arc::clone(self), access)
    }

    /// An approximate file offset where the data for `key` begins. Keys past
    /// the last entry map near the end of the file (the metaindex offset).
    #[must_use]
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let mut index_iter =
            BlockIter::new(Arc::clone(&self.index_block), Arc::clone(&self.opts.cmp));
        index_iter.seek(key);
        if index_iter.valid() {
            if let Ok((handle, _)) = BlockHandle::decode_from(index_iter.value()) {
                return handle.offset;
            }
        }
        self.metaindex_offset
    }

    pub(crate) fn index_iter(&self) -> BlockIter {
        BlockIter::new(Arc::clone(&self.index_block), Arc::clone(&self.opts.cmp))
    }

    pub(crate) fn comparator(&self) -> Arc<dyn Comparator> {
        Arc::clone(&self.opts.cmp)
    }

    /// Read the data block at `handle`, through the block cache if one is
    /// configured.
    pub(crate) fn read_data_block(
        &self,
        handle: BlockHandle,
        access: ReadAccess,
    ) -> TableResult<Arc<Block>> {
        let Some(cache) = &self.opts.block_cache else {
            let contents = read_block_raw(&self.file, handle, access.verify_checksums)?;
            return Ok(Arc::new(Block::new(contents)?));
        };

        let cache_key = BlockCacheKey {
            cache_id: self.cache_id,
            offset:   handle.offset,
        };
        if let Some(block) = cache.lookup(&cache_key) {
            return Ok(block);
        }

        let contents = read_block_raw(&self.file, handle, access.verify_checksums)?;
        let block = Block::new(contents)?;
        if access.fill_cache {
            let charge = block.charge();
            Ok(cache.insert(cache_key, block, charge))
        } else {
            Ok(Arc::new(block))
        }
    }
}

/// Read the block at `handle` plus its trailer, optionally verify the masked
/// checksum, and decompress per the trailer's type byte.
fn read_block_raw<F: RandomAccess>(
    file:   &F,
    handle: BlockHandle,
    verify: bool,
) -> TableResult<Vec<u8>> {
    let block_len = usize::try_from(handle.size)
        .map_err(|_| TableError::corruption("block size out of range"))?;

    let mut raw = vec![0_u8; block_len + BLOCK_TRAILER_LEN];
    file.read_exact_at(handle.offset, &mut raw)?;

    let (compressed, trailer) = raw.split_at(block_len);
    let type_byte = trailer[0];
    let stored_checksum = u32::from_le_bytes(trailer[1..].try_into().expect("4 bytes"));

    if verify {
        let mut digest = crc32c::crc32c(compressed);
        digest = crc32c::crc32c_append(digest, &[type_byte]);
        if digest != unmask_checksum(stored_checksum) {
            return Err(TableError::corruption("block checksum mismatch"));
        }
    }

    let mut contents = Vec::new();
    Compression::decode_into(type_byte, compressed, &mut contents)?;
    Ok(contents)
}
