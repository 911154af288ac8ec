use silt_vfs::WritableFile;

use crate::block::BlockBuilder;
use crate::compress::Compression;
use crate::error::TableResult;
use crate::filter_block::FilterBlockBuilder;
use crate::format::{BLOCK_TRAILER_LEN, BlockHandle, FILTER_META_PREFIX, Footer, mask_checksum};
use super::TableBuildOptions;


/// Writes a table file from entries added in strictly increasing key order.
///
/// The builder owns the destination file until [`finish`] consumes it; an
/// abandoned builder leaves behind an unfinished, invalid file, which the
/// engine deletes as an orphan.
///
/// [`finish`]: TableBuilder::finish
#[derive(Debug)]
pub struct TableBuilder<W> {
    opts:          TableBuildOptions,
    file:          W,
    offset:        u64,
    num_entries:   usize,

    data_block:    BlockBuilder,
    index_block:   BlockBuilder,
    filter_block:  Option<FilterBlockBuilder>,

    /// Set when a data block has been cut but its index entry not yet
    /// written: the entry waits for the next key, so the separator can be
    /// shortened against it.
    pending_index: Option<BlockHandle>,
    last_key:      Vec<u8>,
    scratch:       Vec<u8>,
}

impl<W: WritableFile> TableBuilder<W> {
    #[must_use]
    pub fn new(opts: TableBuildOptions, file: W) -> Self {
        let filter_block = opts.filter_policy.clone().map(|policy| {
            let mut builder = FilterBlockBuilder::new(policy);
            builder.start_block(0);
            builder
        });
        Self {
            data_block:    BlockBuilder::new(opts.block_restart_interval),
            // Index blocks restart at every entry: separator keys share
            // little, and restart-only blocks binary-search fastest.
            index_block:   BlockBuilder::new(1),
            filter_block,
            opts,
            file,
            offset:        0,
            num_entries:   0,
            pending_index: None,
            last_key:      Vec::new(),
            scratch:       Vec::new(),
        }
    }

    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// An estimate of the file size so far: finished blocks plus the
    /// uncompressed pending data block.
    #[must_use]
    pub fn file_size_estimate(&self) -> u64 {
        self.offset + self.data_block.bytes_estimate() as u64
    }

    /// Add an entry. `key` must be strictly greater than every key added
    /// before it, under the comparator in the build options.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> TableResult<()> {
        self.flush_pending_index(Some(key));

        if let Some(filter_block) = &mut self.filter_block {
            filter_block.add_key(key);
        }

        self.data_block.add(key, value);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;

        if self.data_block.bytes_estimate() >= self.opts.block_size {
            self.cut_data_block()?;
        }
        Ok(())
    }

    /// Write everything that remains - final data block, filter, metaindex,
    /// index, footer - flush, and return the file with the total size in
    /// bytes. The caller decides whether to fsync.
    pub fn finish(mut self) -> TableResult<(W, u64)> {
        if !self.data_block.is_empty() {
            self.cut_data_block()?;
        }
        self.flush_pending_index(None);

        // Filter block, if any. Filters are near-incompressible bitmaps, so
        // they are stored plain.
        let filter_entry = match self.filter_block.take() {
            Some(filter_block) => {
                let name = filter_block.policy_name();
                let contents = filter_block.finish();
                let handle = write_block_to(
                    &mut self.file,
                    &mut self.offset,
                    &contents,
                    Compression::None,
                )?;
                Some((name, handle))
            }
            None => None,
        };

        // Metaindex block; the data block builder is free again and is
        // reused for it.
        self.data_block.reset();
        if let Some((policy_name, handle)) = filter_entry {
            let mut meta_key = FILTER_META_PREFIX.to_vec();
            meta_key.extend_from_slice(policy_name.as_bytes());
            self.scratch.clear();
            handle.encode_to(&mut self.scratch);
            self.data_block.add(&meta_key, &self.scratch);
        }
        let metaindex = write_block_to(
            &mut self.file,
            &mut self.offset,
            self.data_block.finish(),
            self.opts.compression,
        )?;

        let index = write_block_to(
            &mut self.file,
            &mut self.offset,
            self.index_block.finish(),
            self.opts.compression,
        )?;

        self.scratch.clear();
        Footer { metaindex, index }.encode_to(&mut self.scratch);
        self.file.write_all(&self.scratch)?;
        self.offset += self.scratch.len() as u64;

        self.file.flush()?;
        Ok((self.file, self.offset))
    }

    /// Cut the current data block: write it out and defer its index entry
    /// until the next key (or the end of the table).
    fn cut_data_block(&mut self) -> TableResult<()> {
        debug_assert!(!self.data_block.is_empty(), "cutting an empty data block");
        debug_assert!(self.pending_index.is_none(), "index entry still pending");

        let handle = write_block_to(
            &mut self.file,
            &mut self.offset,
            self.data_block.finish(),
            self.opts.compression,
        )?;
        self.data_block.reset();
        self.pending_index = Some(handle);

        if let Some(filter_block) = &mut self.filter_block {
            filter_block.start_block(self.offset);
        }
        Ok(())
    }

    /// Emit the deferred index entry, with a separator shortened toward
    /// `next_key` (or a short successor of the last key at the end).
    fn flush_pending_index(&mut self, next_key: Option<&[u8]>) {
        let Some(handle) = self.pending_index.take() else {
            return;
        };

        let mut separator = Vec::new();
        match next_key {
            Some(next_key) => {
                self.opts
                    .cmp
                    .find_short_separator(&self.last_key, next_key, &mut separator);
            }
            None => {
                self.opts.cmp.find_short_successor(&self.last_key, &mut separator);
            }
        }

        self.scratch.clear();
        handle.encode_to(&mut self.scratch);
        self.index_block.add(&separator, &self.scratch);
    }
}

/// Write one block followed by its trailer; returns the block's handle.
fn write_block_to<W: WritableFile>(
    file:        &mut W,
    offset:      &mut u64,
    contents:    &[u8],
    compression: Compression,
) -> TableResult<BlockHandle> {
    let mut compressed = Vec::new();
    let used = compression.encode_into(contents, &mut compressed)?;
    let type_byte = used.type_byte();

    let mut digest = crc32c::crc32c(&compressed);
    digest = crc32c::crc32c_append(digest, &[type_byte]);
    let masked = mask_checksum(digest);

    file.write_all(&compressed)?;
    file.write_all(&[type_byte])?;
    file.write_all(&masked.to_le_bytes())?;

    let handle = BlockHandle {
        offset: *offset,
        size:   compressed.len() as u64,
    };
    *offset += handle.size + BLOCK_TRAILER_LEN as u64;
    Ok(handle)
}
