use std::io::Result as IoResult;

use silt_vfs::WritableFile;

use crate::config::LOG_BLOCK_SIZE;
use crate::format::mask_checksum;
use super::{LOG_HEADER_LEN, RecordType};


/// Appends framed records to a log file.
///
/// Every [`add_record`] ends with a flush into the kernel; durability beyond
/// that is the caller's choice via [`sync`].
///
/// [`add_record`]: LogWriter::add_record
/// [`sync`]: LogWriter::sync
#[derive(Debug)]
pub(crate) struct LogWriter<W> {
    file:            W,
    /// CRC32C of each type byte, precomputed; fragment checksums extend
    /// these with the fragment payload.
    type_crcs:       [u32; RecordType::ALL.len()],
    /// Bytes still unused in the current 32 KiB block.
    remaining_space: usize,
}

impl<W: WritableFile> LogWriter<W> {
    /// A writer for an empty (or fresh) log file.
    #[must_use]
    pub(crate) fn new(file: W) -> Self {
        Self::with_offset(file, 0)
    }

    /// A writer resuming at byte `offset` of an existing log file; used when
    /// a cleanly recovered log is reused on open.
    #[must_use]
    pub(crate) fn with_offset(file: W, offset: u64) -> Self {
        let offset_in_block = (offset % LOG_BLOCK_SIZE as u64) as usize;
        Self {
            file,
            type_crcs: RecordType::ALL.map(|record_type| crc32c::crc32c(&[record_type as u8])),
            remaining_space: LOG_BLOCK_SIZE - offset_in_block,
        }
    }

    /// Append one logical record and flush.
    pub(crate) fn add_record(&mut self, mut record: &[u8]) -> IoResult<()> {
        let mut first_fragment = true;

        // An empty record is written as one empty FULL fragment.
        while !record.is_empty() || first_fragment {
            if self.remaining_space < LOG_HEADER_LEN {
                // Zero-fill the block tail; the record starts the next block.
                const ZEROES: [u8; LOG_HEADER_LEN - 1] = [0; LOG_HEADER_LEN - 1];
                self.file.write_all(&ZEROES[..self.remaining_space])?;
                self.remaining_space = LOG_BLOCK_SIZE;
            }

            let fragment_len = record.len().min(self.remaining_space - LOG_HEADER_LEN);
            let last_fragment = fragment_len == record.len();

            let record_type = match (first_fragment, last_fragment) {
                (true, true)   => RecordType::Full,
                (true, false)  => RecordType::First,
                (false, false) => RecordType::Middle,
                (false, true)  => RecordType::Last,
            };

            let (fragment, rest) = record.split_at(fragment_len);
            self.write_fragment(record_type, fragment)?;

            record = rest;
            first_fragment = false;
            self.remaining_space -= LOG_HEADER_LEN + fragment_len;
        }

        self.file.flush()
    }

    /// Force everything written so far to persistent storage.
    pub(crate) fn sync(&mut self) -> IoResult<()> {
        self.file.sync_data()
    }

    fn write_fragment(&mut self, record_type: RecordType, fragment: &[u8]) -> IoResult<()> {
        let type_crc = self.type_crcs[record_type as u8 as usize - 1];
        let checksum = mask_checksum(crc32c::crc32c_append(type_crc, fragment));
        let length = u16::try_from(fragment.len()).expect("fragment fits a block");

        self.file.write_all(&checksum.to_le_bytes())?;
        self.file.write_all(&length.to_le_bytes())?;
        self.file.write_all(&[record_type as u8])?;
        self.file.write_all(fragment)
    }
}
