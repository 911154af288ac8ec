use std::io::{ErrorKind, Read};

use crate::config::LOG_BLOCK_SIZE;
use crate::format::unmask_checksum;
use super::{LOG_HEADER_LEN, RecordType};


/// Receives corruption notices during log replay: how many bytes were given
/// up on and why.
///
/// A truncated record at the very end of the log is *not* reported - that is
/// the expected shape of a crash during the final write, and replay simply
/// stops there.
pub(crate) trait CorruptionReporter {
    fn corruption(&mut self, bytes_dropped: usize, reason: &str);
}

impl<F: FnMut(usize, &str)> CorruptionReporter for F {
    fn corruption(&mut self, bytes_dropped: usize, reason: &str) {
        self(bytes_dropped, reason);
    }
}

/// Reads logical records back out of a framed log.
///
/// Damaged fragments are skipped (reported to the [`CorruptionReporter`]),
/// and reading continues with the next intact record; the caller decides
/// whether any corruption is fatal.
pub(crate) struct LogReader<'r, R> {
    file:            R,
    reporter:        Box<dyn CorruptionReporter + 'r>,
    /// The current block. Full blocks are `LOG_BLOCK_SIZE` long; a shorter
    /// buffer means this is the file's final block.
    block:           Vec<u8>,
    /// Parse position within `block`.
    offset_in_block: usize,
    /// Whether the final block has been read.
    at_eof:          bool,
    /// Reassembly buffer for fragmented records.
    fragments:       Vec<u8>,
    /// Whether `fragments` holds a started (FIRST seen) record.
    in_fragmented:   bool,
}

enum Fragment {
    Data(RecordType, Vec<u8>),
    EndOfFile,
    Damaged,
}

impl<'r, R: Read> LogReader<'r, R> {
    pub(crate) fn new(file: R, reporter: impl CorruptionReporter + 'r) -> Self {
        Self {
            file,
            reporter: Box::new(reporter),
            block: Vec::new(),
            offset_in_block: 0,
            at_eof: false,
            fragments: Vec::new(),
            in_fragmented: false,
        }
    }

    /// The next intact logical record, or `None` at end of log.
    pub(crate) fn read_record(&mut self) -> Option<Vec<u8>> {
        self.in_fragmented = false;
        self.fragments.clear();

        loop {
            match self.read_fragment() {
                Fragment::Data(RecordType::Full, data) => {
                    if self.in_fragmented && !self.fragments.is_empty() {
                        self.reporter.corruption(
                            self.fragments.len(),
                            "FULL record inside a fragmented record",
                        );
                    }
                    return Some(data);
                }
                Fragment::Data(RecordType::First, data) => {
                    if self.in_fragmented && !self.fragments.is_empty() {
                        self.reporter.corruption(
                            self.fragments.len(),
                            "second FIRST record inside a fragmented record",
                        );
                    }
                    self.in_fragmented = true;
                    self.fragments.clear();
                    self.fragments.extend_from_slice(&data);
                }
                Fragment::Data(RecordType::Middle, data) => {
                    if self.in_fragmented {
                        self.fragments.extend_from_slice(&data);
                    } else {
                        self.reporter
                            .corruption(data.len(), "MIDDLE record without a FIRST");
                    }
                }
                Fragment::Data(RecordType::Last, data) => {
                    if self.in_fragmented {
                        self.fragments.extend_from_slice(&data);
                        return Some(std::mem::take(&mut self.fragments));
                    }
                    self.reporter
                        .corruption(data.len(), "LAST record without a FIRST");
                }
                Fragment::EndOfFile => {
                    // A fragmented record with no LAST before end-of-file is
                    // the signature of a crash mid-write: silently dropped.
                    return None;
                }
                Fragment::Damaged => {
                    if self.in_fragmented {
                        self.reporter.corruption(
                            self.fragments.len(),
                            "error in the middle of a fragmented record",
                        );
                        self.in_fragmented = false;
                        self.fragments.clear();
                    }
                }
            }
        }
    }

    fn read_fragment(&mut self) -> Fragment {
        loop {
            if self.offset_in_block + LOG_HEADER_LEN > self.block.len() {
                // Block tail (zero padding or a truncated header): move on.
                if self.at_eof {
                    return Fragment::EndOfFile;
                }
                if !self.fill_block() {
                    return Fragment::Damaged;
                }
                continue;
            }

            let header = &self.block[self.offset_in_block..self.offset_in_block + LOG_HEADER_LEN];
            let stored_checksum = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
            let length = usize::from(u16::from_le_bytes(header[4..6].try_into().expect("2 bytes")));
            let type_byte = header[6];

            let bytes_to_block_end = self.block.len() - self.offset_in_block;

            if LOG_HEADER_LEN + length > LOG_BLOCK_SIZE - self.offset_in_block {
                // The claimed length cannot fit the block it started in: the
                // length field itself is garbage. Skip the rest of the block.
                self.reporter.corruption(bytes_to_block_end, "bad record length");
                self.offset_in_block = self.block.len();
                return Fragment::Damaged;
            }

            if LOG_HEADER_LEN + length > bytes_to_block_end {
                // The fragment runs past the end of a final, short block: a
                // write was cut off mid-fragment. Not reported.
                debug_assert!(self.at_eof, "only the final block may be short");
                return Fragment::EndOfFile;
            }

            if type_byte == 0 && length == 0 {
                // Zero type and length: preallocated-but-unwritten space.
                self.offset_in_block = self.block.len();
                return Fragment::Damaged;
            }

            let payload_start = self.offset_in_block + LOG_HEADER_LEN;
            let payload = &self.block[payload_start..payload_start + length];

            let computed = crc32c::crc32c(&self.block[self.offset_in_block + 6..payload_start + length]);
            if computed != unmask_checksum(stored_checksum) {
                // The length field may be wrong too; drop the whole rest of
                // the block.
                self.reporter.corruption(bytes_to_block_end, "checksum mismatch");
                self.offset_in_block = self.block.len();
                return Fragment::Damaged;
            }

            let Some(record_type) = RecordType::from_byte(type_byte) else {
                self.reporter
                    .corruption(length, &format!("unknown record type {type_byte}"));
                self.offset_in_block = payload_start + length;
                return Fragment::Damaged;
            };

            let data = payload.to_vec();
            self.offset_in_block = payload_start + length;
            return Fragment::Data(record_type, data);
        }
    }

    /// Read the next 32 KiB block (or the shorter final one). Returns false
    /// on a read error, which is reported and treated as end-of-log.
    fn fill_block(&mut self) -> bool {
        self.block.resize(LOG_BLOCK_SIZE, 0);
        self.offset_in_block = 0;

        let mut filled = 0;
        while filled < LOG_BLOCK_SIZE {
            match self.file.read(&mut self.block[filled..]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    self.reporter
                        .corruption(filled, &format!("log read failed: {err}"));
                    self.block.clear();
                    self.at_eof = true;
                    return false;
                }
            }
        }

        self.block.truncate(filled);
        if filled < LOG_BLOCK_SIZE {
            self.at_eof = true;
        }
        filled > 0
    }
}

impl<R> std::fmt::Debug for LogReader<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReader")
            .field("offset_in_block", &self.offset_in_block)
            .field("at_eof", &self.at_eof)
            .field("in_fragmented", &self.in_fragmented)
            .finish_non_exhaustive()
    }
}
