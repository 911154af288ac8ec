//! The framed record log used for write-ahead logs and the MANIFEST.
//!
//! The file is a sequence of 32 KiB blocks. Records never span block
//! boundaries physically: a logical record that does not fit is split into
//! FIRST/MIDDLE/LAST fragments, each with its own 7-byte header
//! `masked_crc32c (4 LE) || length (2 LE) || type (1)`. When fewer than 7
//! bytes remain in a block they are zero-filled and the next record starts
//! at the next block boundary.

mod reader;
mod writer;

pub(crate) use self::reader::LogReader;
pub(crate) use self::writer::LogWriter;


/// Fragment header length.
pub(crate) const LOG_HEADER_LEN: usize = 4 + 2 + 1;

/// Fragment types. Zero is reserved so that preallocated (zeroed) file
/// regions read as broken records rather than valid empty ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecordType {
    Full   = 1,
    First  = 2,
    Middle = 3,
    Last   = 4,
}

impl RecordType {
    pub(crate) const ALL: [Self; 4] = [Self::Full, Self::First, Self::Middle, Self::Last];

    #[must_use]
    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Full),
            2 => Some(Self::First),
            3 => Some(Self::Middle),
            4 => Some(Self::Last),
            _ => None,
        }
    }
}


#[cfg(test)]
mod tests;
