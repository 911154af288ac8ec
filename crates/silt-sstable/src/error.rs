use std::io::Error as IoError;

use thiserror::Error;

use silt_vfs::FsError;


pub type TableResult<T> = Result<T, TableError>;

/// Errors from building or reading tables.
///
/// A `Corruption` means the bytes on disk are not a valid table (bad magic,
/// failed checksum, malformed varint, out-of-range handle); `Io` and `Fs`
/// mean the bytes could not be obtained at all.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("corruption: {0}")]
    Corruption(String),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Fs(#[from] FsError),
}

impl TableError {
    pub(crate) fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption(message.into())
    }
}
