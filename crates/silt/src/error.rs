use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io::Error as IoError;

use silt_sstable::TableError;
use silt_vfs::{FsError, LockError};


pub type Result<T> = std::result::Result<T, Error>;

/// The classes of failure the engine reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The requested key (or database) does not exist. Never fatal.
    NotFound,
    /// Stored bytes are not what they claim to be: a failed checksum, a
    /// malformed record, an impossible catalog.
    Corruption,
    NotSupported,
    InvalidArgument,
    /// The environment failed underneath the engine.
    Io,
}

impl ErrorKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound        => "not found",
            Self::Corruption      => "corruption",
            Self::NotSupported    => "not supported",
            Self::InvalidArgument => "invalid argument",
            Self::Io              => "I/O error",
        }
    }
}

/// An engine error: a kind plus human-readable context.
///
/// Errors are freely cloned - the write path latches one as the background
/// error and re-reports it to every subsequent writer.
#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    message:  String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Corruption, message)
    }

    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for Error {}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Self::io(err.to_string())
    }
}

impl From<FsError> for Error {
    fn from(err: FsError) -> Self {
        if err.is_not_found() {
            Self::not_found(err.to_string())
        } else {
            Self::io(err.to_string())
        }
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        Self::io(err.to_string())
    }
}

impl From<TableError> for Error {
    fn from(err: TableError) -> Self {
        match err {
            TableError::Corruption(message) => Self::corruption(message),
            TableError::Io(io_err)          => Self::io(io_err.to_string()),
            TableError::Fs(fs_err)          => Self::from(fs_err),
        }
    }
}
