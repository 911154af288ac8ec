use std::io::{Error as IoError, ErrorKind};
use std::path::PathBuf;

use thiserror::Error;


pub type FsResult<T> = Result<T, FsError>;

/// Errors reported by [`Filesystem`] implementations.
///
/// Each variant carries the path that the failed operation targeted, since the
/// engine frequently reports filesystem failures several layers above the
/// operation that caused them.
///
/// [`Filesystem`]: crate::Filesystem
#[derive(Error, Debug)]
pub enum FsError {
    #[error("{path}: {source}")]
    Io {
        path:   PathBuf,
        source: IoError,
    },
    #[error("{path}: not found")]
    NotFound {
        path: PathBuf,
    },
}

impl FsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: IoError) -> Self {
        let path = path.into();
        if source.kind() == ErrorKind::NotFound {
            Self::NotFound { path }
        } else {
            Self::Io { path, source }
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors from acquiring or releasing an exclusive lock file.
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock is held, either by another process or by another handle within
    /// this process.
    #[error("lock on {path} is already held")]
    AlreadyHeld {
        path: PathBuf,
    },
    #[error(transparent)]
    Fs(#[from] FsError),
}
