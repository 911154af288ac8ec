use std::io::{ErrorKind, Read, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use crate::error::{FsResult, LockError};


/// A file which may be read at arbitrary positions.
///
/// Reads take `&self`: implementations must be usable from several table
/// readers at once without external synchronization (`pread` on Unix; the
/// in-memory filesystem is locked internally).
pub trait RandomAccess: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`, returning how many
    /// bytes were read. Same semantics as [`Read::read`] at a position.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<usize>;

    /// Read exactly `buf.len()` bytes starting at `offset`.
    ///
    /// Retries on [`ErrorKind::Interrupted`]; reaching end-of-file before the
    /// buffer is full is an [`ErrorKind::UnexpectedEof`] error.
    fn read_exact_at(&self, mut offset: u64, mut buf: &mut [u8]) -> IoResult<()> {
        while !buf.is_empty() {
            match self.read_at(offset, buf) {
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(read) => {
                    buf = &mut buf[read..];
                    offset += read as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Convenience alias bound for random-access files stored in shared structs.
pub trait RandomAccessFile: RandomAccess + 'static {}

impl<F: RandomAccess + 'static> RandomAccessFile for F {}

/// An append-only file with buffered writes and explicit durability control.
///
/// Implementations buffer in memory (the OS-backed one uses [`BufWriter`]);
/// `flush` pushes buffered bytes to the kernel, and `sync_data` additionally
/// forces them to persistent storage.
///
/// [`BufWriter`]: std::io::BufWriter
pub trait WritableFile: Write + Send {
    /// Force previously written data to persistent storage.
    ///
    /// Implies a flush of the userspace buffer. See [`File::sync_data`].
    ///
    /// [`File::sync_data`]: std::fs::File::sync_data
    fn sync_data(&mut self) -> IoResult<()>;
}

/// The filesystem operations the storage engine needs, and nothing more.
///
/// All paths are interpreted by the implementation; `StdFs` passes them to the
/// OS, `MemFs` uses them as map keys. Implementations must be cheaply
/// cloneable handles to shared state.
pub trait Filesystem: Clone + Send + Sync + 'static {
    type SequentialFile:   Read + Send;
    type RandomAccessFile: RandomAccessFile;
    type WritableFile:     WritableFile;
    /// An exclusive lock on a file. Dropping the value does **not** release
    /// the lock; [`Filesystem::unlock`] must be called. Not `Clone`, to avoid
    /// misuse.
    type Lockfile:         Send;

    /// Open an existing file for sequential reading from the start.
    fn open_sequential(&self, path: &Path) -> FsResult<Self::SequentialFile>;

    /// Open an existing file for positioned reads.
    fn open_random_access(&self, path: &Path) -> FsResult<Self::RandomAccessFile>;

    /// Create (or truncate) a file for appending.
    fn open_writable(&self, path: &Path) -> FsResult<Self::WritableFile>;

    /// Open a file for appending, preserving existing contents, creating the
    /// file if missing.
    fn open_appendable(&self, path: &Path) -> FsResult<Self::WritableFile>;

    fn exists(&self, path: &Path) -> FsResult<bool>;

    /// The names (not full paths) of the entries directly inside `path`.
    fn children(&self, path: &Path) -> FsResult<Vec<PathBuf>>;

    /// Size in bytes of the file at `path`.
    fn size_of(&self, path: &Path) -> FsResult<u64>;

    fn delete(&self, path: &Path) -> FsResult<()>;

    fn create_dir_all(&self, path: &Path) -> FsResult<()>;

    /// Rename a file, replacing any file already at `to`.
    fn rename(&self, from: &Path, to: &Path) -> FsResult<()>;

    /// Fsync the directory itself, so that renames and file creations within
    /// it are durable. A no-op on filesystems without that notion.
    fn sync_dir(&self, path: &Path) -> FsResult<()>;

    /// Create the file at `path` if missing and take an exclusive lock on it.
    ///
    /// Fails with [`LockError::AlreadyHeld`] if any process (including this
    /// one) holds the lock.
    fn lock(&self, path: &Path) -> Result<Self::Lockfile, LockError>;

    /// Release a lock taken by [`Filesystem::lock`]. Does not delete the file.
    fn unlock(&self, lockfile: Self::Lockfile) -> Result<(), LockError>;
}
