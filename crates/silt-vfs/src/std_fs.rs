use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Result as IoResult, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use fs4::fs_std::FileExt as FileLockExt;
use parking_lot::Mutex;

use crate::error::{FsError, FsResult, LockError};
use crate::traits::{Filesystem, RandomAccess, WritableFile};


/// Paths locked by this process.
///
/// OS advisory locks do not reliably exclude a second lock taken by the same
/// process (POSIX `flock` re-grants it to the same file description owner on
/// some platforms), so double-opens within one process are caught here.
fn locked_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static LOCKED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    LOCKED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// The operating system's filesystem.
#[derive(Default, Debug, Clone, Copy)]
pub struct StdFs;

/// A buffered append-only file. See [`WritableFile`].
#[derive(Debug)]
pub struct StdWritableFile {
    writer: BufWriter<File>,
}

impl Write for StdWritableFile {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.writer.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> IoResult<()> {
        self.writer.flush()
    }
}

impl WritableFile for StdWritableFile {
    fn sync_data(&mut self) -> IoResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }
}

/// A file open for positioned reads.
///
/// On Unix and Windows, `read_at` does not move any file cursor, so one handle
/// may serve concurrent readers.
#[derive(Debug)]
pub struct StdRandomAccessFile {
    file: File,
}

#[cfg(unix)]
impl RandomAccess for StdRandomAccessFile {
    #[inline]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
        std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)
    }
}

#[cfg(windows)]
impl RandomAccess for StdRandomAccessFile {
    #[inline]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
        std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset)
    }
}

/// An exclusively locked file. Returned by [`StdFs::lock`][Filesystem::lock].
#[derive(Debug)]
pub struct StdLockfile {
    file: File,
    path: PathBuf,
}

impl Filesystem for StdFs {
    type SequentialFile   = File;
    type RandomAccessFile = StdRandomAccessFile;
    type WritableFile     = StdWritableFile;
    type Lockfile         = StdLockfile;

    fn open_sequential(&self, path: &Path) -> FsResult<Self::SequentialFile> {
        File::open(path).map_err(|err| FsError::io(path, err))
    }

    fn open_random_access(&self, path: &Path) -> FsResult<Self::RandomAccessFile> {
        let file = File::open(path).map_err(|err| FsError::io(path, err))?;
        Ok(StdRandomAccessFile { file })
    }

    fn open_writable(&self, path: &Path) -> FsResult<Self::WritableFile> {
        let file = File::create(path).map_err(|err| FsError::io(path, err))?;
        Ok(StdWritableFile {
            writer: BufWriter::new(file),
        })
    }

    fn open_appendable(&self, path: &Path) -> FsResult<Self::WritableFile> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|err| FsError::io(path, err))?;
        Ok(StdWritableFile {
            writer: BufWriter::new(file),
        })
    }

    fn exists(&self, path: &Path) -> FsResult<bool> {
        fs::exists(path).map_err(|err| FsError::io(path, err))
    }

    fn children(&self, path: &Path) -> FsResult<Vec<PathBuf>> {
        let entries = fs::read_dir(path).map_err(|err| FsError::io(path, err))?;

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| FsError::io(path, err))?;
            children.push(PathBuf::from(entry.file_name()));
        }
        Ok(children)
    }

    fn size_of(&self, path: &Path) -> FsResult<u64> {
        let metadata = fs::metadata(path).map_err(|err| FsError::io(path, err))?;
        Ok(metadata.len())
    }

    fn delete(&self, path: &Path) -> FsResult<()> {
        fs::remove_file(path).map_err(|err| FsError::io(path, err))
    }

    fn create_dir_all(&self, path: &Path) -> FsResult<()> {
        fs::create_dir_all(path).map_err(|err| FsError::io(path, err))
    }

    fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        fs::rename(from, to).map_err(|err| FsError::io(from, err))
    }

    fn sync_dir(&self, path: &Path) -> FsResult<()> {
        // Windows cannot open directories as files; renames there are
        // already durable enough for the CURRENT-swap protocol.
        #[cfg(unix)]
        {
            let dir = File::open(path).map_err(|err| FsError::io(path, err))?;
            dir.sync_all().map_err(|err| FsError::io(path, err))?;
        }
        #[cfg(not(unix))]
        let _ = path;
        Ok(())
    }

    fn lock(&self, path: &Path) -> Result<Self::Lockfile, LockError> {
        let canonical = normalized(path);

        {
            let mut locked = locked_paths().lock();
            if !locked.insert(canonical.clone()) {
                return Err(LockError::AlreadyHeld { path: canonical });
            }
        }

        let locked_file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .and_then(|file| {
                match FileLockExt::try_lock_exclusive(&file) {
                    Ok(true)  => Ok(Some(file)),
                    Ok(false) => Ok(None),
                    Err(err)  => Err(err),
                }
            });

        match locked_file {
            Ok(Some(file)) => Ok(StdLockfile {
                file,
                path: canonical,
            }),
            Ok(None) => {
                locked_paths().lock().remove(&canonical);
                Err(LockError::AlreadyHeld { path: canonical })
            }
            Err(err) => {
                locked_paths().lock().remove(&canonical);
                Err(LockError::Fs(FsError::io(path, err)))
            }
        }
    }

    fn unlock(&self, lockfile: Self::Lockfile) -> Result<(), LockError> {
        let result = FileLockExt::unlock(&lockfile.file)
            .map_err(|err| LockError::Fs(FsError::io(&lockfile.path, err)));
        locked_paths().lock().remove(&lockfile.path);
        result
    }
}

/// Best-effort canonical form of `path` for the in-process lock registry.
///
/// Canonicalization requires the path to exist; fall back to the path as
/// given, which still catches the common double-open case.
fn normalized(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_owned())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_in_process_lock_fails() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("LOCK");

        let fs = StdFs;
        let held = fs.lock(&lock_path).unwrap();
        assert!(matches!(
            fs.lock(&lock_path),
            Err(LockError::AlreadyHeld { .. }),
        ));

        fs.unlock(held).unwrap();
        let reheld = fs.lock(&lock_path).unwrap();
        fs.unlock(reheld).unwrap();
    }

    #[test]
    fn append_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");

        let fs = StdFs;
        let mut file = fs.open_writable(&path).unwrap();
        file.write_all(b"hello ").unwrap();
        file.flush().unwrap();
        drop(file);

        let mut file = fs.open_appendable(&path).unwrap();
        file.write_all(b"world").unwrap();
        file.sync_data().unwrap();
        drop(file);

        assert_eq!(fs.size_of(&path).unwrap(), 11);

        let random = fs.open_random_access(&path).unwrap();
        let mut buf = [0_u8; 5];
        random.read_exact_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }
}
