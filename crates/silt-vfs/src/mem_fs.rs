use std::collections::{HashMap, HashSet};
use std::io::{Read, Result as IoResult, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{FsError, FsResult, LockError};
use crate::traits::{Filesystem, RandomAccess, WritableFile};


type FileContents = Arc<RwLock<Vec<u8>>>;

#[derive(Default, Debug)]
struct MemFsState {
    files:       HashMap<PathBuf, FileContents>,
    directories: HashSet<PathBuf>,
    locked:      HashSet<PathBuf>,
}

/// A filesystem held entirely in memory, shared between clones.
///
/// Used by tests to exercise recovery and corruption handling without
/// touching the disk: file contents can be inspected and rewritten directly
/// through [`MemFs::read_file`] and [`MemFs::overwrite_file`], and "crashes"
/// are simulated by simply reopening a database against the same `MemFs`.
#[derive(Default, Debug, Clone)]
pub struct MemFs {
    state: Arc<Mutex<MemFsState>>,
}

impl MemFs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the contents of the file at `path`, for test inspection.
    pub fn read_file(&self, path: &Path) -> FsResult<Vec<u8>> {
        let contents = self.contents_of(path)?;
        let contents = contents.read();
        Ok(contents.clone())
    }

    /// Replace the contents of the file at `path`, for corruption injection.
    pub fn overwrite_file(&self, path: &Path, new_contents: Vec<u8>) -> FsResult<()> {
        let contents = self.contents_of(path)?;
        *contents.write() = new_contents;
        Ok(())
    }

    fn contents_of(&self, path: &Path) -> FsResult<FileContents> {
        let state = self.state.lock();
        state
            .files
            .get(&normalized(path))
            .cloned()
            .ok_or_else(|| FsError::NotFound {
                path: path.to_owned(),
            })
    }
}

/// A handle to an in-memory file, usable for both sequential and positioned
/// reads. Sequential reads advance `position`.
#[derive(Debug)]
pub struct MemFile {
    contents: FileContents,
    position: usize,
}

impl Read for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let contents = self.contents.read();
        let remaining = contents.len().saturating_sub(self.position);
        let to_copy = remaining.min(buf.len());
        buf[..to_copy].copy_from_slice(&contents[self.position..self.position + to_copy]);
        self.position += to_copy;
        Ok(to_copy)
    }
}

impl RandomAccess for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
        let contents = self.contents.read();
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        let remaining = contents.len().saturating_sub(offset);
        let to_copy = remaining.min(buf.len());
        buf[..to_copy].copy_from_slice(&contents[offset..offset + to_copy]);
        Ok(to_copy)
    }
}

/// An in-memory append-only file. Writes go straight to the shared buffer;
/// `flush` and `sync_data` are no-ops.
#[derive(Debug)]
pub struct MemWritableFile {
    contents: FileContents,
}

impl Write for MemWritableFile {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.contents.write().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}

impl WritableFile for MemWritableFile {
    fn sync_data(&mut self) -> IoResult<()> {
        Ok(())
    }
}

/// Witness that a [`MemFs`] path is exclusively locked.
#[derive(Debug)]
pub struct MemLockfile {
    path: PathBuf,
}

impl Filesystem for MemFs {
    type SequentialFile   = MemFile;
    type RandomAccessFile = MemFile;
    type WritableFile     = MemWritableFile;
    type Lockfile         = MemLockfile;

    fn open_sequential(&self, path: &Path) -> FsResult<Self::SequentialFile> {
        let contents = self.contents_of(path)?;
        Ok(MemFile {
            contents,
            position: 0,
        })
    }

    fn open_random_access(&self, path: &Path) -> FsResult<Self::RandomAccessFile> {
        let contents = self.contents_of(path)?;
        Ok(MemFile {
            contents,
            position: 0,
        })
    }

    fn open_writable(&self, path: &Path) -> FsResult<Self::WritableFile> {
        let path = normalized(path);
        let mut state = self.state.lock();
        let contents = state.files.entry(path).or_default().clone();
        contents.write().clear();
        Ok(MemWritableFile { contents })
    }

    fn open_appendable(&self, path: &Path) -> FsResult<Self::WritableFile> {
        let path = normalized(path);
        let mut state = self.state.lock();
        let contents = state.files.entry(path).or_default().clone();
        Ok(MemWritableFile { contents })
    }

    fn exists(&self, path: &Path) -> FsResult<bool> {
        let path = normalized(path);
        let state = self.state.lock();
        Ok(state.files.contains_key(&path) || state.directories.contains(&path))
    }

    fn children(&self, path: &Path) -> FsResult<Vec<PathBuf>> {
        let path = normalized(path);
        let state = self.state.lock();

        let mut children: Vec<PathBuf> = state
            .files
            .keys()
            .chain(state.directories.iter())
            .filter(|candidate| candidate.parent() == Some(&*path))
            .filter_map(|candidate| candidate.file_name())
            .map(PathBuf::from)
            .collect();
        children.sort();
        children.dedup();
        Ok(children)
    }

    fn size_of(&self, path: &Path) -> FsResult<u64> {
        let contents = self.contents_of(path)?;
        let len = contents.read().len();
        Ok(len as u64)
    }

    fn delete(&self, path: &Path) -> FsResult<()> {
        let mut state = self.state.lock();
        state
            .files
            .remove(&normalized(path))
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound {
                path: path.to_owned(),
            })
    }

    fn create_dir_all(&self, path: &Path) -> FsResult<()> {
        let mut state = self.state.lock();
        let mut ancestor = normalized(path);
        loop {
            state.directories.insert(ancestor.clone());
            match ancestor.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => {
                    ancestor = parent.to_owned();
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        let mut state = self.state.lock();
        let contents = state
            .files
            .remove(&normalized(from))
            .ok_or_else(|| FsError::NotFound {
                path: from.to_owned(),
            })?;
        state.files.insert(normalized(to), contents);
        Ok(())
    }

    fn sync_dir(&self, _path: &Path) -> FsResult<()> {
        Ok(())
    }

    fn lock(&self, path: &Path) -> Result<Self::Lockfile, LockError> {
        let path = normalized(path);
        let mut state = self.state.lock();
        state.files.entry(path.clone()).or_default();

        if state.locked.insert(path.clone()) {
            Ok(MemLockfile { path })
        } else {
            Err(LockError::AlreadyHeld { path })
        }
    }

    fn unlock(&self, lockfile: Self::Lockfile) -> Result<(), LockError> {
        let mut state = self.state.lock();
        state.locked.remove(&lockfile.path);
        Ok(())
    }
}

/// Normalize a path so that `a/./b` and `a/b` name the same file.
///
/// `..` components are kept literal; the engine never produces them.
fn normalized(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_replaces_destination() {
        let fs = MemFs::new();
        fs.create_dir_all(Path::new("/db")).unwrap();

        let mut file = fs.open_writable(Path::new("/db/a")).unwrap();
        file.write_all(b"new").unwrap();
        drop(file);

        let mut file = fs.open_writable(Path::new("/db/b")).unwrap();
        file.write_all(b"old").unwrap();
        drop(file);

        fs.rename(Path::new("/db/a"), Path::new("/db/b")).unwrap();

        assert!(!fs.exists(Path::new("/db/a")).unwrap());
        assert_eq!(fs.read_file(Path::new("/db/b")).unwrap(), b"new");
    }

    #[test]
    fn children_lists_only_direct_entries() {
        let fs = MemFs::new();
        fs.create_dir_all(Path::new("/db/nested")).unwrap();
        drop(fs.open_writable(Path::new("/db/CURRENT")).unwrap());
        drop(fs.open_writable(Path::new("/db/nested/000001.ldb")).unwrap());

        let children = fs.children(Path::new("/db")).unwrap();
        assert_eq!(
            children,
            vec![PathBuf::from("CURRENT"), PathBuf::from("nested")],
        );
    }

    #[test]
    fn sequential_reads_advance() {
        let fs = MemFs::new();
        let path = Path::new("/f");
        let mut file = fs.open_writable(path).unwrap();
        file.write_all(b"abcdef").unwrap();
        drop(file);

        let mut reader = fs.open_sequential(path).unwrap();
        let mut buf = [0_u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn lock_conflicts_until_unlocked() {
        let fs = MemFs::new();
        let path = Path::new("/db/LOCK");

        let held = fs.lock(path).unwrap();
        assert!(matches!(fs.lock(path), Err(LockError::AlreadyHeld { .. })));
        fs.unlock(held).unwrap();
        let reheld = fs.lock(path).unwrap();
        fs.unlock(reheld).unwrap();
    }
}
