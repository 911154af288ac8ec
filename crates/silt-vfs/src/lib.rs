//! Filesystem capability layer for the silt storage engine.
//!
//! The engine never touches `std::fs` directly; everything goes through the
//! [`Filesystem`] trait so that the same code can run against the real disk
//! ([`StdFs`]) or an in-memory filesystem ([`MemFs`]) in tests, where crashes
//! and partial writes can be simulated deterministically.

mod error;
mod mem_fs;
mod std_fs;
mod traits;

pub use self::error::{FsError, FsResult, LockError};
pub use self::mem_fs::{MemFile, MemFs, MemLockfile, MemWritableFile};
pub use self::std_fs::{StdFs, StdLockfile, StdRandomAccessFile, StdWritableFile};
pub use self::traits::{Filesystem, RandomAccess, RandomAccessFile, WritableFile};
