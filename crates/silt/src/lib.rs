//! silt - an embedded, ordered, log-structured key-value storage engine.
//!
//! Keys and values are arbitrary byte strings, ordered by a pluggable
//! comparator (bytewise by default). Writes land in a write-ahead log and an
//! in-memory table; sealed memtables and deeper levels live in immutable
//! sorted table files, merged by a background compactor. Reads see a
//! consistent snapshot; batches commit atomically.
//!
//! ```no_run
//! use silt::{Db, Options, ReadOptions, WriteOptions};
//! use silt_vfs::StdFs;
//!
//! # fn main() -> silt::Result<()> {
//! let mut options = Options::default();
//! options.create_if_missing = true;
//!
//! let db = Db::open(StdFs, "/tmp/demo-db", options)?;
//! db.put(&WriteOptions::new(), b"feather", b"grey")?;
//! assert_eq!(
//!     db.get(&ReadOptions::new(), b"feather")?.as_deref(),
//!     Some(&b"grey"[..]),
//! );
//! # Ok(())
//! # }
//! ```
//!
//! One process at a time may hold a database (an exclusive lock file
//! enforces this); within that process the handle is `Clone` and every
//! operation is safe to call from any thread.

mod config;
mod db;
mod db_iter;
mod error;
mod filenames;
mod format;
mod iter;
mod memtable;
mod options;
mod repair;
mod snapshot;
mod table_cache;
mod version;
mod wal;
mod write_batch;

mod compaction;

pub use self::db::{Db, destroy_db};
pub use self::db_iter::DbIterator;
pub use self::error::{Error, ErrorKind, Result};
pub use self::options::{Options, ReadOptions, WriteOptions};
pub use self::repair::repair_db;
pub use self::snapshot::Snapshot;
pub use self::write_batch::{BatchEntry, BatchIter, WriteBatch};

// The pieces a custom configuration plugs into.
pub use silt_sstable::filter::{BloomFilterPolicy, FilterPolicy};
pub use silt_sstable::table::BlockCache;
pub use silt_sstable::{BytewiseComparator, Comparator, Compression};
