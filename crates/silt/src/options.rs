use std::sync::Arc;

use silt_sstable::filter::FilterPolicy;
use silt_sstable::table::BlockCache;
use silt_sstable::{BytewiseComparator, Comparator, Compression};

use crate::snapshot::Snapshot;


/// Options fixed at [`Db::open`] time.
///
/// [`Db::open`]: crate::Db::open
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the database directory and catalog if they do not exist.
    pub create_if_missing:      bool,
    /// Fail the open if the database already exists.
    pub error_if_exists:        bool,
    /// Verify checksums on every read and treat catalog inconsistencies and
    /// replay corruption as fatal, instead of limping past them.
    pub paranoid_checks:        bool,
    /// The user-key ordering. Persisted by name; reopening with a different
    /// comparator fails with `InvalidArgument`.
    pub comparator:             Arc<dyn Comparator>,
    /// Bytes the memtable may reach before it is sealed and flushed.
    pub write_buffer_size:      usize,
    /// Upper bound on open table files held by the table cache.
    pub max_open_files:         usize,
    /// Cache of uncompressed data blocks; `None` gets an internal 8 MiB one.
    pub block_cache:            Option<Arc<BlockCache>>,
    /// Target uncompressed size of table data blocks.
    pub block_size:             usize,
    pub block_restart_interval: usize,
    /// Compaction stops building an output file once it reaches this size.
    pub max_file_size:          u64,
    pub compression:            Compression,
    /// On open, keep the newest log file and its memtable alive instead of
    /// flushing them, when the log ended cleanly.
    pub reuse_logs:             bool,
    /// Per-block key filter (typically Bloom); `None` disables filters.
    pub filter_policy:          Option<Arc<dyn FilterPolicy>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing:      false,
            error_if_exists:        false,
            paranoid_checks:        false,
            comparator:             Arc::new(BytewiseComparator),
            write_buffer_size:      4 << 20,
            max_open_files:         1000,
            block_cache:            None,
            block_size:             4 << 10,
            block_restart_interval: 16,
            max_file_size:          2 << 20,
            compression:            Compression::Snappy,
            reuse_logs:             false,
            filter_policy:          None,
        }
    }
}

/// Options for a single read.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub verify_checksums: bool,
    /// Whether blocks read for this operation may displace cached ones.
    /// Bulk scans set this to false.
    pub fill_cache:       bool,
    /// Read as of this snapshot instead of the current state.
    pub snapshot:         Option<Snapshot>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadOptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            verify_checksums: false,
            fill_cache:       true,
            snapshot:         None,
        }
    }

    #[must_use]
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
            ..Self::new()
        }
    }
}

/// Options for a single write.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Fsync the log before the write is acknowledged. Without it, a machine
    /// crash may lose the most recent writes (a process crash does not).
    pub sync: bool,
}

impl WriteOptions {
    #[must_use]
    pub fn new() -> Self {
        Self { sync: false }
    }

    #[must_use]
    pub fn synced() -> Self {
        Self { sync: true }
    }
}
