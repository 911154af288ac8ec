//! Engine-wide tuning constants. File-level knobs live in
//! [`Options`](crate::Options); these are structural.

/// Number of levels in the tree.
pub(crate) const NUM_LEVELS: usize = 7;

/// Level-0 file count that makes level 0 eligible for size compaction.
pub(crate) const L0_COMPACTION_TRIGGER: usize = 4;
/// Level-0 file count at which each incoming write is delayed by 1 ms, to
/// let the background thread catch up.
pub(crate) const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;
/// Level-0 file count at which writes stop entirely until level 0 drains.
pub(crate) const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Maximum level a flushed memtable may be placed in when its key range
/// overlaps nothing below.
pub(crate) const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Byte budget of level 1; each level below gets ten times the previous.
pub(crate) const MAX_BYTES_FOR_LEVEL_BASE: f64 = (10 * 1024 * 1024) as f64;

/// A compaction output is cut when its overlap with level+2 exceeds this
/// many times the file-size limit, so future compactions stay cheap.
pub(crate) const GRANDPARENT_OVERLAP_FACTOR: u64 = 10;
/// A compaction's level-`n` input set is not expanded past this many times
/// the file-size limit.
pub(crate) const EXPANDED_COMPACTION_FACTOR: u64 = 25;

/// The log format's block size, for both write-ahead logs and the MANIFEST.
pub(crate) const LOG_BLOCK_SIZE: usize = 32 * 1024;

/// Approximate bytes an iterator yields between read samples; each sample
/// may charge a seek against an overlapping file.
pub(crate) const READ_BYTES_PERIOD: u64 = 1 << 20;

/// Default capacity of the internal block cache when none is supplied.
pub(crate) const DEFAULT_BLOCK_CACHE_BYTES: usize = 8 << 20;

/// Table-cache slots reserved away from `max_open_files` for other uses of
/// file descriptors.
pub(crate) const TABLE_CACHE_HEADROOM: usize = 10;
