use std::sync::Arc;

use crate::format::SequenceNumber;


/// A stable read view: everything with a sequence at or below the captured
/// one, and nothing newer.
///
/// Obtained from [`Db::snapshot`]; pass it in [`ReadOptions`] to read as of
/// that moment. The view is held open (pinning old versions of overwritten
/// and deleted keys from being compacted away) until every clone of the
/// handle is dropped or given to [`Db::release_snapshot`].
///
/// [`Db::snapshot`]: crate::Db::snapshot
/// [`Db::release_snapshot`]: crate::Db::release_snapshot
/// [`ReadOptions`]: crate::ReadOptions
#[derive(Debug, Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    pub(crate) fn sequence(&self) -> SequenceNumber {
        self.inner.sequence
    }
}

#[derive(Debug)]
struct SnapshotInner {
    sequence: SequenceNumber,
}

/// The live snapshots, oldest first (they are acquired at non-decreasing
/// sequences). Guarded by the database mutex.
///
/// Entries whose handles have all been dropped are pruned lazily; the list
/// holds one reference of its own, so "strong count is one" means
/// "abandoned".
#[derive(Debug, Default)]
pub(crate) struct SnapshotList {
    snapshots: Vec<Arc<SnapshotInner>>,
}

impl SnapshotList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn acquire(&mut self, sequence: SequenceNumber) -> Snapshot {
        self.prune();
        let inner = Arc::new(SnapshotInner { sequence });
        self.snapshots.push(Arc::clone(&inner));
        Snapshot { inner }
    }

    /// The sequence of the oldest live snapshot, if any. Compaction must not
    /// collapse entries still visible at or above this.
    pub(crate) fn oldest(&mut self) -> Option<SequenceNumber> {
        self.prune();
        self.snapshots.first().map(|inner| inner.sequence)
    }

    fn prune(&mut self) {
        self.snapshots
            .retain(|inner| Arc::strong_count(inner) > 1);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_tracks_live_handles() {
        let mut list = SnapshotList::new();
        assert_eq!(list.oldest(), None);

        let first = list.acquire(SequenceNumber(10));
        let second = list.acquire(SequenceNumber(20));
        assert_eq!(list.oldest(), Some(SequenceNumber(10)));

        drop(first);
        assert_eq!(list.oldest(), Some(SequenceNumber(20)));

        let clone = second.clone();
        drop(second);
        assert_eq!(list.oldest(), Some(SequenceNumber(20)));

        drop(clone);
        assert_eq!(list.oldest(), None);
    }
}
