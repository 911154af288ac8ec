//! Whole-engine tests against the in-memory filesystem.

use std::path::Path;
use std::sync::Arc;

use silt::{
    BloomFilterPolicy, Db, Options, ReadOptions, WriteBatch, WriteOptions, destroy_db,
};
use silt_vfs::{Filesystem as _, MemFs};


fn test_options() -> Options {
    Options {
        create_if_missing: true,
        ..Options::default()
    }
}

fn open(fs: &MemFs, path: &str) -> Db<MemFs> {
    Db::open(fs.clone(), path, test_options()).unwrap()
}

fn put(db: &Db<MemFs>, key: &[u8], value: &[u8]) {
    db.put(&WriteOptions::new(), key, value).unwrap();
}

fn get(db: &Db<MemFs>, key: &[u8]) -> Option<Vec<u8>> {
    db.get(&ReadOptions::new(), key).unwrap()
}

fn collect_all(db: &Db<MemFs>) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = db.iter(&ReadOptions::new());
    iter.seek_to_first();
    let mut entries = Vec::new();
    while iter.valid() {
        entries.push((iter.key().to_vec(), iter.value().to_vec()));
        iter.next();
    }
    iter.status().unwrap();
    entries
}

#[test]
fn put_get_iterate() {
    let fs = MemFs::new();
    let db = open(&fs, "/db");

    put(&db, b"a", b"1");
    put(&db, b"b", b"2");
    put(&db, b"c", b"3");

    assert_eq!(get(&db, b"a").as_deref(), Some(&b"1"[..]));
    assert_eq!(get(&db, b"b").as_deref(), Some(&b"2"[..]));
    assert_eq!(get(&db, b"missing"), None);

    assert_eq!(collect_all(&db), vec![
        (b"a".to_vec(), b"1".to_vec()),
        (b"b".to_vec(), b"2".to_vec()),
        (b"c".to_vec(), b"3".to_vec()),
    ]);
}

#[test]
fn delete_then_get_is_none() {
    let fs = MemFs::new();
    let db = open(&fs, "/db");

    put(&db, b"a", b"1");
    put(&db, b"b", b"2");
    put(&db, b"c", b"3");
    db.delete(&WriteOptions::new(), b"b").unwrap();

    assert_eq!(get(&db, b"b"), None);
    assert_eq!(collect_all(&db), vec![
        (b"a".to_vec(), b"1".to_vec()),
        (b"c".to_vec(), b"3".to_vec()),
    ]);

    // Deleting a key that was never written is fine too.
    db.delete(&WriteOptions::new(), b"ghost").unwrap();
    assert_eq!(get(&db, b"ghost"), None);
}

#[test]
fn overwrites_show_latest_value() {
    let fs = MemFs::new();
    let db = open(&fs, "/db");

    put(&db, b"k", b"v1");
    put(&db, b"k", b"v2");
    put(&db, b"k", b"v3");
    assert_eq!(get(&db, b"k").as_deref(), Some(&b"v3"[..]));
    assert_eq!(collect_all(&db).len(), 1);
}

#[test]
fn snapshot_pins_a_point_in_time() {
    let fs = MemFs::new();
    let db = open(&fs, "/db");

    put(&db, b"a", b"1");
    let snapshot = db.snapshot();

    put(&db, b"a", b"X");
    put(&db, b"b", b"new");

    assert_eq!(get(&db, b"a").as_deref(), Some(&b"X"[..]));

    let at_snapshot = ReadOptions::with_snapshot(snapshot.clone());
    assert_eq!(db.get(&at_snapshot, b"a").unwrap().as_deref(), Some(&b"1"[..]));
    assert_eq!(db.get(&at_snapshot, b"b").unwrap(), None);

    // Snapshot reads survive a flush and a full compaction.
    db.flush().unwrap();
    db.compact_range(None, None).unwrap();
    assert_eq!(db.get(&at_snapshot, b"a").unwrap().as_deref(), Some(&b"1"[..]));

    let mut iter = db.iter(&at_snapshot);
    iter.seek_to_first();
    assert!(iter.valid());
    assert_eq!(iter.key(), b"a");
    assert_eq!(iter.value(), b"1");
    iter.next();
    assert!(!iter.valid());

    db.release_snapshot(snapshot);
}

#[test]
fn batches_apply_atomically_and_in_order() {
    let fs = MemFs::new();
    let db = open(&fs, "/db");

    put(&db, b"doomed", b"x");

    let mut batch = WriteBatch::new();
    batch.put(b"k1", b"v1");
    batch.delete(b"doomed");
    batch.put(b"k2", b"v2");
    batch.put(b"k1", b"v1-final");
    db.write(&WriteOptions::new(), batch).unwrap();

    assert_eq!(get(&db, b"k1").as_deref(), Some(&b"v1-final"[..]));
    assert_eq!(get(&db, b"k2").as_deref(), Some(&b"v2"[..]));
    assert_eq!(get(&db, b"doomed"), None);
}

#[test]
fn values_survive_reopen_via_log_replay() {
    let fs = MemFs::new();
    {
        let db = open(&fs, "/db");
        put(&db, b"persisted", b"yes");
        db.put(&WriteOptions::synced(), b"synced", b"also").unwrap();
        db.close().unwrap();
    }

    let db = open(&fs, "/db");
    assert_eq!(get(&db, b"persisted").as_deref(), Some(&b"yes"[..]));
    assert_eq!(get(&db, b"synced").as_deref(), Some(&b"also"[..]));
}

#[test]
fn values_survive_reopen_after_flush() {
    let fs = MemFs::new();
    {
        let db = open(&fs, "/db");
        for i in 0..500_u32 {
            put(&db, format!("key{i:04}").as_bytes(), format!("value{i}").as_bytes());
        }
        db.flush().unwrap();
        let table_files: usize = (0..3)
            .map(|level| {
                db.property(&format!("silt.num-files-at-level{level}"))
                    .unwrap()
                    .parse::<usize>()
                    .unwrap()
            })
            .sum();
        assert!(table_files >= 1, "flush produced no table files");
        db.close().unwrap();
    }

    let db = open(&fs, "/db");
    for i in (0..500_u32).step_by(17) {
        assert_eq!(
            get(&db, format!("key{i:04}").as_bytes()),
            Some(format!("value{i}").into_bytes()),
        );
    }
}

#[test]
fn reopen_without_clean_close_replays_the_log() {
    let fs = MemFs::new();
    {
        let db = open(&fs, "/db");
        put(&db, b"alpha", b"1");
        put(&db, b"beta", b"2");
        // No close: the handle drops, simulating a crash after the writes
        // reached the (in-memory) filesystem.
    }

    let db = open(&fs, "/db");
    assert_eq!(get(&db, b"alpha").as_deref(), Some(&b"1"[..]));
    assert_eq!(get(&db, b"beta").as_deref(), Some(&b"2"[..]));
}

#[test]
fn reuse_logs_reopen_matches_plain_reopen() {
    // The same writes, recovered with and without log reuse, produce the
    // same visible state.
    for reuse_logs in [false, true] {
        let fs = MemFs::new();
        {
            let db = open(&fs, "/db");
            for i in 0..100_u32 {
                put(&db, format!("k{i:03}").as_bytes(), format!("v{i}").as_bytes());
            }
            db.close().unwrap();
        }

        let options = Options {
            create_if_missing: false,
            reuse_logs,
            ..Options::default()
        };
        let db = Db::open(fs.clone(), "/db", options).unwrap();
        for i in 0..100_u32 {
            assert_eq!(
                get(&db, format!("k{i:03}").as_bytes()),
                Some(format!("v{i}").into_bytes()),
                "reuse_logs = {reuse_logs}",
            );
        }

        // And the reused log keeps accepting writes that survive another
        // reopen.
        put(&db, b"later", b"write");
        db.close().unwrap();
        let db = open(&fs, "/db");
        assert_eq!(get(&db, b"later").as_deref(), Some(&b"write"[..]));
    }
}

#[test]
fn compaction_preserves_visible_state() {
    let fs = MemFs::new();
    let options = Options {
        create_if_missing: true,
        write_buffer_size: 32 << 10,
        ..Options::default()
    };
    let db = Db::open(fs.clone(), "/db", options).unwrap();

    // Enough data (with overwrites and deletes) to spill several tables.
    for round in 0..3_u32 {
        for i in 0..800_u32 {
            put(
                &db,
                format!("key{i:05}").as_bytes(),
                format!("round{round}-{i}-{}", "x".repeat(64)).as_bytes(),
            );
        }
    }
    for i in (0..800_u32).step_by(3) {
        db.delete(&WriteOptions::new(), format!("key{i:05}").as_bytes()).unwrap();
    }

    let before = collect_all(&db);
    db.compact_range(None, None).unwrap();
    let after = collect_all(&db);
    assert_eq!(before, after);

    // Spot-check semantics after compaction.
    assert_eq!(get(&db, b"key00000"), None);
    assert_eq!(
        get(&db, b"key00001"),
        Some(format!("round2-1-{}", "x".repeat(64)).into_bytes()),
    );
}

#[test]
fn iterators_merge_memtable_and_tables() {
    let fs = MemFs::new();
    let db = open(&fs, "/db");

    put(&db, b"disk1", b"from-table");
    put(&db, b"disk2", b"from-table");
    db.flush().unwrap();
    put(&db, b"mem1", b"from-memtable");
    put(&db, b"disk1", b"overwritten-in-memtable");

    assert_eq!(collect_all(&db), vec![
        (b"disk1".to_vec(), b"overwritten-in-memtable".to_vec()),
        (b"disk2".to_vec(), b"from-table".to_vec()),
        (b"mem1".to_vec(), b"from-memtable".to_vec()),
    ]);
}

#[test]
fn reverse_iteration_and_seeks() {
    let fs = MemFs::new();
    let db = open(&fs, "/db");

    for key in [&b"b"[..], b"d", b"f", b"h"] {
        put(&db, key, key);
    }
    db.delete(&WriteOptions::new(), b"d").unwrap();

    let read = ReadOptions::new();
    let mut iter = db.iter(&read);

    iter.seek_to_last();
    assert_eq!(iter.key(), b"h");
    iter.prev();
    assert_eq!(iter.key(), b"f");
    iter.prev();
    assert_eq!(iter.key(), b"b", "deleted key must be skipped in reverse");
    iter.prev();
    assert!(!iter.valid());

    iter.seek(b"c");
    assert_eq!(iter.key(), b"f", "seek lands past the deleted key");
    iter.seek(b"f");
    assert_eq!(iter.key(), b"f");
    iter.seek(b"z");
    assert!(!iter.valid());

    // Direction changes mid-stream.
    iter.seek(b"f");
    iter.prev();
    assert_eq!(iter.key(), b"b");
    iter.next();
    assert_eq!(iter.key(), b"f");
}

#[test]
fn iterator_ignores_writes_after_creation() {
    let fs = MemFs::new();
    let db = open(&fs, "/db");

    put(&db, b"k1", b"v1");
    let mut iter = db.iter(&ReadOptions::new());

    put(&db, b"k0", b"too-late");
    put(&db, b"k2", b"too-late");

    iter.seek_to_first();
    assert_eq!(iter.key(), b"k1");
    iter.next();
    assert!(!iter.valid());
}

#[test]
fn concurrent_writers_all_commit() {
    let fs = MemFs::new();
    let db = open(&fs, "/db");

    let threads: Vec<_> = (0..8_u32)
        .map(|thread_id| {
            let db = db.clone();
            std::thread::spawn(move || {
                for i in 0..200_u32 {
                    let key = format!("t{thread_id}-{i:04}");
                    db.put(&WriteOptions::new(), key.as_bytes(), key.as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    for thread_id in 0..8_u32 {
        for i in (0..200_u32).step_by(41) {
            let key = format!("t{thread_id}-{i:04}");
            assert_eq!(get(&db, key.as_bytes()), Some(key.clone().into_bytes()));
        }
    }
    assert_eq!(collect_all(&db).len(), 8 * 200);
}

#[test]
fn second_open_conflicts_on_the_lock() {
    let fs = MemFs::new();
    let db = open(&fs, "/db");

    let err = Db::open(fs.clone(), "/db", test_options()).unwrap_err();
    assert_eq!(err.kind, silt::ErrorKind::Io, "{err}");

    db.close().unwrap();
    let _reopened = open(&fs, "/db");
}

#[test]
fn missing_db_without_create_is_not_found() {
    let fs = MemFs::new();
    let err = Db::open(fs.clone(), "/nope", Options::default()).unwrap_err();
    assert!(err.is_not_found(), "{err}");

    let exclusive = Options {
        create_if_missing: true,
        error_if_exists: true,
        ..Options::default()
    };
    let db = Db::open(fs.clone(), "/db2", exclusive.clone()).unwrap();
    db.close().unwrap();

    let err = Db::open(fs.clone(), "/db2", exclusive).unwrap_err();
    assert_eq!(err.kind, silt::ErrorKind::InvalidArgument, "{err}");
}

#[test]
fn mangled_current_file_fails_the_open() {
    let fs = MemFs::new();
    {
        let db = open(&fs, "/db");
        put(&db, b"k", b"v");
        db.close().unwrap();
    }

    fs.overwrite_file(Path::new("/db/CURRENT"), b"MANIFEST-999999\n".to_vec()).unwrap();
    let err = Db::open(fs.clone(), "/db", Options::default()).unwrap_err();
    assert!(err.is_not_found() || err.kind == silt::ErrorKind::Io, "{err}");

    fs.overwrite_file(Path::new("/db/CURRENT"), b"garbage".to_vec()).unwrap();
    let err = Db::open(fs.clone(), "/db", Options::default()).unwrap_err();
    assert_eq!(err.kind, silt::ErrorKind::Corruption, "{err}");
}

#[test]
fn bloom_filters_do_not_lose_keys() {
    let fs = MemFs::new();
    let options = Options {
        create_if_missing: true,
        filter_policy: Some(Arc::new(BloomFilterPolicy::default())),
        write_buffer_size: 16 << 10,
        ..Options::default()
    };
    let db = Db::open(fs.clone(), "/db", options).unwrap();

    for i in 0..2000_u32 {
        put(&db, format!("bloom{i:05}").as_bytes(), &i.to_le_bytes());
    }
    db.flush().unwrap();

    for i in 0..2000_u32 {
        assert_eq!(
            get(&db, format!("bloom{i:05}").as_bytes()),
            Some(i.to_le_bytes().to_vec()),
        );
    }
    assert_eq!(get(&db, b"bloom99999"), None);
}

#[test]
fn approximate_sizes_track_data_layout() {
    let fs = MemFs::new();
    let options = Options {
        create_if_missing: true,
        compression: silt::Compression::None,
        ..Options::default()
    };
    let db = Db::open(fs.clone(), "/db", options).unwrap();

    let value = vec![b'x'; 10_000];
    for i in 0..80_u32 {
        put(&db, format!("size{i:03}").as_bytes(), &value);
    }

    // Nothing flushed yet: sizes are approximately zero.
    let unflushed = db.approximate_sizes(&[(b"size000", b"size999")]);
    assert_eq!(unflushed, vec![0]);

    db.flush().unwrap();

    let sizes = db.approximate_sizes(&[
        (&b"size000"[..], &b"size040"[..]),
        (&b"size040"[..], &b"size080"[..]),
        (&b"size000"[..], &b"size080"[..]),
        (&b"zz"[..], &b"zzz"[..]),
    ]);
    // Each half holds ~400 KB of values.
    assert!(sizes[0] > 200_000, "{sizes:?}");
    assert!(sizes[1] > 200_000, "{sizes:?}");
    assert!(sizes[2] >= sizes[0].max(sizes[1]), "{sizes:?}");
    assert_eq!(sizes[3], 0, "{sizes:?}");
}

#[test]
fn properties_report_engine_state() {
    let fs = MemFs::new();
    let db = open(&fs, "/db");

    assert!(db.property("silt.num-files-at-level0").is_some());
    assert!(db.property("silt.stats").is_some());
    assert!(db.property("silt.sstables").is_some());
    assert!(db.property("silt.approximate-memory-usage").is_some());
    assert!(db.property("silt.nonsense").is_none());
    assert!(db.property("other.stats").is_none());

    put(&db, b"k", b"v");
    db.flush().unwrap();
    let table_files: usize = (0..3)
        .map(|level| {
            db.property(&format!("silt.num-files-at-level{level}"))
                .unwrap()
                .parse::<usize>()
                .unwrap()
        })
        .sum();
    assert!(table_files >= 1);
}

#[test]
fn empty_keys_and_values_are_legal() {
    let fs = MemFs::new();
    let db = open(&fs, "/db");

    put(&db, b"", b"empty-key");
    put(&db, b"empty-value", b"");
    assert_eq!(get(&db, b"").as_deref(), Some(&b"empty-key"[..]));
    assert_eq!(get(&db, b"empty-value").as_deref(), Some(&b""[..]));

    db.flush().unwrap();
    assert_eq!(get(&db, b"").as_deref(), Some(&b"empty-key"[..]));
    assert_eq!(get(&db, b"empty-value").as_deref(), Some(&b""[..]));
}

#[test]
fn repeated_misses_trigger_seek_compaction() {
    let fs = MemFs::new();
    let db = open(&fs, "/db");

    // Two table files with the same key range, in adjacent levels (an empty
    // tree lets the first flush push down to level 2, the second to level
    // 1): every point lookup in the range has to consult both.
    for i in 0..200_u32 {
        put(&db, format!("seek{i:04}").as_bytes(), b"first");
    }
    db.flush().unwrap();
    for i in (0..200_u32).step_by(2) {
        put(&db, format!("seek{i:04}").as_bytes(), b"second");
    }
    db.flush().unwrap();
    assert_eq!(db.property("silt.num-files-at-level1").as_deref(), Some("1"));
    assert_eq!(db.property("silt.num-files-at-level2").as_deref(), Some("1"));

    // Each miss probes both files and charges a seek against the first;
    // the budget floor is 100 seeks, after which a compaction is scheduled.
    for round in 0..1200_u32 {
        let probe = format!("seek{:04}x", round % 200);
        assert_eq!(get(&db, probe.as_bytes()), None);
    }

    // Give the background thread a moment to merge level 1 away.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let level1: usize = db.property("silt.num-files-at-level1").unwrap().parse().unwrap();
        if level1 == 0 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "seek-triggered compaction never ran (level1 = {level1})",
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    // The data survived the move out of level 0.
    assert_eq!(get(&db, b"seek0000").as_deref(), Some(&b"second"[..]));
    assert_eq!(get(&db, b"seek0001").as_deref(), Some(&b"first"[..]));
}

#[test]
fn destroy_removes_the_database() {
    let fs = MemFs::new();
    {
        let db = open(&fs, "/db");
        put(&db, b"k", b"v");
        db.flush().unwrap();
        db.close().unwrap();
    }

    destroy_db(&fs, Path::new("/db")).unwrap();
    assert!(!fs.exists(Path::new("/db/CURRENT")).unwrap());

    // A fresh database can be created in its place.
    let db = open(&fs, "/db");
    assert_eq!(get(&db, b"k"), None);
}
