//! Smoke tests against the real filesystem, plus repair.

use std::path::Path;

use silt::{Db, Options, ReadOptions, WriteOptions, repair_db};
use silt_vfs::{Filesystem as _, MemFs, StdFs};


#[test]
fn whole_lifecycle_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");

    let options = Options {
        create_if_missing: true,
        write_buffer_size: 64 << 10,
        ..Options::default()
    };

    {
        let db = Db::open(StdFs, &path, options.clone()).unwrap();
        for i in 0..1000_u32 {
            db.put(
                &WriteOptions::new(),
                format!("key{i:05}").as_bytes(),
                format!("value-{i}-{}", "y".repeat(100)).as_bytes(),
            )
            .unwrap();
        }
        db.delete(&WriteOptions::new(), b"key00500").unwrap();
        db.flush().unwrap();
        db.compact_range(None, None).unwrap();
        db.close().unwrap();
    }

    let db = Db::open(StdFs, &path, Options::default()).unwrap();
    assert_eq!(db.get(&ReadOptions::new(), b"key00500").unwrap(), None);
    for i in (0..1000_u32).step_by(111) {
        if i == 500 {
            continue;
        }
        assert_eq!(
            db.get(&ReadOptions::new(), format!("key{i:05}").as_bytes()).unwrap(),
            Some(format!("value-{i}-{}", "y".repeat(100)).into_bytes()),
        );
    }
    db.close().unwrap();
}

#[test]
fn repair_rebuilds_a_catalog_from_files() {
    let fs = MemFs::new();
    let path = Path::new("/db");

    {
        let db = Db::open(
            fs.clone(),
            path,
            Options {
                create_if_missing: true,
                write_buffer_size: 16 << 10,
                ..Options::default()
            },
        )
        .unwrap();
        for i in 0..600_u32 {
            db.put(
                &WriteOptions::new(),
                format!("r{i:04}").as_bytes(),
                format!("val{i}-{}", "z".repeat(50)).as_bytes(),
            )
            .unwrap();
        }
        db.flush().unwrap();
        // Leave some data only in the log.
        db.put(&WriteOptions::new(), b"unflushed", b"still-here").unwrap();
        db.close().unwrap();
    }

    // Lose the catalog entirely.
    fs.delete(Path::new("/db/CURRENT")).unwrap();
    for child in fs.children(path).unwrap() {
        if child.to_string_lossy().starts_with("MANIFEST-") {
            fs.delete(&path.join(child)).unwrap();
        }
    }
    assert!(Db::open(fs.clone(), path, Options::default()).is_err());

    repair_db(&fs, path, &Options::default()).unwrap();

    let db = Db::open(fs.clone(), path, Options::default()).unwrap();
    assert_eq!(
        db.get(&ReadOptions::new(), b"unflushed").unwrap().as_deref(),
        Some(&b"still-here"[..]),
    );
    for i in (0..600_u32).step_by(67) {
        assert_eq!(
            db.get(&ReadOptions::new(), format!("r{i:04}").as_bytes()).unwrap(),
            Some(format!("val{i}-{}", "z".repeat(50)).into_bytes()),
        );
    }
}
