//! Last-resort reconstruction of a database from whatever files survive.
//!
//! Repair ignores the MANIFEST entirely: every log is converted into a
//! table, every readable table is re-scanned for its key range and largest
//! sequence, and a fresh single-snapshot MANIFEST is written naming all of
//! them at level 0 (the first open afterwards compacts things back into
//! shape). Unreadable tables are dropped from the catalog - their bytes
//! stay on disk until the next open's garbage collection.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use silt_sstable::table::{Table, TableReadOptions};
use silt_vfs::Filesystem;

use crate::error::{Error, Result};
use crate::filenames::{DbFile, set_current_file};
use crate::format::{
    InternalKey, InternalKeyComparator, ParsedInternalKey, SequenceNumber,
};
use crate::memtable::Memtable;
use crate::options::Options;
use crate::version::VersionEdit;
use crate::wal::{LogReader, LogWriter};
use crate::write_batch::WriteBatch;
use crate::db::build_table_from_memtable;


struct RecoveredTable {
    number:       u64,
    file_size:    u64,
    smallest:     InternalKey,
    largest:      InternalKey,
    max_sequence: SequenceNumber,
}

/// Rebuild the catalog of the database at `path`. See the module docs.
pub fn repair_db<FS: Filesystem>(fs: &FS, path: &Path, options: &Options) -> Result<()> {
    let options = Arc::new(options.clone());
    let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));

    let lock_path = DbFile::Lock.path_in(path);
    let lockfile = fs.lock(&lock_path)?;
    let result = repair_locked(fs, path, &options, &icmp);
    let _ = fs.unlock(lockfile);
    result
}

fn repair_locked<FS: Filesystem>(
    fs:      &FS,
    path:    &Path,
    options: &Arc<Options>,
    icmp:    &InternalKeyComparator,
) -> Result<()> {
    let mut log_numbers = Vec::new();
    let mut table_numbers = Vec::new();
    let mut old_manifests = Vec::new();
    let mut max_file_number = 1;

    for child in fs.children(path)? {
        match DbFile::parse(&child) {
            Some(DbFile::Log(number)) => log_numbers.push(number),
            Some(DbFile::Table(number) | DbFile::LegacyTable(number)) => {
                table_numbers.push(number);
            }
            Some(DbFile::Manifest(number)) => {
                old_manifests.push(child.clone());
                max_file_number = max_file_number.max(number);
            }
            Some(DbFile::Temp(number)) => max_file_number = max_file_number.max(number),
            _ => {}
        }
    }
    max_file_number = max_file_number
        .max(log_numbers.iter().copied().max().unwrap_or(0))
        .max(table_numbers.iter().copied().max().unwrap_or(0));

    // Convert every log into a table, so the log's updates survive the
    // MANIFEST rewrite.
    let mut next_file_number = max_file_number + 1;
    for &log_number in &log_numbers {
        let table_number = next_file_number;
        next_file_number += 1;
        match convert_log_to_table(fs, path, options, icmp, log_number, table_number) {
            Ok(true) => table_numbers.push(table_number),
            Ok(false) => {}
            Err(err) => {
                warn!(log = log_number, error = %err, "repair: log unreadable, skipped");
            }
        }
    }

    // Re-derive metadata for every readable table.
    let mut tables = Vec::new();
    for &number in &table_numbers {
        match scan_table(fs, path, options, icmp, number) {
            Ok(meta) => tables.push(meta),
            Err(err) => {
                warn!(table = number, error = %err, "repair: table unreadable, dropped");
            }
        }
    }

    // One snapshot edit describing everything found.
    let mut edit = VersionEdit::new();
    edit.comparator_name = Some(options.comparator.name().to_owned());
    edit.log_number = Some(0);
    edit.last_sequence = Some(
        tables
            .iter()
            .map(|table| table.max_sequence)
            .max()
            .unwrap_or(SequenceNumber::ZERO),
    );
    edit.next_file_number = Some(next_file_number + 1);
    for table in &tables {
        edit.add_file(
            0,
            table.number,
            table.file_size,
            table.smallest.clone(),
            table.largest.clone(),
        );
    }

    let manifest_number = next_file_number;
    let manifest_path = DbFile::Manifest(manifest_number).path_in(path);
    {
        let file = fs.open_writable(&manifest_path)?;
        let mut writer = LogWriter::new(file);
        let mut record = Vec::new();
        edit.encode(&mut record);
        writer.add_record(&record)?;
        writer.sync()?;
    }
    set_current_file(fs, path, manifest_number)?;

    // The recovered state no longer needs the old catalog or the logs.
    for manifest in old_manifests {
        let _ = fs.delete(&path.join(manifest));
    }
    for log_number in log_numbers {
        let _ = fs.delete(&DbFile::Log(log_number).path_in(path));
    }

    info!(
        tables = tables.len(),
        manifest = manifest_number,
        "repair complete",
    );
    Ok(())
}

/// Replay one log into a memtable (tolerating corruption) and write it out
/// as table `table_number`. `Ok(false)` when the log held no usable entries.
fn convert_log_to_table<FS: Filesystem>(
    fs:           &FS,
    path:         &Path,
    options:      &Arc<Options>,
    icmp:         &InternalKeyComparator,
    log_number:   u64,
    table_number: u64,
) -> Result<bool> {
    let log_path = DbFile::Log(log_number).path_in(path);
    let file = fs.open_sequential(&log_path)?;
    let mut reader = LogReader::new(file, |bytes: usize, reason: &str| {
        warn!(log = log_number, bytes, reason, "repair: dropping corrupt log bytes");
    });

    let mem = Memtable::new(icmp.clone());
    while let Some(record) = reader.read_record() {
        let Ok(batch) = WriteBatch::from_contents(&record) else {
            continue;
        };
        let sequence = batch.sequence();
        // Salvage what parses; a batch may be cut short by corruption.
        let _ = crate::db::apply_batch_to_memtable(&batch, sequence, &mem);
    }
    drop(reader);

    if mem.is_empty() {
        return Ok(false);
    }
    build_table_from_memtable(fs, path, options, icmp, table_number, &mem)?;
    Ok(true)
}

/// Open table `number` and walk it end to end for its range and newest
/// sequence.
fn scan_table<FS: Filesystem>(
    fs:      &FS,
    path:    &Path,
    options: &Arc<Options>,
    icmp:    &InternalKeyComparator,
    number:  u64,
) -> Result<RecoveredTable> {
    let table_path = crate::filenames::table_file_path(fs, path, number);
    let file_size = fs.size_of(&table_path)?;
    let file = fs.open_random_access(&table_path)?;

    let read_opts = TableReadOptions {
        cmp: Arc::new(icmp.clone()),
        filter_policy: None,
        block_cache: None,
        paranoid_checks: options.paranoid_checks,
    };
    let table = Arc::new(Table::open(read_opts, file, file_size)?);

    let mut iter = table.iter(silt_sstable::table::ReadAccess {
        verify_checksums: true,
        fill_cache:       false,
    });
    iter.seek_to_first();

    let mut smallest: Option<Vec<u8>> = None;
    let mut largest = Vec::new();
    let mut max_sequence = SequenceNumber::ZERO;
    let mut entries = 0_u64;

    while iter.valid() {
        let key = iter.key();
        if smallest.is_none() {
            smallest = Some(key.to_vec());
        }
        largest.clear();
        largest.extend_from_slice(key);
        if let Ok(parsed) = ParsedInternalKey::decode(key) {
            max_sequence = max_sequence.max(parsed.sequence);
        }
        entries += 1;
        iter.next();
    }
    iter.status()?;

    let smallest = smallest.ok_or_else(|| Error::corruption("table has no entries"))?;
    info!(table = number, entries, "repair: table scanned");

    Ok(RecoveredTable {
        number,
        file_size,
        smallest: InternalKey(smallest),
        largest: InternalKey(largest),
        max_sequence,
    })
}
