use std::path::Path;

use silt_vfs::{Filesystem as _, MemFs};

use crate::config::LOG_BLOCK_SIZE;
use crate::format::mask_checksum;
use super::{LOG_HEADER_LEN, LogReader, LogWriter};


struct Harness {
    fs:   MemFs,
    path: &'static str,
}

impl Harness {
    fn new() -> Self {
        Self {
            fs:   MemFs::new(),
            path: "/wal/000003.log",
        }
    }

    fn write(&self, records: &[&[u8]]) {
        let file = self.fs.open_appendable(Path::new(self.path)).unwrap();
        let mut writer = LogWriter::new(file);
        for record in records {
            writer.add_record(record).unwrap();
        }
        writer.sync().unwrap();
    }

    fn raw(&self) -> Vec<u8> {
        self.fs.read_file(Path::new(self.path)).unwrap()
    }

    fn rewrite(&self, bytes: Vec<u8>) {
        self.fs.overwrite_file(Path::new(self.path), bytes).unwrap();
    }

    /// Read every record; returns them along with (dropped_bytes, reason)
    /// corruption reports.
    fn read_all(&self) -> (Vec<Vec<u8>>, Vec<(usize, String)>) {
        let mut reports = Vec::new();
        let file = self.fs.open_sequential(Path::new(self.path)).unwrap();
        let mut reader = LogReader::new(file, |bytes: usize, reason: &str| {
            reports.push((bytes, reason.to_owned()));
        });

        let mut records = Vec::new();
        while let Some(record) = reader.read_record() {
            records.push(record);
        }
        // A second poll stays at end-of-log.
        assert!(reader.read_record().is_none());
        drop(reader);
        (records, reports)
    }
}

#[test]
fn records_round_trip_including_empty() {
    let harness = Harness::new();
    harness.write(&[b"foo", b"bar", b"", b"xxxx"]);

    let (records, reports) = harness.read_all();
    assert_eq!(records, vec![
        b"foo".to_vec(),
        b"bar".to_vec(),
        Vec::new(),
        b"xxxx".to_vec(),
    ]);
    assert!(reports.is_empty(), "{reports:?}");
}

#[test]
fn large_records_fragment_across_blocks() {
    let harness = Harness::new();
    let big = vec![b'a'; LOG_BLOCK_SIZE * 3 + 1234];
    let medium = vec![b'b'; LOG_BLOCK_SIZE / 2];
    harness.write(&[&big, &medium, b"tail"]);

    let (records, reports) = harness.read_all();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0], big);
    assert_eq!(records[1], medium);
    assert_eq!(records[2], b"tail");
    assert!(reports.is_empty());
}

#[test]
fn block_tail_shorter_than_a_header_is_zero_padded() {
    let harness = Harness::new();
    // First record leaves exactly 3 bytes in the first block:
    // header (7) + payload = BLOCK - 3.
    let first = vec![b'x'; LOG_BLOCK_SIZE - 3 - LOG_HEADER_LEN];
    harness.write(&[&first, b"second"]);

    let raw = harness.raw();
    assert_eq!(&raw[LOG_BLOCK_SIZE - 3..LOG_BLOCK_SIZE], &[0, 0, 0]);

    let (records, reports) = harness.read_all();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1], b"second");
    assert!(reports.is_empty());
}

#[test]
fn truncated_tail_record_is_silently_dropped() {
    let harness = Harness::new();
    harness.write(&[b"keep-me", b"losable-final-record"]);

    let mut raw = harness.raw();
    raw.truncate(raw.len() - 5);
    harness.rewrite(raw);

    let (records, reports) = harness.read_all();
    assert_eq!(records, vec![b"keep-me".to_vec()]);
    assert!(reports.is_empty(), "truncation must not be reported: {reports:?}");
}

#[test]
fn unknown_record_type_drops_the_record() {
    let harness = Harness::new();
    harness.write(&[b"foo"]);

    // Corrupt the type byte (offset 6) and fix up the checksum so only the
    // type is implausible.
    let mut raw = harness.raw();
    raw[6] = 0x7f;
    let digest = crc32c::crc32c(&raw[6..10]);
    raw[0..4].copy_from_slice(&mask_checksum(digest).to_le_bytes());
    harness.rewrite(raw);

    let (records, reports) = harness.read_all();
    assert!(records.is_empty());
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, 3);
    assert!(reports[0].1.contains("unknown record type"), "{}", reports[0].1);
}

#[test]
fn checksum_mismatch_drops_the_rest_of_the_block() {
    let harness = Harness::new();
    harness.write(&[b"payload-one", b"payload-two"]);

    let mut raw = harness.raw();
    raw[LOG_HEADER_LEN] ^= 0x01; // first payload byte
    harness.rewrite(raw);

    let (records, reports) = harness.read_all();
    // Both records lived in the first block; both are lost.
    assert!(records.is_empty());
    assert_eq!(reports.len(), 1);
    assert!(reports[0].1.contains("checksum"));
    assert!(reports[0].0 >= 2 * b"payload-one".len());
}

#[test]
fn middle_without_first_is_reported_and_skipped() {
    let harness = Harness::new();
    harness.write(&[b"alpha"]);

    // Rewrite the FULL record as a MIDDLE record with a valid checksum.
    let mut raw = harness.raw();
    raw[6] = 3;
    let digest = crc32c::crc32c(&raw[6..6 + 1 + 5]);
    raw[0..4].copy_from_slice(&mask_checksum(digest).to_le_bytes());
    harness.rewrite(raw);

    let (records, reports) = harness.read_all();
    assert!(records.is_empty());
    assert_eq!(reports.len(), 1);
    assert!(reports[0].1.contains("MIDDLE"));
}

#[test]
fn reopened_log_appends_after_existing_records() {
    let harness = Harness::new();
    harness.write(&[b"one", b"two"]);

    let size = harness.fs.size_of(Path::new(harness.path)).unwrap();
    let file = harness.fs.open_appendable(Path::new(harness.path)).unwrap();
    let mut writer = LogWriter::with_offset(file, size);
    writer.add_record(b"three").unwrap();

    let (records, reports) = harness.read_all();
    assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    assert!(reports.is_empty());
}

#[test]
fn reopened_log_pads_correctly_near_block_end() {
    // Reopen so close to a block boundary that the next record must skip to
    // the following block.
    let harness = Harness::new();
    let first = vec![b'x'; LOG_BLOCK_SIZE - 2 - LOG_HEADER_LEN];
    harness.write(&[&first]);

    let size = harness.fs.size_of(Path::new(harness.path)).unwrap();
    assert_eq!(size as usize, LOG_BLOCK_SIZE - 2);

    let file = harness.fs.open_appendable(Path::new(harness.path)).unwrap();
    let mut writer = LogWriter::with_offset(file, size);
    writer.add_record(b"next-block").unwrap();

    let (records, reports) = harness.read_all();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1], b"next-block");
    assert!(reports.is_empty());
}
