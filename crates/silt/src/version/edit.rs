//! The MANIFEST's unit of change.
//!
//! A `VersionEdit` is a tagged field stream: each item is a varint32 tag
//! followed by that field's payload. Unknown tags are a corruption (the
//! format is versioned by its comparator name, not by skippable fields).

use std::collections::BTreeSet;

use integer_encoding::{VarInt as _, VarIntWriter as _};

use crate::config::NUM_LEVELS;
use crate::error::{Error, Result};
use crate::format::{InternalKey, SequenceNumber};
use super::FileMetadata;


const TAG_COMPARATOR: u32       = 1;
const TAG_LOG_NUMBER: u32       = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32    = 4;
const TAG_COMPACT_POINTER: u32  = 5;
const TAG_DELETED_FILE: u32     = 6;
const TAG_NEW_FILE: u32         = 7;
// Tag 8 was used by a long-gone format revision and is never reassigned.
const TAG_PREV_LOG_NUMBER: u32  = 9;

/// A new table file recorded by an edit.
#[derive(Debug, Clone)]
pub(crate) struct NewFile {
    pub number:    u64,
    pub file_size: u64,
    pub smallest:  InternalKey,
    pub largest:   InternalKey,
}

/// One atomic delta to the catalog. Applied via
/// [`VersionSet::log_and_apply`](super::VersionSet).
#[derive(Debug, Default)]
pub(crate) struct VersionEdit {
    pub comparator_name:  Option<String>,
    pub log_number:       Option<u64>,
    pub prev_log_number:  Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence:    Option<SequenceNumber>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files:    BTreeSet<(usize, u64)>,
    pub new_files:        Vec<(usize, NewFile)>,
}

impl VersionEdit {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_file(
        &mut self,
        level:     usize,
        number:    u64,
        file_size: u64,
        smallest:  InternalKey,
        largest:   InternalKey,
    ) {
        self.new_files.push((
            level,
            NewFile {
                number,
                file_size,
                smallest,
                largest,
            },
        ));
    }

    pub(crate) fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        if let Some(name) = &self.comparator_name {
            write_varint(out, TAG_COMPARATOR);
            write_length_prefixed(out, name.as_bytes());
        }
        if let Some(log_number) = self.log_number {
            write_varint(out, TAG_LOG_NUMBER);
            write_varint(out, log_number);
        }
        if let Some(prev_log_number) = self.prev_log_number {
            write_varint(out, TAG_PREV_LOG_NUMBER);
            write_varint(out, prev_log_number);
        }
        if let Some(next_file_number) = self.next_file_number {
            write_varint(out, TAG_NEXT_FILE_NUMBER);
            write_varint(out, next_file_number);
        }
        if let Some(last_sequence) = self.last_sequence {
            write_varint(out, TAG_LAST_SEQUENCE);
            write_varint(out, last_sequence.0);
        }
        for (level, key) in &self.compact_pointers {
            write_varint(out, TAG_COMPACT_POINTER);
            write_varint(out, *level as u32);
            write_length_prefixed(out, key.as_bytes());
        }
        for (level, number) in &self.deleted_files {
            write_varint(out, TAG_DELETED_FILE);
            write_varint(out, *level as u32);
            write_varint(out, *number);
        }
        for (level, file) in &self.new_files {
            write_varint(out, TAG_NEW_FILE);
            write_varint(out, *level as u32);
            write_varint(out, file.number);
            write_varint(out, file.file_size);
            write_length_prefixed(out, file.smallest.as_bytes());
            write_length_prefixed(out, file.largest.as_bytes());
        }
    }

    pub(crate) fn decode(mut input: &[u8]) -> Result<Self> {
        let mut edit = Self::new();

        while !input.is_empty() {
            let tag: u32 = read_varint(&mut input)?;
            match tag {
                TAG_COMPARATOR => {
                    let name = read_length_prefixed(&mut input)?;
                    let name = String::from_utf8(name.to_vec())
                        .map_err(|_| Error::corruption("comparator name is not UTF-8"))?;
                    edit.comparator_name = Some(name);
                }
                TAG_LOG_NUMBER => {
                    edit.log_number = Some(read_varint(&mut input)?);
                }
                TAG_PREV_LOG_NUMBER => {
                    edit.prev_log_number = Some(read_varint(&mut input)?);
                }
                TAG_NEXT_FILE_NUMBER => {
                    edit.next_file_number = Some(read_varint(&mut input)?);
                }
                TAG_LAST_SEQUENCE => {
                    edit.last_sequence = Some(SequenceNumber(read_varint(&mut input)?));
                }
                TAG_COMPACT_POINTER => {
                    let level = read_level(&mut input)?;
                    let key = read_length_prefixed(&mut input)?;
                    edit.compact_pointers.push((level, InternalKey(key.to_vec())));
                }
                TAG_DELETED_FILE => {
                    let level = read_level(&mut input)?;
                    let number = read_varint(&mut input)?;
                    edit.deleted_files.insert((level, number));
                }
                TAG_NEW_FILE => {
                    let level = read_level(&mut input)?;
                    let number = read_varint(&mut input)?;
                    let file_size = read_varint(&mut input)?;
                    let smallest = InternalKey(read_length_prefixed(&mut input)?.to_vec());
                    let largest = InternalKey(read_length_prefixed(&mut input)?.to_vec());
                    edit.new_files.push((
                        level,
                        NewFile {
                            number,
                            file_size,
                            smallest,
                            largest,
                        },
                    ));
                }
                unknown => {
                    return Err(Error::corruption(format!(
                        "unknown version edit tag {unknown}",
                    )));
                }
            }
        }

        Ok(edit)
    }
}

impl NewFile {
    #[must_use]
    pub(crate) fn into_metadata(self) -> FileMetadata {
        FileMetadata::new(self.number, self.file_size, self.smallest, self.largest)
    }
}

fn write_varint<V: integer_encoding::VarInt>(out: &mut Vec<u8>, value: V) {
    out.write_varint(value).expect("writing to a Vec cannot fail");
}

fn write_length_prefixed(out: &mut Vec<u8>, data: &[u8]) {
    write_varint(out, data.len() as u32);
    out.extend_from_slice(data);
}

fn read_varint<V: integer_encoding::VarInt>(input: &mut &[u8]) -> Result<V> {
    let (value, read) =
        V::decode_var(input).ok_or_else(|| Error::corruption("bad varint in version edit"))?;
    *input = &input[read..];
    Ok(value)
}

fn read_length_prefixed<'a>(input: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len: u32 = read_varint(input)?;
    let len = len as usize;
    if input.len() < len {
        return Err(Error::corruption("version edit field extends past the record"));
    }
    let (data, rest) = input.split_at(len);
    *input = rest;
    Ok(data)
}

fn read_level(input: &mut &[u8]) -> Result<usize> {
    let level: u32 = read_varint(input)?;
    let level = level as usize;
    if level >= NUM_LEVELS {
        return Err(Error::corruption(format!("level {level} out of range")));
    }
    Ok(level)
}


#[cfg(test)]
mod tests {
    use crate::format::ValueType;
    use super::*;

    fn ikey(user_key: &[u8], sequence: u64) -> InternalKey {
        InternalKey::new(user_key, SequenceNumber(sequence), ValueType::Value)
    }

    #[test]
    fn full_edit_round_trips() {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some("leveldb.BytewiseComparator".to_owned());
        edit.log_number = Some(12);
        edit.prev_log_number = Some(0);
        edit.next_file_number = Some(99);
        edit.last_sequence = Some(SequenceNumber(1 << 40));
        edit.compact_pointers.push((2, ikey(b"ptr", 5)));
        edit.delete_file(3, 27);
        edit.add_file(1, 44, 5 << 20, ikey(b"aaa", 100), ikey(b"zzz", 7));

        let mut encoded = Vec::new();
        edit.encode(&mut encoded);
        let decoded = VersionEdit::decode(&encoded).unwrap();

        assert_eq!(decoded.comparator_name.as_deref(), Some("leveldb.BytewiseComparator"));
        assert_eq!(decoded.log_number, Some(12));
        assert_eq!(decoded.prev_log_number, Some(0));
        assert_eq!(decoded.next_file_number, Some(99));
        assert_eq!(decoded.last_sequence, Some(SequenceNumber(1 << 40)));
        assert_eq!(decoded.compact_pointers.len(), 1);
        assert_eq!(decoded.compact_pointers[0].0, 2);
        assert!(decoded.deleted_files.contains(&(3, 27)));
        assert_eq!(decoded.new_files.len(), 1);
        let (level, file) = &decoded.new_files[0];
        assert_eq!(*level, 1);
        assert_eq!(file.number, 44);
        assert_eq!(file.file_size, 5 << 20);
        assert_eq!(file.smallest, ikey(b"aaa", 100));
        assert_eq!(file.largest, ikey(b"zzz", 7));

        // Re-encoding is stable.
        let mut reencoded = Vec::new();
        decoded.encode(&mut reencoded);
        assert_eq!(reencoded, encoded);
    }

    #[test]
    fn empty_edit_is_empty_bytes() {
        let mut encoded = Vec::new();
        VersionEdit::new().encode(&mut encoded);
        assert!(encoded.is_empty());
        let decoded = VersionEdit::decode(&encoded).unwrap();
        assert!(decoded.new_files.is_empty());
    }

    #[test]
    fn unknown_tag_is_corruption() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, 8_u32);
        assert!(VersionEdit::decode(&bytes).is_err());
    }

    #[test]
    fn out_of_range_level_is_corruption() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, TAG_DELETED_FILE);
        write_varint(&mut bytes, 70_u32);
        write_varint(&mut bytes, 1_u64);
        assert!(VersionEdit::decode(&bytes).is_err());
    }
}
