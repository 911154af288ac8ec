//! The `VersionSet`: owns the current [`Version`], the catalog counters, the
//! open MANIFEST writer, and the compaction picker.

use std::collections::HashSet;
use std::io::Read as _;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use silt_sstable::Comparator as _;
use silt_vfs::Filesystem;

use crate::compaction::Compaction;
use crate::config::{EXPANDED_COMPACTION_FACTOR, NUM_LEVELS};
use crate::error::{Error, Result};
use crate::filenames::{DbFile, set_current_file};
use crate::format::{InternalKey, InternalKeyComparator};
use crate::options::Options;
use crate::table_cache::TableCache;
use crate::wal::{LogReader, LogWriter};
use super::builder::VersionBuilder;
use super::edit::VersionEdit;
use super::{FileRef, Version, total_file_size};


pub(crate) struct VersionSet<FS: Filesystem> {
    fs:      FS,
    db_path: PathBuf,
    options: Arc<Options>,
    icmp:    InternalKeyComparator,

    next_file_number:     u64,
    manifest_file_number: u64,
    last_sequence:        crate::format::SequenceNumber,
    /// Write-ahead logs numbered below this are obsolete.
    log_number:           u64,
    /// A second live log from a half-finished memtable switch on a previous
    /// incarnation; zero when unused.
    prev_log_number:      u64,

    current:       Arc<Version>,
    /// Superseded versions that iterators or compactions may still hold.
    old_versions:  Vec<Weak<Version>>,

    /// Where the next size compaction in each level resumes (the largest key
    /// of the last compaction there), for round-robin coverage.
    compact_pointers: [Option<InternalKey>; NUM_LEVELS],

    /// The open MANIFEST. Taken out while a write is in flight (the database
    /// mutex is released around the write).
    manifest: Option<LogWriter<FS::WritableFile>>,
}

/// In-flight state between [`VersionSet::prepare_apply`] and
/// [`VersionSet::install`]. The MANIFEST write itself
/// ([`ManifestWriteToken::write`]) runs without the database mutex.
pub(crate) struct ManifestWriteToken<FS: Filesystem> {
    edit:            VersionEdit,
    new_version:     Arc<Version>,
    writer:          LogWriter<FS::WritableFile>,
    /// Set when this is the first write to a fresh MANIFEST: on success,
    /// CURRENT must be pointed at it.
    install_current: bool,
    manifest_number: u64,
    fs:              FS,
    db_path:         PathBuf,
}

impl<FS: Filesystem> ManifestWriteToken<FS> {
    /// Append the edit record, fsync, and (for a fresh MANIFEST) swing
    /// CURRENT. Safe to run without the database mutex: the token owns the
    /// writer and nothing else touches the MANIFEST meanwhile.
    pub(crate) fn write(&mut self) -> Result<()> {
        let mut record = Vec::new();
        self.edit.encode(&mut record);
        self.writer.add_record(&record)?;
        self.writer.sync()?;

        if self.install_current {
            set_current_file(&self.fs, &self.db_path, self.manifest_number)?;
        }
        Ok(())
    }
}

impl<FS: Filesystem> VersionSet<FS> {
    pub(crate) fn new(
        fs:      FS,
        db_path: PathBuf,
        options: Arc<Options>,
        icmp:    InternalKeyComparator,
    ) -> Self {
        Self {
            fs,
            db_path,
            options,
            icmp,
            next_file_number:     2,
            manifest_file_number: 0,
            last_sequence:        crate::format::SequenceNumber::ZERO,
            log_number:           0,
            prev_log_number:      0,
            current:              Arc::new(Version::empty()),
            old_versions:         Vec::new(),
            compact_pointers:     std::array::from_fn(|_| None),
            manifest:             None,
        }
    }

    // ----------------------------------------------------------------
    //  Counters
    // ----------------------------------------------------------------

    #[must_use]
    pub(crate) fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub(crate) fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Hand back the most recently allocated file number, if nothing newer
    /// was allocated since.
    pub(crate) fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    pub(crate) fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    #[must_use]
    pub(crate) fn last_sequence(&self) -> crate::format::SequenceNumber {
        self.last_sequence
    }

    pub(crate) fn set_last_sequence(&mut self, sequence: crate::format::SequenceNumber) {
        debug_assert!(sequence >= self.last_sequence, "sequence numbers regress");
        self.last_sequence = sequence;
    }

    #[must_use]
    pub(crate) fn log_number(&self) -> u64 {
        self.log_number
    }

    #[must_use]
    pub(crate) fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    #[must_use]
    pub(crate) fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    #[must_use]
    pub(crate) fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    #[must_use]
    pub(crate) fn needs_compaction(&self) -> bool {
        self.current.needs_compaction()
    }

    /// Every table file referenced by the current or any still-reachable old
    /// version.
    #[must_use]
    pub(crate) fn live_files(&mut self) -> HashSet<u64> {
        self.old_versions.retain(|weak| weak.strong_count() > 0);

        let mut live = HashSet::new();
        let versions = self
            .old_versions
            .iter()
            .filter_map(Weak::upgrade)
            .chain(std::iter::once(Arc::clone(&self.current)));
        for version in versions {
            for level_files in &version.files {
                live.extend(level_files.iter().map(|file| file.number));
            }
        }
        live
    }

    // ----------------------------------------------------------------
    //  Recovery
    // ----------------------------------------------------------------

    /// Rebuild the catalog from CURRENT's MANIFEST.
    ///
    /// Returns whether a fresh MANIFEST must be written (i.e. the old one is
    /// not being reused).
    pub(crate) fn recover(&mut self) -> Result<bool> {
        let current_path = DbFile::Current.path_in(&self.db_path);
        let mut current_contents = String::new();
        self.fs
            .open_sequential(&current_path)?
            .read_to_string(&mut current_contents)
            .map_err(|err| Error::corruption(format!("CURRENT unreadable: {err}")))?;
        if current_contents.pop() != Some('\n') {
            return Err(Error::corruption("CURRENT does not end with a newline"));
        }

        let manifest_file = DbFile::parse(std::path::Path::new(&current_contents));
        let Some(DbFile::Manifest(manifest_number)) = manifest_file else {
            return Err(Error::corruption(format!(
                "CURRENT names {current_contents:?}, which is not a MANIFEST",
            )));
        };
        let manifest_path = self.db_path.join(&current_contents);

        let mut corruption: Option<String> = None;
        let manifest = self.fs.open_sequential(&manifest_path)?;
        let mut reader = LogReader::new(manifest, |bytes: usize, reason: &str| {
            warn!(bytes, reason, "MANIFEST corruption");
            if corruption.is_none() {
                corruption = Some(format!("MANIFEST: {reason} ({bytes} bytes dropped)"));
            }
        });

        let mut builder = VersionBuilder::new(&self.icmp, &self.current);
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        while let Some(record) = reader.read_record() {
            let edit = VersionEdit::decode(&record)?;

            if let Some(name) = &edit.comparator_name {
                if name != self.icmp.user_cmp.name() {
                    return Err(Error::invalid_argument(format!(
                        "database was written with comparator {name}, opened with {}",
                        self.icmp.user_cmp.name(),
                    )));
                }
            }

            for (level, key) in &edit.compact_pointers {
                self.compact_pointers[*level] = Some(key.clone());
            }
            builder.apply(&edit);

            log_number = edit.log_number.or(log_number);
            prev_log_number = edit.prev_log_number.or(prev_log_number);
            next_file_number = edit.next_file_number.or(next_file_number);
            last_sequence = edit.last_sequence.or(last_sequence);
        }
        drop(reader);

        if let Some(reason) = corruption {
            return Err(Error::corruption(reason));
        }

        let next_file_number =
            next_file_number.ok_or_else(|| Error::corruption("MANIFEST has no next-file entry"))?;
        let log_number =
            log_number.ok_or_else(|| Error::corruption("MANIFEST has no log-number entry"))?;
        let last_sequence = last_sequence
            .ok_or_else(|| Error::corruption("MANIFEST has no last-sequence entry"))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        self.current = Arc::new(builder.finish(self.options.paranoid_checks)?);
        self.next_file_number = next_file_number;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);
        self.mark_file_number_used(manifest_number);

        info!(
            manifest = manifest_number,
            last_sequence = last_sequence.0,
            summary = %self.current.level_summary(),
            "catalog recovered",
        );

        if self.try_reuse_manifest(&manifest_path, manifest_number) {
            self.manifest_file_number = manifest_number;
            Ok(false)
        } else {
            self.manifest_file_number = self.new_file_number();
            Ok(true)
        }
    }

    /// Keep appending to the recovered MANIFEST instead of starting a fresh
    /// one. Only attempted under `reuse_logs`, and only while the file is
    /// still reasonably small.
    fn try_reuse_manifest(&mut self, manifest_path: &std::path::Path, number: u64) -> bool {
        if !self.options.reuse_logs {
            return false;
        }
        let Ok(size) = self.fs.size_of(manifest_path) else {
            return false;
        };
        if size >= self.options.max_file_size {
            return false;
        }
        let Ok(file) = self.fs.open_appendable(manifest_path) else {
            return false;
        };
        debug!(manifest = number, size, "reusing MANIFEST");
        self.manifest = Some(LogWriter::with_offset(file, size));
        true
    }

    // ----------------------------------------------------------------
    //  Applying edits
    // ----------------------------------------------------------------

    /// First half of logging an edit: complete its bookkeeping fields, build
    /// the successor version, and take out the MANIFEST writer (creating a
    /// fresh MANIFEST seeded with a snapshot of the whole catalog when none
    /// is open).
    ///
    /// The caller must then run [`ManifestWriteToken::write`] - with the
    /// database mutex released - and hand the token back to
    /// [`VersionSet::install`]. Only one token may exist at a time; the
    /// write path is single-threaded by the writer queue.
    pub(crate) fn prepare_apply(&mut self, mut edit: VersionEdit) -> Result<ManifestWriteToken<FS>> {
        if edit.log_number.is_none() {
            edit.log_number = Some(self.log_number);
        }
        if edit.prev_log_number.is_none() {
            edit.prev_log_number = Some(self.prev_log_number);
        }
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(self.last_sequence);

        let mut builder = VersionBuilder::new(&self.icmp, &self.current);
        builder.apply(&edit);
        let new_version = Arc::new(builder.finish(self.options.paranoid_checks)?);

        for (level, key) in &edit.compact_pointers {
            self.compact_pointers[*level] = Some(key.clone());
        }

        let (writer, install_current) = match self.manifest.take() {
            Some(writer) => (writer, false),
            None => (self.create_manifest()?, true),
        };

        Ok(ManifestWriteToken {
            edit,
            new_version,
            writer,
            install_current,
            manifest_number: self.manifest_file_number,
            fs: self.fs.clone(),
            db_path: self.db_path.clone(),
        })
    }

    /// Second half: on success, promote the new version and restore the
    /// writer; on failure, discard both (the next edit starts a fresh
    /// MANIFEST, and the on-disk catalog still describes the old state).
    pub(crate) fn install(
        &mut self,
        token:        ManifestWriteToken<FS>,
        write_result: &Result<()>,
    ) {
        match write_result {
            Ok(()) => {
                self.manifest = Some(token.writer);
                self.old_versions.retain(|weak| weak.strong_count() > 0);
                self.old_versions.push(Arc::downgrade(&self.current));
                self.current = token.new_version;
                self.log_number = token.edit.log_number.expect("filled in prepare_apply");
                self.prev_log_number =
                    token.edit.prev_log_number.expect("filled in prepare_apply");
            }
            Err(err) => {
                warn!(error = %err, "MANIFEST write failed; edit discarded");
                if token.install_current {
                    let path = DbFile::Manifest(token.manifest_number).path_in(&self.db_path);
                    let _ = self.fs.delete(&path);
                }
                // `self.manifest` stays `None`: the next prepare_apply
                // creates a fresh MANIFEST with a full snapshot.
                self.manifest_file_number = self.next_file_number;
                self.next_file_number += 1;
            }
        }
    }

    /// Create the MANIFEST file for `self.manifest_file_number` and seed it
    /// with a snapshot of the current catalog.
    fn create_manifest(&mut self) -> Result<LogWriter<FS::WritableFile>> {
        let path = DbFile::Manifest(self.manifest_file_number).path_in(&self.db_path);
        let file = self.fs.open_writable(&path)?;
        let mut writer = LogWriter::new(file);

        let mut snapshot = VersionEdit::new();
        snapshot.comparator_name = Some(self.icmp.user_cmp.name().to_owned());
        for (level, pointer) in self.compact_pointers.iter().enumerate() {
            if let Some(key) = pointer {
                snapshot.compact_pointers.push((level, key.clone()));
            }
        }
        for (level, files) in self.current.files.iter().enumerate() {
            for file in files {
                snapshot.add_file(
                    level,
                    file.number,
                    file.file_size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
            }
        }

        let mut record = Vec::new();
        snapshot.encode(&mut record);
        if let Err(err) = writer.add_record(&record) {
            let _ = self.fs.delete(&path);
            return Err(err.into());
        }
        Ok(writer)
    }

    // ----------------------------------------------------------------
    //  Compaction picking
    // ----------------------------------------------------------------

    /// Choose the next compaction, size-triggered picks first.
    pub(crate) fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = Arc::clone(&self.current);
        let max_file_size = self.options.max_file_size;

        let mut compaction = if current.compaction_score >= 1.0 {
            let level = current.compaction_level;
            debug_assert!(level + 1 < NUM_LEVELS, "cannot compact the last level");
            let mut compaction = Compaction::new(level, max_file_size, Arc::clone(&current));

            // Resume after the last compacted key in this level, wrapping.
            let pointer = &self.compact_pointers[level];
            let next_file = current.files[level].iter().find(|file| {
                pointer.as_ref().is_none_or(|pointer| {
                    self.icmp.cmp(file.largest.as_bytes(), pointer.as_bytes()).is_gt()
                })
            });
            let chosen = next_file.or_else(|| current.files[level].first())?;
            compaction.inputs[0].push(Arc::clone(chosen));
            compaction
        } else if let Some((level, file)) = current.take_seek_compaction() {
            let mut compaction = Compaction::new(level, max_file_size, Arc::clone(&current));
            compaction.inputs[0].push(file);
            compaction
        } else {
            return None;
        };

        // Level-0 files overlap each other: widen to the full overlap set.
        if compaction.level == 0 {
            let (smallest, largest) = self.key_range(&compaction.inputs[0]);
            compaction.inputs[0] =
                current.overlapping_inputs(&self.icmp, 0, Some(&smallest), Some(&largest));
            debug_assert!(!compaction.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// A manual compaction of `level` over the given range. `None` when the
    /// level has nothing in the range.
    pub(crate) fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end:   Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = Arc::clone(&self.current);
        let mut inputs = current.overlapping_inputs(&self.icmp, level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Beyond level 0, cap one manual round at a level's file-size budget
        // so a whole-database compaction proceeds in digestible slices.
        if level > 0 {
            let limit = self.options.max_file_size;
            let mut total = 0;
            for (index, file) in inputs.iter().enumerate() {
                total += file.file_size;
                if total >= limit && index + 1 < inputs.len() {
                    inputs.truncate(index + 1);
                    break;
                }
            }
        }

        let mut compaction =
            Compaction::new(level, self.options.max_file_size, Arc::clone(&current));
        compaction.inputs[0] = inputs;
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Complete a compaction plan: pull in the level+1 overlap, opportunely
    /// grow the level-`n` inputs while that stays free, collect grandparents,
    /// and advance the level's compaction pointer.
    fn setup_other_inputs(&mut self, compaction: &mut Compaction) {
        let current = Arc::clone(&compaction.input_version);
        let level = compaction.level;

        let (smallest, mut largest) = self.key_range(&compaction.inputs[0]);
        compaction.inputs[1] =
            current.overlapping_inputs(&self.icmp, level + 1, Some(&smallest), Some(&largest));

        let (mut all_start, mut all_limit) =
            self.key_range_pair(&compaction.inputs[0], &compaction.inputs[1]);

        if !compaction.inputs[1].is_empty() {
            let expanded0 =
                current.overlapping_inputs(&self.icmp, level, Some(&all_start), Some(&all_limit));
            let inputs1_size = total_file_size(&compaction.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            let fits = inputs1_size + expanded0_size
                < EXPANDED_COMPACTION_FACTOR * self.options.max_file_size;

            if expanded0.len() > compaction.inputs[0].len() && fits {
                let (expanded_start, new_limit) = self.key_range(&expanded0);
                let expanded1 = current.overlapping_inputs(
                    &self.icmp,
                    level + 1,
                    Some(&expanded_start),
                    Some(&new_limit),
                );
                if expanded1.len() == compaction.inputs[1].len() {
                    debug!(
                        level,
                        from = compaction.inputs[0].len(),
                        to = expanded0.len(),
                        "expanding compaction inputs",
                    );
                    largest = new_limit;
                    compaction.inputs[0] = expanded0;
                    compaction.inputs[1] = expanded1;
                    (all_start, all_limit) =
                        self.key_range_pair(&compaction.inputs[0], &compaction.inputs[1]);
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            compaction.grandparents = current.overlapping_inputs(
                &self.icmp,
                level + 2,
                Some(&all_start),
                Some(&all_limit),
            );
        }

        // Future size compactions of this level resume past this range, even
        // if the compaction later fails (retrying elsewhere first is fine).
        self.compact_pointers[level] = Some(largest.clone());
        compaction.edit.compact_pointers.push((level, largest));
    }

    fn key_range(&self, files: &[FileRef]) -> (InternalKey, InternalKey) {
        debug_assert!(!files.is_empty(), "key range of no files");
        let mut smallest = files[0].smallest.clone();
        let mut largest = files[0].largest.clone();
        for file in &files[1..] {
            if self.icmp.cmp(file.smallest.as_bytes(), smallest.as_bytes()).is_lt() {
                smallest = file.smallest.clone();
            }
            if self.icmp.cmp(file.largest.as_bytes(), largest.as_bytes()).is_gt() {
                largest = file.largest.clone();
            }
        }
        (smallest, largest)
    }

    fn key_range_pair(&self, a: &[FileRef], b: &[FileRef]) -> (InternalKey, InternalKey) {
        let combined: Vec<FileRef> = a.iter().chain(b).cloned().collect();
        self.key_range(&combined)
    }

    // ----------------------------------------------------------------
    //  Sizes
    // ----------------------------------------------------------------

    /// Approximate byte offset of `internal_key` within the whole database:
    /// whole files before it count fully, the file containing it counts by
    /// its in-file offset.
    pub(crate) fn approximate_offset_of(
        &self,
        table_cache:  &TableCache<FS>,
        version:      &Version,
        internal_key: &[u8],
    ) -> u64 {
        let mut offset = 0;
        for (level, files) in version.files.iter().enumerate() {
            for file in files {
                if self.icmp.cmp(file.largest.as_bytes(), internal_key).is_lt() {
                    offset += file.file_size;
                } else if self.icmp.cmp(file.smallest.as_bytes(), internal_key).is_gt() {
                    // Entirely past the key. Later files in a sorted level
                    // are too.
                    if level > 0 {
                        break;
                    }
                } else if let Ok(table) = table_cache.table(file.number, file.file_size) {
                    offset += table.approximate_offset_of(internal_key);
                }
            }
        }
        offset
    }
}

impl<FS: Filesystem> std::fmt::Debug for VersionSet<FS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSet")
            .field("next_file_number", &self.next_file_number)
            .field("manifest_file_number", &self.manifest_file_number)
            .field("last_sequence", &self.last_sequence)
            .field("log_number", &self.log_number)
            .field("prev_log_number", &self.prev_log_number)
            .field("levels", &self.current.level_summary())
            .finish_non_exhaustive()
    }
}
