//! The files in a database directory, by name.

use std::path::{Path, PathBuf};

use silt_vfs::Filesystem;

use crate::error::Result;


/// Every file the engine may place in (or find in) a database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DbFile {
    /// `<N>.log` - write-ahead log.
    Log(u64),
    /// `<N>.ldb` - table file.
    Table(u64),
    /// `<N>.sst` - table file written by older releases.
    LegacyTable(u64),
    /// `MANIFEST-<N>` - the catalog's edit log.
    Manifest(u64),
    /// `<N>.dbtmp` - scratch file for rename-into-place operations.
    Temp(u64),
    /// `CURRENT` - one line naming the live MANIFEST.
    Current,
    /// `LOCK` - held exclusively while the database is open.
    Lock,
    /// `LOG` / `LOG.old` - info log files, recognized but not interpreted.
    InfoLog,
    OldInfoLog,
}

impl DbFile {
    #[must_use]
    pub(crate) fn file_name(self) -> PathBuf {
        match self {
            Self::Log(number)         => format!("{number:06}.log").into(),
            Self::Table(number)       => format!("{number:06}.ldb").into(),
            Self::LegacyTable(number) => format!("{number:06}.sst").into(),
            Self::Manifest(number)    => format!("MANIFEST-{number:06}").into(),
            Self::Temp(number)        => format!("{number:06}.dbtmp").into(),
            Self::Current             => "CURRENT".into(),
            Self::Lock                => "LOCK".into(),
            Self::InfoLog             => "LOG".into(),
            Self::OldInfoLog          => "LOG.old".into(),
        }
    }

    #[must_use]
    pub(crate) fn path_in(self, db_path: &Path) -> PathBuf {
        db_path.join(self.file_name())
    }

    /// Parse a directory entry name. `None` for foreign files, which the
    /// engine leaves alone.
    #[must_use]
    pub(crate) fn parse(file_name: &Path) -> Option<Self> {
        let name = file_name.to_str()?;

        match name {
            "CURRENT" => return Some(Self::Current),
            "LOCK"    => return Some(Self::Lock),
            "LOG"     => return Some(Self::InfoLog),
            "LOG.old" => return Some(Self::OldInfoLog),
            _ => {}
        }

        if let Some(number) = name.strip_prefix("MANIFEST-") {
            return parse_file_number(number).map(Self::Manifest);
        }
        if let Some(number) = name.strip_suffix(".log") {
            return parse_file_number(number).map(Self::Log);
        }
        if let Some(number) = name.strip_suffix(".ldb") {
            return parse_file_number(number).map(Self::Table);
        }
        if let Some(number) = name.strip_suffix(".sst") {
            return parse_file_number(number).map(Self::LegacyTable);
        }
        if let Some(number) = name.strip_suffix(".dbtmp") {
            return parse_file_number(number).map(Self::Temp);
        }
        None
    }
}

/// The path of the table file `number`, preferring the `.ldb` name but
/// falling back to the legacy `.sst` name when only that exists.
pub(crate) fn table_file_path<FS: Filesystem>(
    fs:      &FS,
    db_path: &Path,
    number:  u64,
) -> PathBuf {
    let preferred = DbFile::Table(number).path_in(db_path);
    if matches!(fs.exists(&preferred), Ok(true)) {
        return preferred;
    }
    let legacy = DbFile::LegacyTable(number).path_in(db_path);
    if matches!(fs.exists(&legacy), Ok(true)) {
        return legacy;
    }
    preferred
}

/// Atomically point `CURRENT` at `MANIFEST-<manifest_number>`: write the name
/// to a temp file, fsync it, rename it over `CURRENT`, fsync the directory.
pub(crate) fn set_current_file<FS: Filesystem>(
    fs:              &FS,
    db_path:         &Path,
    manifest_number: u64,
) -> Result<()> {
    use std::io::Write as _;

    let manifest_name = DbFile::Manifest(manifest_number).file_name();
    let temp_path = DbFile::Temp(manifest_number).path_in(db_path);

    let mut temp = fs.open_writable(&temp_path)?;
    temp.write_all(manifest_name.to_str().expect("manifest names are ASCII").as_bytes())?;
    temp.write_all(b"\n")?;
    silt_vfs::WritableFile::sync_data(&mut temp)?;
    drop(temp);

    let current_path = DbFile::Current.path_in(db_path);
    if let Err(err) = fs.rename(&temp_path, &current_path) {
        let _ = fs.delete(&temp_path);
        return Err(err.into());
    }
    fs.sync_dir(db_path)?;
    Ok(())
}

fn parse_file_number(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for file in [
            DbFile::Log(7),
            DbFile::Table(123_456),
            DbFile::LegacyTable(3),
            DbFile::Manifest(42),
            DbFile::Temp(9),
            DbFile::Current,
            DbFile::Lock,
            DbFile::InfoLog,
            DbFile::OldInfoLog,
        ] {
            let name = file.file_name();
            assert_eq!(DbFile::parse(&name), Some(file), "{name:?}");
        }
    }

    #[test]
    fn foreign_names_are_ignored() {
        for name in ["foo", "100", "100.bar", ".log", "MANIFEST-", "MANIFEST-+1", "12x34.ldb"] {
            assert_eq!(DbFile::parse(Path::new(name)), None, "{name}");
        }
    }
}
