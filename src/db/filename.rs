//! Database file naming.
//!
//! All numbered files use a zero-padded six-digit decimal number and a fixed
//! suffix; parsing is case-sensitive.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Kinds of files found in a database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// `<n>.log` — write-ahead log.
    Log,
    /// `LOCK` — advisory lock file.
    DbLock,
    /// `<n>.ldb` (or legacy `<n>.sst`) — sorted table.
    Table,
    /// `MANIFEST-<n>` — version edit log.
    Descriptor,
    /// `CURRENT` — points at the active manifest.
    Current,
    /// `<n>.dbtmp` — scratch file used for atomic renames.
    Temp,
}

/// `<dbname>/<n>.log`
pub fn log_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{:06}.log", number))
}

/// `<dbname>/<n>.ldb`
pub fn table_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{:06}.ldb", number))
}

/// `<dbname>/<n>.sst` — legacy table suffix, still readable.
pub fn sst_table_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{:06}.sst", number))
}

/// `<dbname>/MANIFEST-<n>`
pub fn descriptor_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("MANIFEST-{:06}", number))
}

/// `<dbname>/CURRENT`
pub fn current_file_name(dbname: &Path) -> PathBuf {
    dbname.join("CURRENT")
}

/// `<dbname>/LOCK`
pub fn lock_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOCK")
}

/// `<dbname>/<n>.dbtmp`
pub fn temp_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{:06}.dbtmp", number))
}

/// Classifies a file name (not a path) from the database directory.
///
/// Returns the type and the file number (zero for unnumbered files), or
/// `None` for names the engine does not own.
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    match name {
        "CURRENT" => return Some((FileType::Current, 0)),
        "LOCK" => return Some((FileType::DbLock, 0)),
        _ => {}
    }

    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number: u64 = rest.parse().ok()?;
        return Some((FileType::Descriptor, number));
    }

    let (digits, suffix) = name.split_once('.')?;
    let number: u64 = digits.parse().ok()?;
    // Reject names like "12x34.log" that parse in two pieces.
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match suffix {
        "log" => Some((FileType::Log, number)),
        "ldb" | "sst" => Some((FileType::Table, number)),
        "dbtmp" => Some((FileType::Temp, number)),
        _ => None,
    }
}

/// Atomically points `CURRENT` at `MANIFEST-<descriptor_number>` by writing
/// a temp file and renaming it into place.
pub fn set_current_file(dbname: &Path, descriptor_number: u64) -> Result<()> {
    let manifest = format!("MANIFEST-{:06}\n", descriptor_number);
    let tmp = temp_file_name(dbname, descriptor_number);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(manifest.as_bytes())?;
    file.sync_all()?;
    drop(file);

    if let Err(err) = fs::rename(&tmp, current_file_name(dbname)) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

/// Reads `CURRENT` and returns the active manifest's file name.
pub fn read_current_file(dbname: &Path) -> Result<String> {
    let contents = fs::read_to_string(current_file_name(dbname))?;
    let name = contents.trim_end_matches('\n');
    if name.is_empty() || contents == name {
        return Err(crate::Error::corruption("CURRENT file is malformed"));
    }
    Ok(name.to_string())
}
