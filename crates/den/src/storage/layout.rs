//! On-disk layout of an archive root.
//!
//! ```text
//! <root>/
//!   summary.den  reghdr.den  regdat.den  seal.den
//!   RB1/
//!     summary.den  reghdr.den  regdat.den  seal.den
//!     FS1/  frames.den  seal.den
//!     FS2/  ...
//!     NOTRECOVERED/  UNRECOVERABLE/
//!   RB2/ ...
//!   NOTRECOVERED/  UNRECOVERABLE/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Result;

/// Prefix of partition directories.
pub const PARTITION_PREFIX: &str = "RB";
/// Prefix of chunk-group directories.
pub const GROUP_PREFIX: &str = "FS";
/// Summary file name.
pub const SUMMARY_FILE: &str = "summary.den";
/// Registration header file name.
pub const REGISTRATION_HEADER_FILE: &str = "reghdr.den";
/// Registration data file name.
pub const REGISTRATION_DATA_FILE: &str = "regdat.den";
/// Seal file name.
pub const SEAL_FILE: &str = "seal.den";
/// Chunk-group data file name.
pub const GROUP_DATA_FILE: &str = "frames.den";
/// Quarantine for groups whose seal or ordering failed.
pub const NOT_RECOVERED_DIR: &str = "NOTRECOVERED";
/// Quarantine for groups whose data cannot be read.
pub const UNRECOVERABLE_DIR: &str = "UNRECOVERABLE";

/// Files that live at the top of a partition or archive root.
pub const ROOT_FILES: [&str; 4] = [
    SUMMARY_FILE,
    REGISTRATION_HEADER_FILE,
    REGISTRATION_DATA_FILE,
    SEAL_FILE,
];

/// Path builder for an archive root.
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    root: PathBuf,
}

impl ArchiveLayout {
    /// Creates a layout rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Returns the archive root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory of partition `id`.
    pub fn partition_dir(&self, id: u32) -> PathBuf {
        self.root.join(partition_dir_name(id))
    }

    /// Lists partition directories in ascending id order.
    pub fn list_partitions(&self) -> Result<Vec<(u32, PathBuf)>> {
        list_numbered(&self.root, parse_partition_dir_name)
    }
}

/// Builds `RB<id>`.
pub fn partition_dir_name(id: u32) -> String {
    format!("{PARTITION_PREFIX}{id}")
}

/// Builds `FS<id>`.
pub fn group_dir_name(id: u64) -> String {
    format!("{GROUP_PREFIX}{id}")
}

/// Parses `RB<id>`.
pub fn parse_partition_dir_name(name: &str) -> Option<u32> {
    parse_numbered(name, PARTITION_PREFIX)
}

/// Parses `FS<id>`.
pub fn parse_group_dir_name(name: &str) -> Option<u64> {
    parse_numbered(name, GROUP_PREFIX)
}

fn parse_numbered<N: std::str::FromStr>(name: &str, prefix: &str) -> Option<N> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Returns the directory of group `id` inside a partition directory.
pub fn group_dir(partition_dir: &Path, id: u64) -> PathBuf {
    partition_dir.join(group_dir_name(id))
}

/// Lists chunk-group directories of a partition in ascending id order.
pub fn list_groups(partition_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    list_numbered(partition_dir, parse_group_dir_name)
}

fn list_numbered<N: Ord + Copy>(
    dir: &Path,
    parse: fn(&str) -> Option<N>,
) -> Result<Vec<(N, PathBuf)>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str().and_then(parse) {
            found.push((id, entry.path()));
        }
    }
    found.sort_by_key(|(id, _)| *id);
    Ok(found)
}

/// Moves `src` into the quarantine directory `quarantine_name` under `parent`.
///
/// An existing entry of the same name is never overwritten; a numeric suffix
/// is added instead. Returns the destination path.
pub fn quarantine(src: &Path, parent: &Path, quarantine_name: &str) -> Result<PathBuf> {
    let quarantine_dir = parent.join(quarantine_name);
    fs::create_dir_all(&quarantine_dir)?;
    let base = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "entry".to_string());

    let mut dest = quarantine_dir.join(&base);
    let mut suffix = 1;
    while dest.exists() {
        dest = quarantine_dir.join(format!("{base}.{suffix}"));
        suffix += 1;
    }
    fs::rename(src, &dest)?;
    warn!("Quarantined {:?} to {:?}", src, dest);
    Ok(dest)
}

/// Deletes a directory tree, ignoring a tree that is already gone.
pub fn delete_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Removes a file, ignoring one that is already gone.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
