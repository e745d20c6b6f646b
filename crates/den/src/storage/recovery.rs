//! Archive validation and best-effort recovery.
//!
//! Validation walks a partition's chunk-groups oldest to newest. A group is
//! valid when its seal parses, its data file matches the seal and its seal
//! time is no earlier than the previous valid group's and no later than the
//! partition seal. The valid chain stops at the first break; everything from
//! the break onward is invalid.
//!
//! Recovery quarantines invalid groups (never deletes them) and rewrites the
//! partition summary, registration and seal over the surviving chain.
//!
//! ```text
//! FS1 ✓  FS2 ✗(seal)  FS3 ✓
//!  │        │           │
//!  keep     └─────┬─────┘
//!                 ▼
//!           NOTRECOVERED/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{DenError, Result};
use crate::registration::Registration;
use crate::storage::group_file::read_group;
use crate::storage::layout::{
    list_groups, quarantine, ArchiveLayout, NOT_RECOVERED_DIR, REGISTRATION_DATA_FILE,
    ROOT_FILES, UNRECOVERABLE_DIR,
};
use crate::storage::seal::{Seal, SealClock};
use crate::storage::summary::Summary;
use crate::storage::write_partition_files;
use crate::tier::archive::GroupMeta;

/// Consecutive recovery passes allowed before giving up.
pub const MAX_RECOVERY_ATTEMPTS: usize = 2;

/// Where an invalid group is moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quarantine {
    /// Readable data whose seal is missing, broken, or out of order.
    NotRecovered,
    /// Data that cannot be decoded.
    Unrecoverable,
}

impl Quarantine {
    fn dir_name(self) -> &'static str {
        match self {
            Self::NotRecovered => NOT_RECOVERED_DIR,
            Self::Unrecoverable => UNRECOVERABLE_DIR,
        }
    }
}

/// A chunk-group that failed validation.
#[derive(Debug, Clone)]
pub struct InvalidGroup {
    /// Group id.
    pub id: u64,
    /// Group directory.
    pub dir: PathBuf,
    /// Quarantine destination.
    pub quarantine: Quarantine,
    /// Why the group failed.
    pub reason: String,
}

/// Outcome of validating one partition directory.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Groups on the valid chain, oldest first.
    pub valid: Vec<GroupMeta>,
    /// Groups from the first break onward.
    pub invalid: Vec<InvalidGroup>,
    /// Partition seal, if it parsed.
    pub partition_seal: Option<Seal>,
    /// The partition seal covers the registration file and every valid group.
    pub partition_seal_valid: bool,
    /// Partition summary, if it parsed.
    pub summary: Option<Summary>,
}

impl ValidationReport {
    /// Returns true if recovery must run before the archive is used.
    pub fn needs_recovery(&self) -> bool {
        if !self.invalid.is_empty() {
            return true;
        }
        !self.valid.is_empty() && (!self.partition_seal_valid || self.summary.is_none())
    }

    /// Returns the newest seal time seen on the valid chain or the partition seal.
    pub fn last_seal(&self) -> i64 {
        let groups = self
            .valid
            .iter()
            .filter_map(|g| g.seal.map(|s| s.as_of))
            .max()
            .unwrap_or(0);
        let partition = self.partition_seal.map_or(0, |s| s.as_of);
        groups.max(partition)
    }
}

/// Group ids sorted by recovery outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Groups kept on the rebuilt chain.
    pub recovered: Vec<u64>,
    /// Groups moved to `NOTRECOVERED/`.
    pub not_recovered: Vec<u64>,
    /// Groups moved to `UNRECOVERABLE/`.
    pub unrecoverable: Vec<u64>,
}

/// A partition archive ready for use.
#[derive(Debug, Clone)]
pub struct LoadedArchive {
    /// Valid groups, oldest first.
    pub groups: Vec<GroupMeta>,
    /// Clock issuing seal times after everything on disk.
    pub clock: SealClock,
    /// The partition seal on disk is current.
    pub sealed: bool,
    /// Partition summary as found on disk.
    pub summary: Option<Summary>,
    /// Last recovery pass, if one ran.
    pub recovery: Option<RecoveryReport>,
}

/// Validates the archive of the partition in `dir`.
pub fn validate_partition(dir: &Path) -> Result<ValidationReport> {
    let partition_seal = match Seal::read(dir) {
        Ok(seal) => seal,
        Err(e) => {
            warn!("Partition seal in {:?} is unreadable: {}", dir, e);
            None
        }
    };
    let summary = match Summary::read(dir) {
        Ok(summary) => summary,
        Err(e) => {
            warn!("Partition summary in {:?} is unreadable: {}", dir, e);
            None
        }
    };
    let before = partition_seal.map_or(i64::MAX, |s| s.as_of);

    let mut report = ValidationReport {
        partition_seal,
        summary,
        ..ValidationReport::default()
    };
    let mut after = i64::MIN;
    for (id, group_dir) in list_groups(dir)? {
        let loaded = load_group(&group_dir);
        if !report.invalid.is_empty() {
            let (quarantine, reason) = match loaded {
                Err(invalid) => invalid,
                Ok(_) => (
                    Quarantine::NotRecovered,
                    "follows a broken group".to_string(),
                ),
            };
            report.invalid.push(InvalidGroup {
                id,
                dir: group_dir,
                quarantine,
                reason,
            });
            continue;
        }

        let checked = loaded.and_then(|(meta, seal)| {
            seal.validate(after, before)
                .map(|()| (meta, seal))
                .map_err(|e| (Quarantine::NotRecovered, e.to_string()))
        });
        match checked {
            Ok((meta, seal)) => {
                after = seal.as_of;
                report.valid.push(meta);
            }
            Err((quarantine, reason)) => {
                warn!("Chunk-group {:?} failed validation: {}", group_dir, reason);
                report.invalid.push(InvalidGroup {
                    id,
                    dir: group_dir,
                    quarantine,
                    reason,
                });
            }
        }
    }

    report.partition_seal_valid = match partition_seal {
        Some(seal) => {
            seal.as_of >= after && seal.verify_file(&dir.join(REGISTRATION_DATA_FILE)).is_ok()
        }
        None => false,
    };
    Ok(report)
}

fn load_group(dir: &Path) -> std::result::Result<(GroupMeta, Seal), (Quarantine, String)> {
    let seal = match Seal::read(dir) {
        Ok(Some(seal)) => seal,
        Ok(None) => return Err((Quarantine::NotRecovered, "missing seal".to_string())),
        Err(e) => return Err((Quarantine::NotRecovered, format!("bad seal: {e}"))),
    };
    let contents = read_group(dir).map_err(|e| (Quarantine::Unrecoverable, e.to_string()))?;
    if contents.data_len != seal.data_len || contents.data_crc != seal.data_crc {
        return Err((
            Quarantine::NotRecovered,
            "seal does not cover the data file".to_string(),
        ));
    }
    Ok((GroupMeta::from_contents(dir, &contents, Some(seal)), seal))
}

/// Quarantines invalid groups and reseals the partition over the valid chain.
///
/// `template` supplies the configured sizes written into the new summary.
///
/// # Errors
///
/// Returns [`DenError::ArchiveUnrecoverable`] if groups existed but none survived.
pub fn recover_partition(
    dir: &Path,
    report: ValidationReport,
    template: &Summary,
) -> Result<RecoveryReport> {
    let mut outcome = RecoveryReport::default();
    for group in &report.invalid {
        quarantine(&group.dir, dir, group.quarantine.dir_name())?;
        match group.quarantine {
            Quarantine::NotRecovered => outcome.not_recovered.push(group.id),
            Quarantine::Unrecoverable => outcome.unrecoverable.push(group.id),
        }
    }
    if report.valid.is_empty() && !report.invalid.is_empty() {
        warn!("No chunk-group in {:?} survived validation", dir);
        return Err(DenError::ArchiveUnrecoverable(dir.to_path_buf()));
    }

    let mut registration = Registration::new();
    for group in &report.valid {
        registration.merge(&group.registration);
        outcome.recovered.push(group.id);
    }
    let summary = Summary {
        ring_buffers: report.valid.len(),
        oldest_group: report.valid.first().map(|g| g.id),
        newest_group: report.valid.last().map(|g| g.id),
        ..template.clone()
    };
    let mut clock = SealClock::after(report.last_seal());
    write_partition_files(dir, &summary, &registration, None, &mut clock)?;

    info!(
        "Recovered {:?}: recovered {:?}, not recovered {:?}, unrecoverable {:?}",
        dir, outcome.recovered, outcome.not_recovered, outcome.unrecoverable
    );
    Ok(outcome)
}

/// Validates the partition in `dir`, recovering it as needed.
///
/// # Errors
///
/// Returns [`DenError::RecoveryExhausted`] if validation still fails after
/// [`MAX_RECOVERY_ATTEMPTS`] recovery passes, or the error of a failed pass.
pub fn load_partition(dir: &Path, template: &Summary) -> Result<LoadedArchive> {
    let mut attempts = 0;
    let mut recovery = None;
    loop {
        let report = validate_partition(dir)?;
        if !report.needs_recovery() {
            return Ok(LoadedArchive {
                clock: SealClock::after(report.last_seal()),
                sealed: report.partition_seal_valid,
                summary: report.summary,
                groups: report.valid,
                recovery,
            });
        }
        if attempts == MAX_RECOVERY_ATTEMPTS {
            return Err(DenError::RecoveryExhausted { attempts });
        }
        attempts += 1;
        recovery = Some(recover_partition(dir, report, template)?);
    }
}

/// Moves a single-partition layout (`FS<n>` directly under the root) into `RB1/`.
///
/// Returns true if anything moved.
pub fn migrate_legacy_layout(root: &Path) -> Result<bool> {
    let layout = ArchiveLayout::new(root);
    let groups = list_groups(root)?;
    if groups.is_empty() || !layout.list_partitions()?.is_empty() {
        return Ok(false);
    }

    let target = layout.partition_dir(1);
    fs::create_dir_all(&target)?;
    for (_, dir) in &groups {
        if let Some(name) = dir.file_name() {
            fs::rename(dir, target.join(name))?;
        }
    }
    for name in ROOT_FILES {
        let src = root.join(name);
        if src.exists() {
            fs::rename(&src, target.join(name))?;
        }
    }
    info!(
        "Migrated legacy archive layout at {:?} into {:?} ({} groups)",
        root,
        target,
        groups.len()
    );
    Ok(true)
}
