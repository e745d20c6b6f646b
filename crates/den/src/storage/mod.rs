//! On-disk storage for partition archives.
//!
//! ```text
//! <root>/
//! ├── summary.den  reghdr.den  regdat.den  seal.den
//! ├── RB1/
//! │   ├── summary.den  reghdr.den  regdat.den  seal.den
//! │   ├── FS1/  frames.den  seal.den
//! │   ├── FS2/  ...
//! │   ├── NOTRECOVERED/
//! │   └── UNRECOVERABLE/
//! └── RB2/ ...
//! ```

pub(crate) mod codec;
pub mod group_file;
pub mod layout;
pub mod recovery;
pub mod seal;
pub mod summary;

use std::path::Path;

use crate::error::Result;
use crate::registration::file::write_registration;
use crate::registration::Registration;
use crate::storage::seal::{Seal, SealClock};
use crate::storage::summary::Summary;

/// Writes the registration pair, summary and seal of a directory, in that order.
///
/// The seal covers `regdat.den` and is written last, so a crash at any
/// point leaves the directory unsealed.
pub fn write_partition_files(
    dir: &Path,
    summary: &Summary,
    derived: &Registration,
    explicit: Option<&Registration>,
    clock: &mut SealClock,
) -> Result<Seal> {
    Seal::remove(dir)?;
    let (data_len, data_crc) = write_registration(dir, derived, explicit)?;
    summary.clone().dated_now().write(dir)?;
    let seal = Seal {
        as_of: clock.next(),
        data_len,
        data_crc,
    };
    seal.write(dir)?;
    Ok(seal)
}
