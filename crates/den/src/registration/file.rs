//! Registration header/data file pair.
//!
//! ```text
//! reghdr.den: magic "DENR" | version u16 | sections u8 | data_len u64 | data_crc u32
//! regdat.den: section* where section = tag u8 | count u32 | entry*
//! entry:      name str | flags u8 | [start f64 end f64] | frames u64 | [kind u8] | [info str]
//! ```
//!
//! The data file is written first and both files are replaced atomically via
//! a temporary file and rename, so a reader never sees a header describing
//! different data.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::{DenError, Result};
use crate::frame::TimeRange;
use crate::registration::{ChannelRegistration, Registration};
use crate::storage::codec::{Decoder, Encoder};
use crate::storage::layout::{REGISTRATION_DATA_FILE, REGISTRATION_HEADER_FILE};

const REG_MAGIC: [u8; 4] = *b"DENR";
const REG_VERSION: u16 = 1;
const HEADER_SIZE: usize = 19; // 4 + 2 + 1 + 8 + 4

const SECTION_DERIVED: u8 = 0;
const SECTION_EXPLICIT: u8 = 1;

const FLAG_RANGE: u8 = 0b001;
const FLAG_KIND: u8 = 0b010;
const FLAG_INFO: u8 = 0b100;

/// Registration loaded from disk.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoredRegistration {
    /// Registration derived from stored data.
    pub derived: Registration,
    /// User-supplied registration, if one was written.
    pub explicit: Option<Registration>,
}

/// Writes the registration pair into `dir`.
///
/// Returns the length and CRC32 of the data file, which seals use to cover it.
pub fn write_registration(
    dir: &Path,
    derived: &Registration,
    explicit: Option<&Registration>,
) -> Result<(u64, u32)> {
    let mut enc = Encoder::new();
    encode_section(&mut enc, SECTION_DERIVED, derived)?;
    if let Some(explicit) = explicit {
        encode_section(&mut enc, SECTION_EXPLICIT, explicit)?;
    }
    let data = enc.into_inner();
    let data_len = data.len() as u64;
    let data_crc = crc32fast::hash(&data);

    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.extend_from_slice(&REG_MAGIC);
    header.extend_from_slice(&REG_VERSION.to_le_bytes());
    header.push(if explicit.is_some() { 2 } else { 1 });
    header.extend_from_slice(&data_len.to_le_bytes());
    header.extend_from_slice(&data_crc.to_le_bytes());

    write_atomic(&dir.join(REGISTRATION_DATA_FILE), &data)?;
    write_atomic(&dir.join(REGISTRATION_HEADER_FILE), &header)?;
    Ok((data_len, data_crc))
}

/// Reads the registration pair from `dir`.
///
/// Returns `Ok(None)` if either file is missing.
///
/// # Errors
///
/// Returns an error if the header is malformed or the data does not match
/// the length and checksum recorded in the header.
pub fn read_registration(dir: &Path) -> Result<Option<StoredRegistration>> {
    let header = match fs::read(dir.join(REGISTRATION_HEADER_FILE)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let data = match fs::read(dir.join(REGISTRATION_DATA_FILE)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut dec = Decoder::new(&header);
    let magic = dec.array::<4>()?;
    if magic != REG_MAGIC {
        return Err(DenError::InvalidMagic {
            expected: REG_MAGIC,
            actual: magic,
        });
    }
    let version = dec.u16()?;
    if version != REG_VERSION {
        return Err(DenError::UnsupportedVersion(version));
    }
    let sections = dec.u8()?;
    let data_len = dec.u64()?;
    let data_crc = dec.u32()?;

    if data.len() as u64 != data_len {
        return Err(DenError::Corrupt(format!(
            "registration data length {} does not match header {}",
            data.len(),
            data_len
        )));
    }
    let actual = crc32fast::hash(&data);
    if actual != data_crc {
        return Err(DenError::ChecksumMismatch {
            expected: data_crc,
            actual,
        });
    }

    let mut stored = StoredRegistration::default();
    let mut dec = Decoder::new(&data);
    for _ in 0..sections {
        let tag = dec.u8()?;
        let registration = decode_entries(&mut dec)?;
        match tag {
            SECTION_DERIVED => stored.derived = registration,
            SECTION_EXPLICIT => stored.explicit = Some(registration),
            other => {
                return Err(DenError::Corrupt(format!(
                    "unknown registration section {other}"
                )))
            }
        }
    }
    Ok(Some(stored))
}

fn entry_count(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| DenError::Corrupt(format!("registration too large: {len} entries")))
}

fn encode_section(enc: &mut Encoder, tag: u8, registration: &Registration) -> Result<()> {
    enc.put_u8(tag);
    enc.put_u32(entry_count(registration.len())?);
    for (name, entry) in registration.iter() {
        enc.put_str(name)?;
        let mut flags = 0;
        if entry.range.is_some() {
            flags |= FLAG_RANGE;
        }
        if entry.kind.is_some() {
            flags |= FLAG_KIND;
        }
        if entry.info.is_some() {
            flags |= FLAG_INFO;
        }
        enc.put_u8(flags);
        if let Some(range) = entry.range {
            enc.put_f64(range.start);
            enc.put_f64(range.end);
        }
        enc.put_u64(entry.frames);
        if let Some(kind) = entry.kind {
            enc.put_u8(kind.as_u8());
        }
        if let Some(info) = &entry.info {
            enc.put_str(info)?;
        }
    }
    Ok(())
}

fn decode_entries(dec: &mut Decoder<'_>) -> Result<Registration> {
    let count = dec.u32()?;
    let mut registration = Registration::new();
    for _ in 0..count {
        let name = dec.string()?;
        let flags = dec.u8()?;
        let range = if flags & FLAG_RANGE != 0 {
            let start = dec.f64()?;
            let end = dec.f64()?;
            Some(TimeRange::from_bounds(start, end))
        } else {
            None
        };
        let frames = dec.u64()?;
        let kind = if flags & FLAG_KIND != 0 {
            Some(dec.kind()?)
        } else {
            None
        };
        let info = if flags & FLAG_INFO != 0 {
            Some(dec.string()?)
        } else {
            None
        };
        registration.insert(
            name,
            ChannelRegistration {
                range,
                frames,
                kind,
                info,
            },
        );
    }
    Ok(registration)
}

/// Writes `bytes` to `path` through a temporary file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}
