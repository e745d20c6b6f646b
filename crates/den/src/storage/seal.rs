//! Seals: integrity markers written after a successful archive write.
//!
//! ```text
//! seal.den: magic "DENS" | version u16 | as_of i64 | data_len u64 | data_crc u32 | self_crc u32
//! ```
//!
//! `self_crc` covers every preceding byte. A chunk-group seal covers the
//! group's `frames.den`; a partition seal covers the partition's
//! `regdat.den`.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{DenError, Result};
use crate::registration::file::write_atomic;
use crate::storage::codec::Decoder;
use crate::storage::layout::{remove_file_if_exists, SEAL_FILE};

const SEAL_MAGIC: [u8; 4] = *b"DENS";
const SEAL_VERSION: u16 = 1;
const SEAL_SIZE: usize = 30; // 4 + 2 + 8 + 8 + 4 + 4

/// A timestamped integrity marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seal {
    /// Wall-clock time the seal was issued, nanoseconds since the epoch.
    pub as_of: i64,
    /// Length of the covered file.
    pub data_len: u64,
    /// CRC32 of the covered file.
    pub data_crc: u32,
}

impl Seal {
    /// Serializes the seal.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SEAL_SIZE);
        bytes.extend_from_slice(&SEAL_MAGIC);
        bytes.extend_from_slice(&SEAL_VERSION.to_le_bytes());
        bytes.extend_from_slice(&self.as_of.to_le_bytes());
        bytes.extend_from_slice(&self.data_len.to_le_bytes());
        bytes.extend_from_slice(&self.data_crc.to_le_bytes());
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Parses a seal, verifying its own checksum.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SEAL_SIZE {
            return Err(DenError::Corrupt(format!(
                "seal size mismatch: expected {}, got {}",
                SEAL_SIZE,
                bytes.len()
            )));
        }
        let body = &bytes[..SEAL_SIZE - 4];
        let mut dec = Decoder::new(bytes);
        let magic = dec.array::<4>()?;
        if magic != SEAL_MAGIC {
            return Err(DenError::InvalidMagic {
                expected: SEAL_MAGIC,
                actual: magic,
            });
        }
        let version = dec.u16()?;
        if version != SEAL_VERSION {
            return Err(DenError::UnsupportedVersion(version));
        }
        let as_of = dec.i64()?;
        let data_len = dec.u64()?;
        let data_crc = dec.u32()?;
        let expected = dec.u32()?;
        let actual = crc32fast::hash(body);
        if actual != expected {
            return Err(DenError::ChecksumMismatch { expected, actual });
        }
        Ok(Self {
            as_of,
            data_len,
            data_crc,
        })
    }

    /// Writes the seal into `dir`.
    pub fn write(&self, dir: &Path) -> Result<()> {
        write_atomic(&dir.join(SEAL_FILE), &self.to_bytes())
    }

    /// Reads the seal in `dir`. A missing seal is `Ok(None)`.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        match std::fs::read(dir.join(SEAL_FILE)) {
            Ok(bytes) => Self::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the seal in `dir`, marking the directory as being written.
    pub fn remove(dir: &Path) -> Result<()> {
        remove_file_if_exists(&dir.join(SEAL_FILE))
    }

    /// Checks that the seal time lies within `[after, before]`.
    pub fn validate(&self, after: i64, before: i64) -> Result<()> {
        if self.as_of < after || self.as_of > before {
            return Err(DenError::InvalidSeal {
                as_of: self.as_of,
                after,
                before,
            });
        }
        Ok(())
    }

    /// Checks that `path` has the length and checksum this seal recorded.
    pub fn verify_file(&self, path: &Path) -> Result<()> {
        let (len, crc) = file_checksum(path)?;
        if len != self.data_len {
            return Err(DenError::Corrupt(format!(
                "{:?} is {} bytes, seal covers {}",
                path, len, self.data_len
            )));
        }
        if crc != self.data_crc {
            return Err(DenError::ChecksumMismatch {
                expected: self.data_crc,
                actual: crc,
            });
        }
        Ok(())
    }
}

/// Computes the length and CRC32 of a file.
pub fn file_checksum(path: &Path) -> Result<(u64, u32)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 8192];
    let mut len = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        len += n as u64;
    }
    Ok((len, hasher.finalize()))
}

/// Issues strictly increasing seal timestamps.
#[derive(Debug, Clone, Default)]
pub struct SealClock {
    last: i64,
}

impl SealClock {
    /// Creates a clock that will issue times after `last`.
    pub fn after(last: i64) -> Self {
        Self { last }
    }

    /// Returns the next seal time: the wall clock, or one past the previous seal.
    pub fn next(&mut self) -> i64 {
        let now = current_timestamp_nanos();
        self.last = now.max(self.last.saturating_add(1));
        self.last
    }

    /// Returns the last issued time.
    pub fn last(&self) -> i64 {
        self.last
    }
}

/// Returns the wall clock in nanoseconds since the epoch, or 0 before it.
pub fn current_timestamp_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
