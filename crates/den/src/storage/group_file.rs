//! Chunk-group data files.
//!
//! Each archived chunk-group directory holds one `frames.den`:
//!
//! ```text
//! header: magic "DENF" | version u16 | group_id u64 | created_at i64 | reserved [u8; 2]
//! record: len u32 | crc u32 | payload
//! payload: tag u8 = 1 (chunk start) | chunk_id u64
//!          tag u8 = 2 (frame)       | index u64 | samples u32 | sample*
//! ```
//!
//! Records are appended one promoted chunk at a time and flushed after each
//! chunk, so an open group is readable while it is being filled. The writer
//! hashes every byte it emits so the closing seal needs no second pass.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{DenError, Result};
use crate::frame::StoredFrame;
use crate::storage::codec::{Decoder, Encoder};
use crate::storage::layout::GROUP_DATA_FILE;
use crate::storage::seal::current_timestamp_nanos;

const GROUP_MAGIC: [u8; 4] = *b"DENF";
const GROUP_VERSION: u16 = 1;
const HEADER_SIZE: usize = 24; // 4 + 2 + 8 + 8 + 2

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    ChunkStart = 1,
    Frame = 2,
}

/// Appends promoted chunks to a group's data file.
pub struct GroupWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    hasher: crc32fast::Hasher,
    len: u64,
}

impl GroupWriter {
    /// Creates `dir` and a fresh data file inside it.
    pub fn create(dir: &Path, group_id: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(GROUP_DATA_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let mut writer = Self {
            path,
            writer: BufWriter::new(file),
            hasher: crc32fast::Hasher::new(),
            len: 0,
        };

        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(&GROUP_MAGIC);
        header.extend_from_slice(&GROUP_VERSION.to_le_bytes());
        header.extend_from_slice(&group_id.to_le_bytes());
        header.extend_from_slice(&current_timestamp_nanos().to_le_bytes());
        header.extend_from_slice(&[0u8; 2]);
        writer.put(&header)?;
        writer.writer.flush()?;
        Ok(writer)
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.hasher.update(bytes);
        self.len += bytes.len() as u64;
        Ok(())
    }

    fn put_record(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| DenError::Corrupt(format!("record too large: {} bytes", payload.len())))?;
        let crc = crc32fast::hash(payload);
        self.put(&len.to_le_bytes())?;
        self.put(&crc.to_le_bytes())?;
        self.put(payload)
    }

    /// Appends one closed chunk and flushes it.
    pub fn append_chunk(&mut self, chunk_id: u64, frames: &[StoredFrame]) -> Result<()> {
        let mut enc = Encoder::new();
        enc.put_u8(RecordType::ChunkStart as u8);
        enc.put_u64(chunk_id);
        self.put_record(&enc.into_inner())?;

        for stored in frames {
            let mut enc = Encoder::new();
            enc.put_u8(RecordType::Frame as u8);
            enc.put_frame(stored)?;
            self.put_record(&enc.into_inner())?;
        }
        self.writer.flush()?;
        debug!(
            "Appended chunk {} ({} frames) to {:?}",
            chunk_id,
            frames.len(),
            self.path
        );
        Ok(())
    }

    /// Syncs the file and returns its length and CRC32.
    pub fn finish(mut self) -> Result<(u64, u32)> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok((self.len, self.hasher.finalize()))
    }

    /// Returns the data file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for GroupWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupWriter")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

/// One chunk read back from a group file.
#[derive(Debug, Clone)]
pub struct GroupChunk {
    /// Cache chunk id the frames were promoted from.
    pub id: u64,
    /// Frames in index order.
    pub frames: Vec<StoredFrame>,
}

/// Fully decoded contents of a group file.
#[derive(Debug, Clone)]
pub struct GroupContents {
    /// Group id recorded in the header.
    pub group_id: u64,
    /// Creation time recorded in the header.
    pub created_at: i64,
    /// Chunks in promotion order.
    pub chunks: Vec<GroupChunk>,
    /// Length of the file.
    pub data_len: u64,
    /// CRC32 of the file.
    pub data_crc: u32,
}

impl GroupContents {
    /// Iterates every frame in the group.
    pub fn frames(&self) -> impl Iterator<Item = &StoredFrame> {
        self.chunks.iter().flat_map(|c| c.frames.iter())
    }
}

/// Reads and verifies the data file in a group directory.
///
/// # Errors
///
/// Returns an error if the header is invalid, a record is truncated, or a
/// record checksum does not match.
pub fn read_group(dir: &Path) -> Result<GroupContents> {
    let bytes = fs::read(dir.join(GROUP_DATA_FILE))?;
    let data_crc = crc32fast::hash(&bytes);
    let mut dec = Decoder::new(&bytes);

    let magic = dec.array::<4>()?;
    if magic != GROUP_MAGIC {
        return Err(DenError::InvalidMagic {
            expected: GROUP_MAGIC,
            actual: magic,
        });
    }
    let version = dec.u16()?;
    if version != GROUP_VERSION {
        return Err(DenError::UnsupportedVersion(version));
    }
    let group_id = dec.u64()?;
    let created_at = dec.i64()?;
    let _reserved = dec.array::<2>()?;

    let mut chunks: Vec<GroupChunk> = Vec::new();
    while !dec.is_empty() {
        let offset = dec.position();
        let len = dec.u32()? as usize;
        let expected = dec.u32()?;
        let payload = dec.take_vec(len)?;
        let actual = crc32fast::hash(&payload);
        if actual != expected {
            return Err(DenError::ChecksumMismatch { expected, actual });
        }

        let mut record = Decoder::new(&payload);
        match record.u8()? {
            t if t == RecordType::ChunkStart as u8 => chunks.push(GroupChunk {
                id: record.u64()?,
                frames: Vec::new(),
            }),
            t if t == RecordType::Frame as u8 => {
                let frame = record.frame()?;
                let chunk = chunks.last_mut().ok_or_else(|| {
                    DenError::Corrupt(format!("frame record before chunk start at {offset}"))
                })?;
                chunk.frames.push(frame);
            }
            other => {
                return Err(DenError::Corrupt(format!(
                    "unknown record type {other} at offset {offset}"
                )))
            }
        }
    }

    Ok(GroupContents {
        group_id,
        created_at,
        chunks,
        data_len: bytes.len() as u64,
        data_crc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ChannelSample, Frame};
    use tempfile::TempDir;

    fn frames(range: std::ops::Range<u64>) -> Vec<StoredFrame> {
        range
            .map(|i| {
                StoredFrame::new(
                    i,
                    Frame::default().with_sample(ChannelSample::float64("c", i as f64, i as f64)),
                )
            })
            .collect()
    }

    #[test]
    fn test_group_file_write_read() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("FS1");

        let mut writer = GroupWriter::create(&dir, 1).unwrap();
        writer.append_chunk(0, &frames(0..3)).unwrap();

        // Readable while still open.
        let open = read_group(&dir).unwrap();
        assert_eq!(open.chunks.len(), 1);

        writer.append_chunk(1, &frames(3..5)).unwrap();
        let (len, crc) = writer.finish().unwrap();

        let contents = read_group(&dir).unwrap();
        assert_eq!(contents.group_id, 1);
        assert_eq!(contents.chunks.len(), 2);
        assert_eq!(contents.chunks[1].id, 1);
        let indices: Vec<u64> = contents.frames().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(contents.data_len, len);
        assert_eq!(contents.data_crc, crc);
    }

    #[test]
    fn test_group_file_corruption_detected() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("FS1");
        let mut writer = GroupWriter::create(&dir, 1).unwrap();
        writer.append_chunk(0, &frames(0..2)).unwrap();
        writer.finish().unwrap();

        let path = dir.join(GROUP_DATA_FILE);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read_group(&dir),
            Err(DenError::ChecksumMismatch { .. })
        ));

        bytes.truncate(bytes.len() - 3);
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(read_group(&dir), Err(DenError::Corrupt(_))));
    }

    #[test]
    fn test_group_file_bad_magic() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(GROUP_DATA_FILE), [0u8; HEADER_SIZE]).unwrap();
        assert!(matches!(
            read_group(temp_dir.path()),
            Err(DenError::InvalidMagic { .. })
        ));
    }
}
