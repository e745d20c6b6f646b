//! Error and Result types for Den ring-buffer operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for Den operations.
pub type Result<T> = std::result::Result<T, DenError>;

/// The error type for ring-buffer storage operations.
#[derive(Debug, Error)]
pub enum DenError {
    /// Invalid magic bytes in an on-disk file header.
    #[error("Invalid magic bytes: expected {expected:?}, got {actual:?}")]
    InvalidMagic {
        /// Magic bytes the reader expected.
        expected: [u8; 4],
        /// Magic bytes found in the file.
        actual: [u8; 4],
    },

    /// Unsupported on-disk format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Checksum does not match expected value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// A persisted record is truncated or structurally invalid.
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Frame start time precedes the end of the previously accepted frame.
    #[error("Backward-going time: frame starts at {start} but previous frame ended at {previous_end}")]
    BackwardTime {
        /// End time of the previously accepted frame.
        previous_end: f64,
        /// Start time of the rejected frame.
        start: f64,
    },

    /// Frame carries no channel samples.
    #[error("Frame contains no channels")]
    EmptyFrame,

    /// Channel name or selector pattern cannot be parsed.
    #[error("Illegal channel pattern: {0}")]
    InvalidPattern(String),

    /// Frame names a channel owned by a different partition than its first channel.
    #[error("Channel {channel} is owned by partition {owner}")]
    ChannelConflict {
        /// Conflicting channel name.
        channel: String,
        /// Partition that owns the channel.
        owner: u32,
    },

    /// Router configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Seal timestamp lies outside the bounds required by its neighbours.
    #[error("Invalid seal: as-of {as_of} not within [{after}, {before}]")]
    InvalidSeal {
        /// Timestamp recorded in the seal.
        as_of: i64,
        /// Lower bound (inclusive).
        after: i64,
        /// Upper bound (inclusive).
        before: i64,
    },

    /// A summary file contains an unrecognized or malformed line.
    #[error("Malformed summary: {0}")]
    MalformedSummary(String),

    /// Recovery found no usable chunk-group in a partition archive.
    #[error("Archive at {0} is unrecoverable")]
    ArchiveUnrecoverable(PathBuf),

    /// Recovery was attempted the maximum number of times and validation still fails.
    #[error("Archive recovery exhausted after {attempts} attempts")]
    RecoveryExhausted {
        /// Number of recovery passes that ran.
        attempts: usize,
    },

    /// Partition failed earlier and no longer serves requests.
    #[error("Partition {0} is unavailable")]
    PartitionUnavailable(u32),

    /// Door was torn down while the caller was waiting on it.
    #[error("Door {door} terminated: router or partition gone")]
    Terminated {
        /// Name of the terminated door.
        door: String,
    },

    /// Calling thread already holds the door for writing.
    #[error("Door {door} re-entered at {location} while held for writing")]
    DoorReentry {
        /// Name of the door.
        door: String,
        /// Location tag of the second acquisition.
        location: &'static str,
    },

    /// Archive was opened in load mode and rejects writes.
    #[error("Router is read-only")]
    ReadOnly,

    /// Producer is detached; frames are not accepted until reconnect.
    #[error("Producer is detached")]
    Detached,
}

impl DenError {
    /// Returns true when the error means the target door has gone away.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}
