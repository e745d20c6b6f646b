//! Chunk sizing computed once from user limits.
//!
//! Cache limits are a frame count `C` and an optional chunk count `N`
//! (default `ceil(sqrt(C))`). Archive limits are a frame count `A` and a
//! chunk-group count `G`; the archive reuses the cache chunk size `M` as its
//! unit.

use crate::error::{DenError, Result};

/// Cache tier geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSizing {
    /// Number of cache chunks. Zero means a single-frame "latest value" cache.
    pub chunks: usize,
    /// Frames per cache chunk.
    pub frames_per_chunk: usize,
}

impl CacheSizing {
    /// Computes cache geometry for `frames` with an optional desired chunk count.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::InvalidConfig`] if `frames` is zero or an explicit
    /// chunk count of zero is requested for more than one frame.
    pub fn compute(frames: usize, chunks: Option<usize>) -> Result<Self> {
        if frames == 0 {
            return Err(DenError::InvalidConfig(
                "cache must hold at least one frame".to_string(),
            ));
        }
        if frames == 1 {
            return Ok(Self {
                chunks: 0,
                frames_per_chunk: 1,
            });
        }

        let desired = chunks.unwrap_or_else(|| (frames as f64).sqrt().ceil() as usize);
        if desired == 0 {
            return Err(DenError::InvalidConfig(
                "cache chunk count must be positive".to_string(),
            ));
        }

        let sizing = if frames % desired == 0 {
            Self {
                chunks: desired,
                frames_per_chunk: frames / desired,
            }
        } else if frames < desired {
            Self {
                chunks: frames,
                frames_per_chunk: 1,
            }
        } else {
            Self {
                chunks: desired,
                frames_per_chunk: frames.div_ceil(desired),
            }
        };
        Ok(sizing)
    }

    /// Returns the number of chunks the tier retains, never zero.
    pub fn retained_chunks(&self) -> usize {
        self.chunks.max(1)
    }

    /// Returns the maximum number of frames retained.
    pub fn capacity_frames(&self) -> usize {
        self.retained_chunks() * self.frames_per_chunk
    }

    /// Returns true if the cache holds exactly one frame.
    pub fn is_single_frame(&self) -> bool {
        self.capacity_frames() == 1
    }
}

/// Archive tier geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSizing {
    /// Number of chunk-groups retained.
    pub groups: usize,
    /// Cache chunks per chunk-group.
    pub chunks_per_group: usize,
}

impl ArchiveSizing {
    /// Computes archive geometry; `Ok(None)` when `frames` is zero (no archive).
    ///
    /// # Errors
    ///
    /// Returns [`DenError::InvalidConfig`] if `groups` or `frames_per_chunk` is zero.
    pub fn compute(frames: usize, groups: usize, frames_per_chunk: usize) -> Result<Option<Self>> {
        if frames == 0 {
            return Ok(None);
        }
        if groups == 0 || frames_per_chunk == 0 {
            return Err(DenError::InvalidConfig(
                "archive group count and chunk size must be positive".to_string(),
            ));
        }
        let total_chunks = frames.div_ceil(frames_per_chunk);
        Ok(Some(Self {
            groups: groups.min(total_chunks),
            chunks_per_group: total_chunks.div_ceil(groups).max(1),
        }))
    }

    /// Returns the maximum number of cache chunks retained.
    pub fn capacity_chunks(&self) -> usize {
        self.groups.max(1) * self.chunks_per_group
    }
}
