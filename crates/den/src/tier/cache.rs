//! In-memory cache tier.
//!
//! The cache keeps one open chunk accepting frames and an ordered list of
//! closed chunks. After each append the capacity policy decides whether the
//! open chunk closes and how many of the oldest closed chunks leave the
//! cache. Leaving chunks are returned to the caller, which promotes them to
//! the archive or drops them.
//!
//! ```text
//!   closed (oldest → newest)          open
//! [ c0 ][ c1 ] ... [ cN-1 ]  ◀──  [ frames... ]  ◀── append
//!    │
//!    └──▶ released: promote (archive) | drop (no archive)
//! ```

use std::collections::VecDeque;

use crate::error::Result;
use crate::frame::{StoredFrame, TimeRange};
use crate::query::{QueryResult, Queryable, Registerable, TraversalPlan};
use crate::registration::Registration;
use crate::tier::capacity::CapacityPolicy;
use crate::tier::chunk::Chunk;

/// Counters for the cache tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Frames appended since creation.
    pub frames_accepted: u64,
    /// Chunks closed since creation.
    pub chunks_closed: u64,
    /// Chunks that left the cache through capacity pressure.
    pub chunks_released: u64,
}

/// Result of appending one frame.
#[derive(Debug, Default)]
pub struct AppendOutcome {
    /// The open chunk closed after this append.
    pub closed_chunk: bool,
    /// Oldest chunks pushed out of the cache, oldest first.
    pub released: Vec<Chunk>,
}

/// Bounded in-memory sequence of chunks.
#[derive(Debug)]
pub struct CacheTier {
    policy: Box<dyn CapacityPolicy>,
    closed: VecDeque<Chunk>,
    open: Chunk,
    next_chunk_id: u64,
    stats: CacheStats,
}

impl CacheTier {
    /// Creates an empty cache whose chunk ids start at `first_chunk_id`.
    pub fn new(policy: Box<dyn CapacityPolicy>, first_chunk_id: u64) -> Self {
        Self {
            policy,
            closed: VecDeque::new(),
            open: Chunk::new(first_chunk_id),
            next_chunk_id: first_chunk_id + 1,
            stats: CacheStats::default(),
        }
    }

    /// Replaces the capacity policy. Existing chunks stay until new frames push them out.
    pub fn set_policy(&mut self, policy: Box<dyn CapacityPolicy>) {
        self.policy = policy;
    }

    /// Appends a frame to the open chunk and applies the capacity policy.
    pub fn append(&mut self, stored: StoredFrame) -> AppendOutcome {
        self.open.push(stored);
        self.stats.frames_accepted += 1;

        let mut outcome = AppendOutcome::default();
        if self.policy.should_close(self.open.len(), self.open.span()) {
            self.close_open();
            outcome.closed_chunk = true;
        }

        let spans: Vec<f64> = self.closed.iter().map(Chunk::span).collect();
        let excess = self.policy.excess(&spans, !self.open.is_empty());
        for _ in 0..excess {
            if let Some(chunk) = self.closed.pop_front() {
                self.stats.chunks_released += 1;
                outcome.released.push(chunk);
            }
        }
        outcome
    }

    fn close_open(&mut self) {
        let fresh = Chunk::new(self.next_chunk_id);
        self.next_chunk_id += 1;
        let full = std::mem::replace(&mut self.open, fresh);
        self.closed.push_back(full);
        self.stats.chunks_closed += 1;
    }

    /// Closes the open chunk if it holds data and removes every chunk, oldest first.
    pub fn drain(&mut self) -> Vec<Chunk> {
        if !self.open.is_empty() {
            self.close_open();
        }
        self.closed.drain(..).collect()
    }

    /// Returns the number of chunks holding data.
    pub fn chunk_count(&self) -> usize {
        self.closed.len() + usize::from(!self.open.is_empty())
    }

    /// Returns the number of frames held.
    pub fn frame_count(&self) -> usize {
        self.closed.iter().map(Chunk::len).sum::<usize>() + self.open.len()
    }

    /// Returns true if the cache holds no frames.
    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    /// Iterates chunks holding data, oldest first.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.closed
            .iter()
            .chain(std::iter::once(&self.open).filter(|c| !c.is_empty()))
    }

    /// Returns the time range of the cached data.
    pub fn range(&self) -> Option<TimeRange> {
        self.chunks()
            .filter_map(Chunk::range)
            .reduce(|a, b| a.union(&b))
    }

    /// Returns the oldest cached frame index.
    pub fn first_index(&self) -> Option<u64> {
        self.chunks().find_map(|c| c.indices()).map(|(first, _)| first)
    }

    /// Returns the cache counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl Registerable for CacheTier {
    fn registration(&self) -> Registration {
        let mut registration = Registration::new();
        for chunk in self.chunks() {
            registration.merge(&chunk.registration());
        }
        registration
    }
}

impl Queryable for CacheTier {
    fn collect(&self, plan: &TraversalPlan, out: &mut QueryResult) -> Result<()> {
        for chunk in self.chunks() {
            chunk.collect(plan, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ChannelSample, Frame};
    use crate::tier::capacity::{CountCapacity, TimeCapacity};
    use proptest::prelude::*;
    use std::time::Duration;

    fn stored(index: u64, time: f64) -> StoredFrame {
        StoredFrame::new(
            index,
            Frame::default().with_sample(ChannelSample::float64("channel", time, time)),
        )
    }

    fn count_cache(units: usize, items: usize) -> CacheTier {
        CacheTier::new(
            Box::new(CountCapacity {
                units,
                items_per_unit: items,
            }),
            0,
        )
    }

    #[test]
    fn test_cache_evicts_oldest_chunk_after_overflow() {
        let mut cache = count_cache(10, 10);
        for i in 0..100u64 {
            let outcome = cache.append(stored(i, (i + 1) as f64));
            assert!(outcome.released.is_empty());
        }
        assert_eq!(cache.chunk_count(), 10);
        assert_eq!(cache.frame_count(), 100);

        let outcome = cache.append(stored(100, 101.0));
        assert_eq!(outcome.released.len(), 1);
        let evicted = &outcome.released[0];
        assert_eq!(evicted.id(), 0);
        assert_eq!(evicted.indices(), Some((0, 9)));

        let reg = cache.registration();
        assert_eq!(reg.get("channel").unwrap().start(), Some(11.0));
        assert_eq!(cache.first_index(), Some(10));
    }

    #[test]
    fn test_single_frame_cache_keeps_latest() {
        let mut cache = count_cache(0, 1);
        cache.append(stored(0, 1.0));
        let outcome = cache.append(stored(1, 2.0));
        assert_eq!(outcome.released.len(), 1);
        assert_eq!(cache.frame_count(), 1);
        assert_eq!(cache.first_index(), Some(1));
    }

    #[test]
    fn test_drain_includes_open_chunk() {
        let mut cache = count_cache(4, 3);
        for i in 0..7u64 {
            cache.append(stored(i, i as f64));
        }
        let drained = cache.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[2].len(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_time_bounded_cache() {
        let mut cache = CacheTier::new(
            Box::new(TimeCapacity::new(
                Duration::from_secs(10),
                Duration::from_secs(30),
            )),
            0,
        );
        let mut released = 0;
        for i in 0..100u64 {
            released += cache.append(stored(i, i as f64)).released.len();
        }
        assert!(released > 0);
        let range = cache.range().unwrap();
        assert!(range.duration() <= 45.0, "cache span {}", range.duration());
        assert_eq!(range.end, 99.0);
    }

    proptest! {
        #[test]
        fn prop_cache_never_exceeds_capacity(
            chunks in 1usize..12,
            per_chunk in 1usize..12,
            frames in 0u64..300,
        ) {
            let mut cache = count_cache(chunks, per_chunk);
            let mut last_released: Option<u64> = None;
            for i in 0..frames {
                let outcome = cache.append(stored(i, i as f64));
                for chunk in &outcome.released {
                    let (first, _) = chunk.indices().unwrap();
                    prop_assert!(last_released.map_or(true, |prev| first > prev));
                    last_released = Some(chunk.indices().unwrap().1);
                }
                prop_assert!(cache.frame_count() <= chunks * per_chunk);
            }
        }
    }
}
