//! Cache chunks.

use crate::error::Result;
use crate::frame::{StoredFrame, TimeRange};
use crate::query::{QueryResult, Queryable, Registerable, TraversalPlan};
use crate::registration::Registration;

/// An ordered group of frames with its own registration.
#[derive(Debug, Clone)]
pub struct Chunk {
    id: u64,
    frames: Vec<StoredFrame>,
    registration: Registration,
    range: Option<TimeRange>,
}

impl Chunk {
    /// Creates an empty chunk.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            frames: Vec::new(),
            registration: Registration::new(),
            range: None,
        }
    }

    /// Returns the chunk id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Appends a frame.
    pub fn push(&mut self, stored: StoredFrame) {
        if let Some(range) = stored.frame.time_range() {
            self.range = Some(match self.range {
                Some(existing) => existing.union(&range),
                None => range,
            });
        }
        self.registration.record_frame(&stored.frame);
        self.frames.push(stored);
    }

    /// Returns the number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if the chunk holds no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Returns the frames in index order.
    pub fn frames(&self) -> &[StoredFrame] {
        &self.frames
    }

    /// Returns the time range of the chunk's data.
    pub fn range(&self) -> Option<TimeRange> {
        self.range
    }

    /// Returns the data-time span in seconds.
    pub fn span(&self) -> f64 {
        self.range.map_or(0.0, |r| r.duration())
    }

    /// Returns the first and last frame index.
    pub fn indices(&self) -> Option<(u64, u64)> {
        Some((self.frames.first()?.index, self.frames.last()?.index))
    }
}

impl Registerable for Chunk {
    fn registration(&self) -> Registration {
        self.registration.clone()
    }
}

impl Queryable for Chunk {
    fn collect(&self, plan: &TraversalPlan, out: &mut QueryResult) -> Result<()> {
        if !plan.may_touch(&self.registration, self.indices()) {
            return Ok(());
        }
        for stored in &self.frames {
            plan.collect_frame(stored.index, stored.frame.samples(), out);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ChannelSample, Frame};
    use crate::query::TimeSelector;

    #[test]
    fn test_chunk_tracks_range_and_indices() {
        let mut chunk = Chunk::new(7);
        assert!(chunk.indices().is_none());
        for i in 0..3u64 {
            chunk.push(StoredFrame::new(
                i + 10,
                Frame::default().with_sample(ChannelSample::float64("c", i as f64 * 2.0, 0.0)),
            ));
        }
        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.indices(), Some((10, 12)));
        assert_eq!(chunk.span(), 4.0);
        assert_eq!(chunk.registration().get("c").unwrap().frames, 3);

        let plan = TraversalPlan::resolve(
            &TimeSelector::Absolute {
                start: 1.0,
                duration: 2.0,
            },
            ["c"],
            &chunk.registration(),
        );
        let mut out = QueryResult::new();
        chunk.collect(&plan, &mut out).unwrap();
        assert_eq!(out.channel("c").unwrap().len(), 1);
        assert_eq!(out.channel("c").unwrap()[0].index, 11);
    }
}
