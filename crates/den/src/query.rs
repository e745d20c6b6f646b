//! Traversal requests and results.
//!
//! A [`Request`] pairs a channel pattern with a [`TimeSelector`]. The
//! partition resolves the selector per channel into a [`TraversalPlan`]
//! (relative selectors go through the registration), then visits its tiers
//! through the [`Queryable`] capability.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::frame::{ChannelSample, PayloadKind, TimeRange};
use crate::registration::Registration;

/// Which data of each matched channel a request wants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeSelector {
    /// Everything stored.
    All,
    /// Samples overlapping `[start, start + duration]`.
    Absolute {
        /// Start time in seconds.
        start: f64,
        /// Duration in seconds.
        duration: f64,
    },
    /// Frames with sequence index in `[start, start + count)`.
    Frames {
        /// First frame index.
        start: u64,
        /// Number of frame indices.
        count: u64,
    },
    /// The last `duration` seconds of each channel; zero means the newest sample.
    Newest {
        /// Duration in seconds.
        duration: f64,
    },
    /// The first `duration` seconds of each channel; zero means the oldest sample.
    Oldest {
        /// Duration in seconds.
        duration: f64,
    },
}

/// A traversal request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Channel name or wildcard pattern.
    pub pattern: String,
    /// Time or frame selector.
    pub selector: TimeSelector,
}

impl Request {
    /// Creates a request.
    pub fn new(pattern: impl Into<String>, selector: TimeSelector) -> Self {
        Self {
            pattern: pattern.into(),
            selector,
        }
    }

    /// Creates a request for everything stored under `pattern`.
    pub fn all(pattern: impl Into<String>) -> Self {
        Self::new(pattern, TimeSelector::All)
    }
}

/// Why a traversal did or did not produce a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    /// At least one channel matched the pattern.
    Matched,
    /// The pattern is well formed but names no known channel.
    UnmatchedUnknown,
    /// The pattern cannot be parsed.
    UnmatchedIllegal,
}

/// One sample returned by a traversal.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleHit {
    /// Sequence index of the frame the sample belongs to.
    pub index: u64,
    /// Sample start time.
    pub time: f64,
    /// Sample duration.
    pub duration: f64,
    /// Payload type tag.
    pub kind: PayloadKind,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl SampleHit {
    fn from_sample(index: u64, sample: &ChannelSample) -> Self {
        Self {
            index,
            time: sample.time,
            duration: sample.duration,
            kind: sample.kind,
            payload: sample.payload.clone(),
        }
    }
}

/// Samples collected per channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    channels: BTreeMap<String, Vec<SampleHit>>,
}

impl QueryResult {
    /// Creates an empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the samples of `name`, if the channel matched.
    pub fn channel(&self, name: &str) -> Option<&[SampleHit]> {
        self.channels.get(name).map(Vec::as_slice)
    }

    /// Iterates matched channels in name order.
    pub fn channels(&self) -> impl Iterator<Item = (&str, &[SampleHit])> {
        self.channels
            .iter()
            .map(|(name, hits)| (name.as_str(), hits.as_slice()))
    }

    /// Returns the number of matched channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true if no channel matched.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Returns the total number of samples across channels.
    pub fn sample_count(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }

    /// Records that `name` matched, even if it yields no samples.
    pub fn ensure_channel(&mut self, name: &str) {
        self.channels.entry(name.to_string()).or_default();
    }

    /// Adds one sample.
    pub fn push(&mut self, index: u64, sample: &ChannelSample) {
        self.channels
            .entry(sample.name.clone())
            .or_default()
            .push(SampleHit::from_sample(index, sample));
    }

    /// Merges another result into this one.
    pub fn extend(&mut self, other: QueryResult) {
        for (name, hits) in other.channels {
            self.channels.entry(name).or_default().extend(hits);
        }
    }

    /// Orders samples by frame index and applies newest/oldest single-sample selection.
    pub fn finish(&mut self, selector: &TimeSelector) {
        for hits in self.channels.values_mut() {
            hits.sort_by_key(|h| h.index);
            match *selector {
                TimeSelector::Newest { duration } if duration <= 0.0 => {
                    if let Some(last) = hits.pop() {
                        hits.clear();
                        hits.push(last);
                    }
                }
                TimeSelector::Oldest { duration } if duration <= 0.0 => hits.truncate(1),
                _ => {}
            }
        }
    }
}

/// The part of one channel a traversal admits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Window {
    /// Every sample.
    All,
    /// Samples overlapping a time range.
    Time(TimeRange),
    /// Samples of frames with index in `[start, end)`.
    Index {
        /// First admitted index.
        start: u64,
        /// First index past the window.
        end: u64,
    },
}

impl Window {
    /// Returns true if the sample of frame `index` falls in the window.
    pub fn admits(&self, index: u64, sample: &ChannelSample) -> bool {
        match self {
            Self::All => true,
            Self::Time(range) => range.overlaps(&sample.range()),
            Self::Index { start, end } => index >= *start && index < *end,
        }
    }

    fn may_overlap(&self, range: Option<TimeRange>, indices: Option<(u64, u64)>) -> bool {
        match self {
            Self::All => true,
            Self::Time(window) => range.map_or(false, |r| window.overlaps(&r)),
            Self::Index { start, end } => {
                indices.map_or(false, |(first, last)| first < *end && last >= *start)
            }
        }
    }
}

/// Per-channel windows resolved for one partition.
#[derive(Debug, Clone, Default)]
pub struct TraversalPlan {
    windows: BTreeMap<String, Window>,
}

impl TraversalPlan {
    /// Resolves `selector` for `channels`.
    ///
    /// Relative selectors are anchored on each channel's own extent in
    /// `registration`; channels with no stored data get no window.
    pub fn resolve<'a>(
        selector: &TimeSelector,
        channels: impl IntoIterator<Item = &'a str>,
        registration: &Registration,
    ) -> Self {
        let mut windows = BTreeMap::new();
        for name in channels {
            let extent = registration.get(name).and_then(|e| e.range);
            let window = match *selector {
                TimeSelector::All => Some(Window::All),
                TimeSelector::Absolute { start, duration } => {
                    Some(Window::Time(TimeRange::new(start, duration)))
                }
                TimeSelector::Frames { start, count } => Some(Window::Index {
                    start,
                    end: start.saturating_add(count),
                }),
                TimeSelector::Newest { duration } => extent.map(|r| {
                    Window::Time(TimeRange::from_bounds(r.end - duration.max(0.0), r.end))
                }),
                TimeSelector::Oldest { duration } => {
                    extent.map(|r| Window::Time(TimeRange::new(r.start, duration)))
                }
            };
            if let Some(window) = window {
                windows.insert(name.to_string(), window);
            }
        }
        Self { windows }
    }

    /// Returns the window for `name`.
    pub fn window(&self, name: &str) -> Option<&Window> {
        self.windows.get(name)
    }

    /// Returns true if no channel has a window.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Returns true if a unit with this registration and index span might contribute samples.
    pub fn may_touch(&self, registration: &Registration, indices: Option<(u64, u64)>) -> bool {
        self.windows.iter().any(|(name, window)| {
            registration
                .get(name)
                .map_or(false, |entry| window.may_overlap(entry.range, indices))
        })
    }

    /// Adds the admitted samples of one frame to `out`.
    pub fn collect_frame(&self, index: u64, samples: &[ChannelSample], out: &mut QueryResult) {
        for sample in samples {
            if let Some(window) = self.windows.get(&sample.name) {
                if window.admits(index, sample) {
                    out.push(index, sample);
                }
            }
        }
    }
}

/// Something that can answer a traversal.
pub trait Queryable {
    /// Adds every sample admitted by `plan` to `out`.
    fn collect(&self, plan: &TraversalPlan, out: &mut QueryResult) -> Result<()>;
}

/// Something that can describe its stored data.
pub trait Registerable {
    /// Computes the registration of everything held.
    fn registration(&self) -> Registration;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn registration() -> Registration {
        Registration::from_frames(&[
            Frame::default().with_sample(ChannelSample::float64("a", 10.0, 0.0)),
            Frame::default().with_sample(ChannelSample::float64("a", 20.0, 0.0)),
        ])
    }

    #[test]
    fn test_resolve_newest_anchors_on_channel_end() {
        let plan = TraversalPlan::resolve(
            &TimeSelector::Newest { duration: 5.0 },
            ["a", "unknown"],
            &registration(),
        );
        assert_eq!(
            plan.window("a"),
            Some(&Window::Time(TimeRange::from_bounds(15.0, 20.0)))
        );
        assert!(plan.window("unknown").is_none());
    }

    #[test]
    fn test_resolve_frames_window() {
        let plan = TraversalPlan::resolve(
            &TimeSelector::Frames { start: 3, count: 2 },
            ["a"],
            &registration(),
        );
        let sample = ChannelSample::float64("a", 0.0, 0.0);
        let window = plan.window("a").unwrap();
        assert!(!window.admits(2, &sample));
        assert!(window.admits(3, &sample));
        assert!(window.admits(4, &sample));
        assert!(!window.admits(5, &sample));
    }

    #[test]
    fn test_finish_keeps_newest_single_sample() {
        let mut result = QueryResult::new();
        for (i, t) in [(2u64, 2.0), (0, 0.0), (1, 1.0)] {
            result.push(i, &ChannelSample::float64("a", t, t));
        }
        result.finish(&TimeSelector::Newest { duration: 0.0 });
        let hits = result.channel("a").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].index, 2);
    }

    #[test]
    fn test_may_touch_skips_disjoint_units() {
        let plan = TraversalPlan::resolve(
            &TimeSelector::Absolute {
                start: 100.0,
                duration: 1.0,
            },
            ["a"],
            &registration(),
        );
        assert!(!plan.may_touch(&registration(), Some((0, 1))));
    }
}
