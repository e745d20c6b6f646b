//! Frames, channel samples and time ranges.
//!
//! A [`Frame`] is the unit of ingestion: one or more channel samples that
//! share a frame-sequence index once stored. Times are seconds as `f64`,
//! matching the producer-side summary times.

use std::sync::Arc;

/// Relative tolerance applied when comparing summary times for backward-going time.
pub const TIME_EPSILON: f64 = 1e-14;

/// Type tag carried with each channel payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PayloadKind {
    /// Opaque bytes.
    #[default]
    Bytes = 0,
    /// Little-endian `f64` values.
    Float64 = 1,
    /// Little-endian `i64` values.
    Int64 = 2,
    /// UTF-8 text.
    Text = 3,
}

impl PayloadKind {
    /// Decodes a type tag written by [`PayloadKind::as_u8`].
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Bytes),
            1 => Some(Self::Float64),
            2 => Some(Self::Int64),
            3 => Some(Self::Text),
            _ => None,
        }
    }

    /// Returns the on-disk tag.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A closed time interval `[start, end]` in seconds.
///
/// Stored as start/end so that unions are exact regardless of merge order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    /// Inclusive start time.
    pub start: f64,
    /// Inclusive end time.
    pub end: f64,
}

impl TimeRange {
    /// Creates a range from a start time and a non-negative duration.
    pub fn new(start: f64, duration: f64) -> Self {
        Self {
            start,
            end: start + duration.max(0.0),
        }
    }

    /// Creates a range from explicit bounds.
    pub fn from_bounds(start: f64, end: f64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Returns the duration, never negative.
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    /// Returns the smallest range covering both.
    pub fn union(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Returns true if the two closed ranges share at least one instant.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// One channel's contribution to a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSample {
    /// Hierarchical channel name, `/`-separated.
    pub name: String,
    /// Sample start time in seconds.
    pub time: f64,
    /// Sample duration in seconds.
    pub duration: f64,
    /// Payload type tag.
    pub kind: PayloadKind,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl ChannelSample {
    /// Creates a sample with zero duration.
    pub fn new(name: impl Into<String>, time: f64, kind: PayloadKind, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            time,
            duration: 0.0,
            kind,
            payload,
        }
    }

    /// Sets the sample duration.
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    /// Convenience constructor for a single `f64` value.
    pub fn float64(name: impl Into<String>, time: f64, value: f64) -> Self {
        Self::new(name, time, PayloadKind::Float64, value.to_le_bytes().to_vec())
    }

    /// Returns the time range covered by the sample.
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.time, self.duration)
    }
}

/// A decoded, immutable multi-channel record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    samples: Vec<ChannelSample>,
}

impl Frame {
    /// Creates a frame from its channel samples.
    pub fn new(samples: Vec<ChannelSample>) -> Self {
        Self { samples }
    }

    /// Appends a sample, builder style.
    pub fn with_sample(mut self, sample: ChannelSample) -> Self {
        self.samples.push(sample);
        self
    }

    /// Returns the channel samples in frame order.
    pub fn samples(&self) -> &[ChannelSample] {
        &self.samples
    }

    /// Returns true if the frame carries no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the channel names in frame order.
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.samples.iter().map(|s| s.name.as_str())
    }

    /// Returns the range spanning every sample, or `None` for an empty frame.
    pub fn time_range(&self) -> Option<TimeRange> {
        self.samples
            .iter()
            .map(ChannelSample::range)
            .reduce(|acc, r| acc.union(&r))
    }
}

/// A frame together with the sequence index it was stored under.
#[derive(Debug, Clone)]
pub struct StoredFrame {
    /// Frame-sequence index assigned by the router.
    pub index: u64,
    /// Shared frame contents.
    pub frame: Arc<Frame>,
}

impl StoredFrame {
    /// Wraps a frame with its index.
    pub fn new(index: u64, frame: Frame) -> Self {
        Self {
            index,
            frame: Arc::new(frame),
        }
    }
}

/// Returns true if a frame starting at `start` goes backward relative to `previous_end`.
///
/// The comparison allows a relative slack of [`TIME_EPSILON`] for times that
/// went through summary arithmetic.
pub fn is_backward(previous_end: f64, start: f64) -> bool {
    previous_end - previous_end.abs() * TIME_EPSILON > start
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_union_is_order_independent() {
        let a = TimeRange::new(1.0, 2.0);
        let b = TimeRange::new(5.0, 0.5);
        assert_eq!(a.union(&b), b.union(&a));
        assert_eq!(a.union(&b).start, 1.0);
        assert_eq!(a.union(&b).end, 5.5);
    }

    #[test]
    fn test_frame_time_range() {
        let frame = Frame::default()
            .with_sample(ChannelSample::float64("a", 3.0, 1.0).with_duration(1.0))
            .with_sample(ChannelSample::float64("b", 2.0, 1.0));
        let range = frame.time_range().unwrap();
        assert_eq!(range.start, 2.0);
        assert_eq!(range.end, 4.0);
        assert!(Frame::default().time_range().is_none());
    }

    #[test]
    fn test_backward_time_epsilon() {
        assert!(is_backward(5.0, 3.0));
        assert!(!is_backward(5.0, 5.0));
        assert!(!is_backward(1e6, 1e6 - 1e-9));
        assert!(!is_backward(0.0, 0.0));
    }

    #[test]
    fn test_payload_kind_tags() {
        for kind in [
            PayloadKind::Bytes,
            PayloadKind::Float64,
            PayloadKind::Int64,
            PayloadKind::Text,
        ] {
            assert_eq!(PayloadKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(PayloadKind::from_u8(9), None);
    }
}
