//! Registration index: per-channel time extent and metadata.
//!
//! Each partition keeps a cached [`Registration`] built from its tiers and a
//! pending change recorded as frames arrive. The router merges partition
//! registrations into an aggregate and overlays explicit (user-supplied)
//! metadata last.
//!
//! ```text
//! frame stored ──▶ pending Minor(delta) ──┐
//! chunk evicted ─▶ pending Major ─────────┼─▶ update_registration()
//! no cache yet ──▶ Major ─────────────────┘       │
//!                                                 ▼
//!              Unchanged | Minor(delta) merged | Major (full recompute)
//! ```

pub mod file;
pub mod pattern;

use std::collections::BTreeMap;

use crate::frame::{Frame, PayloadKind, TimeRange};

pub use pattern::NamePattern;

/// Registration data for one channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelRegistration {
    /// Time extent of the stored data, if any data is stored.
    pub range: Option<TimeRange>,
    /// Number of stored samples.
    pub frames: u64,
    /// Payload type of the most recent sample.
    pub kind: Option<PayloadKind>,
    /// User-supplied metadata.
    pub info: Option<String>,
}

impl ChannelRegistration {
    /// Creates an explicit entry carrying only user metadata.
    pub fn explicit(info: impl Into<String>) -> Self {
        Self {
            info: Some(info.into()),
            ..Self::default()
        }
    }

    /// Returns the start of the stored data.
    pub fn start(&self) -> Option<f64> {
        self.range.map(|r| r.start)
    }

    /// Returns the duration of the stored data.
    pub fn duration(&self) -> Option<f64> {
        self.range.map(|r| r.duration())
    }

    fn absorb(&mut self, other: &ChannelRegistration) {
        self.range = match (self.range, other.range) {
            (Some(a), Some(b)) => Some(a.union(&b)),
            (a, b) => a.or(b),
        };
        self.frames += other.frames;
        if other.kind.is_some() {
            self.kind = other.kind;
        }
        if other.info.is_some() {
            self.info.clone_from(&other.info);
        }
    }
}

/// Mapping from channel name to its registration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Registration {
    entries: BTreeMap<String, ChannelRegistration>,
}

impl Registration {
    /// Creates an empty registration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registration describing the given frames.
    pub fn from_frames<'a>(frames: impl IntoIterator<Item = &'a Frame>) -> Self {
        let mut registration = Self::new();
        for frame in frames {
            registration.record_frame(frame);
        }
        registration
    }

    /// Returns the number of channels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entry for `name`.
    pub fn get(&self, name: &str) -> Option<&ChannelRegistration> {
        self.entries.get(name)
    }

    /// Iterates entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChannelRegistration)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates channel names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Inserts or replaces an entry.
    pub fn insert(&mut self, name: impl Into<String>, entry: ChannelRegistration) {
        self.entries.insert(name.into(), entry);
    }

    /// Removes an entry.
    pub fn remove(&mut self, name: &str) -> Option<ChannelRegistration> {
        self.entries.remove(name)
    }

    /// Extends the registration with every sample of `frame`.
    pub fn record_frame(&mut self, frame: &Frame) {
        for sample in frame.samples() {
            let entry = self.entries.entry(sample.name.clone()).or_default();
            let range = sample.range();
            entry.range = Some(match entry.range {
                Some(existing) => existing.union(&range),
                None => range,
            });
            entry.frames += 1;
            entry.kind = Some(sample.kind);
        }
    }

    /// Merges another registration covering disjoint data into this one.
    pub fn merge(&mut self, other: &Registration) {
        for (name, entry) in &other.entries {
            self.entries.entry(name.clone()).or_default().absorb(entry);
        }
    }

    /// Returns this registration with `explicit` metadata applied on top.
    ///
    /// Explicit values replace derived ones; derived frame counts are kept.
    pub fn overlay(&self, explicit: &Registration) -> Registration {
        let mut merged = self.clone();
        for (name, user) in &explicit.entries {
            let entry = merged.entries.entry(name.clone()).or_default();
            if user.range.is_some() {
                entry.range = user.range;
            }
            if user.kind.is_some() {
                entry.kind = user.kind;
            }
            entry.info.clone_from(&user.info);
        }
        merged
    }

    /// Returns the entries selected by `pattern`.
    pub fn select(&self, pattern: &NamePattern) -> Vec<(String, ChannelRegistration)> {
        pattern
            .select(self.names())
            .into_iter()
            .filter_map(|name| {
                self.entries
                    .get(name)
                    .map(|entry| (name.to_string(), entry.clone()))
            })
            .collect()
    }

    /// Returns the range covering every channel.
    pub fn time_range(&self) -> Option<TimeRange> {
        self.entries
            .values()
            .filter_map(|e| e.range)
            .reduce(|a, b| a.union(&b))
    }
}

/// Outcome of bringing a partition's cached registration up to date.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationUpdate {
    /// Nothing changed since the last update.
    Unchanged,
    /// New frames extended existing data; carries only the new frames' registration.
    Minor(Registration),
    /// The registration was recomputed from the tiers.
    Major,
}

/// Pending change tracked between registration updates.
#[derive(Debug, Clone, Default)]
pub(crate) enum PendingChange {
    #[default]
    None,
    Minor(Registration),
    Major,
}

impl PendingChange {
    /// Records newly stored frames.
    pub(crate) fn record_frame(&mut self, frame: &Frame) {
        match self {
            Self::Major => {}
            Self::Minor(delta) => delta.record_frame(frame),
            Self::None => *self = Self::Minor(Registration::from_frames([frame])),
        }
    }

    /// Records a change that invalidates incremental merging.
    pub(crate) fn mark_major(&mut self) {
        *self = Self::Major;
    }
}
