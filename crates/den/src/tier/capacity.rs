//! Capacity policies deciding when a tier closes its open unit and how many
//! of its oldest closed units must go.
//!
//! A unit is a cache chunk (items are frames) or an archive chunk-group
//! (items are cache chunks).

use std::fmt;
use std::time::Duration;

/// Capacity policy for a tier.
pub trait CapacityPolicy: Send + Sync + fmt::Debug {
    /// Returns true if an open unit holding `items` items spanning `span` seconds is full.
    fn should_close(&self, items: usize, span: f64) -> bool;

    /// Returns how many of the oldest closed units exceed capacity.
    ///
    /// `closed_spans` lists closed unit spans oldest first; `open_nonempty`
    /// tells whether the open unit already holds data.
    fn excess(&self, closed_spans: &[f64], open_nonempty: bool) -> usize;
}

/// Count-bounded capacity: `units` units of `items_per_unit` items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountCapacity {
    /// Units retained, including a non-empty open unit. Zero behaves as one.
    pub units: usize,
    /// Items per unit.
    pub items_per_unit: usize,
}

impl CapacityPolicy for CountCapacity {
    fn should_close(&self, items: usize, _span: f64) -> bool {
        items >= self.items_per_unit.max(1)
    }

    fn excess(&self, closed_spans: &[f64], open_nonempty: bool) -> usize {
        let retained = closed_spans.len() + usize::from(open_nonempty);
        retained
            .saturating_sub(self.units.max(1))
            .min(closed_spans.len())
    }
}

/// Time-bounded capacity: close every `flush` of data time, keep `trim` of history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeCapacity {
    /// Data-time span after which the open unit closes, in seconds.
    pub flush: f64,
    /// Data-time span of closed units to keep, in seconds.
    pub trim: f64,
    /// Closes on item count instead of span when set.
    pub items_per_unit: Option<usize>,
}

impl TimeCapacity {
    /// Creates a time policy from durations.
    pub fn new(flush: Duration, trim: Duration) -> Self {
        Self {
            flush: flush.as_secs_f64(),
            trim: trim.as_secs_f64(),
            items_per_unit: None,
        }
    }

    /// Closes units by item count.
    pub fn with_items_per_unit(mut self, items: usize) -> Self {
        self.items_per_unit = Some(items.max(1));
        self
    }
}

impl CapacityPolicy for TimeCapacity {
    fn should_close(&self, items: usize, span: f64) -> bool {
        match self.items_per_unit {
            Some(limit) => items >= limit,
            None => items > 0 && span >= self.flush,
        }
    }

    fn excess(&self, closed_spans: &[f64], _open_nonempty: bool) -> usize {
        let mut total = 0.0;
        for (i, span) in closed_spans.iter().enumerate().rev() {
            total += if *span > 0.0 { *span } else { self.flush };
            if total > self.trim {
                return i;
            }
        }
        0
    }
}
