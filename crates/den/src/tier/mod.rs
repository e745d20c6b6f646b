//! Cache and archive tiers.
//!
//! A partition owns one [`cache::CacheTier`] and at most one
//! [`archive::ArchiveTier`]. Both are bounded by a [`capacity::CapacityPolicy`]
//! built from the [`TierPlan`] computed once from the configured limits.

pub mod archive;
pub mod cache;
pub mod capacity;
pub mod chunk;
pub mod sizing;

use std::time::Duration;

use crate::config::TierLimits;
use crate::error::{DenError, Result};
use crate::storage::summary::Summary;
use crate::tier::capacity::{CapacityPolicy, CountCapacity, TimeCapacity};
use crate::tier::sizing::{ArchiveSizing, CacheSizing};

/// Default chunk-group count of a count-bounded archive.
pub const DEFAULT_ARCHIVE_GROUPS: usize = 10;

/// Resolved cache bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CachePlan {
    /// Count-bounded chunks.
    Count(CacheSizing),
    /// Time-bounded chunks.
    Time(TimeCapacity),
}

/// Resolved archive bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArchivePlan {
    /// Count-bounded chunk-groups.
    Count(ArchiveSizing),
    /// Time-bounded chunk-groups.
    Time(TimeCapacity),
}

/// Tier geometry shared by every partition of a router.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierPlan {
    /// Cache bound.
    pub cache: CachePlan,
    /// Archive bound; `None` keeps data in memory only.
    pub archive: Option<ArchivePlan>,
}

impl TierPlan {
    /// Computes the plan from configured limits.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::InvalidConfig`] for zero sizes, non-positive time
    /// spans, a count-bounded archive behind a time-bounded cache, or
    /// time-bounded limits on a synchronized router.
    pub fn new(cache: &TierLimits, archive: Option<&TierLimits>, synchronized: bool) -> Result<Self> {
        let cache = match *cache {
            TierLimits::Frames { frames, chunks } => {
                CachePlan::Count(CacheSizing::compute(frames, chunks)?)
            }
            TierLimits::Time { flush, trim } => {
                reject_time_if_synchronized(synchronized)?;
                CachePlan::Time(time_capacity(flush, trim)?)
            }
        };

        let archive = match archive {
            None => None,
            Some(&TierLimits::Frames { frames, chunks }) => {
                let CachePlan::Count(sizing) = cache else {
                    return Err(DenError::InvalidConfig(
                        "a count-bounded archive needs a count-bounded cache".to_string(),
                    ));
                };
                ArchiveSizing::compute(
                    frames,
                    chunks.unwrap_or(DEFAULT_ARCHIVE_GROUPS),
                    sizing.frames_per_chunk,
                )?
                .map(ArchivePlan::Count)
            }
            Some(&TierLimits::Time { flush, trim }) => {
                reject_time_if_synchronized(synchronized)?;
                Some(ArchivePlan::Time(time_capacity(flush, trim)?))
            }
        };
        Ok(Self { cache, archive })
    }

    /// Returns true if the cache holds exactly one frame and nothing is archived.
    pub fn is_latest_value(&self) -> bool {
        matches!(self.cache, CachePlan::Count(sizing) if sizing.is_single_frame())
            && self.archive.is_none()
    }

    /// Builds the cache capacity policy.
    pub fn cache_policy(&self) -> Box<dyn CapacityPolicy> {
        match self.cache {
            CachePlan::Count(sizing) => Box::new(CountCapacity {
                units: sizing.chunks,
                items_per_unit: sizing.frames_per_chunk,
            }),
            CachePlan::Time(policy) => Box::new(policy),
        }
    }

    /// Builds the archive capacity policy, if there is an archive.
    pub fn archive_policy(&self) -> Option<Box<dyn CapacityPolicy>> {
        self.archive.map(|plan| -> Box<dyn CapacityPolicy> {
            match plan {
                ArchivePlan::Count(sizing) => Box::new(CountCapacity {
                    units: sizing.groups,
                    items_per_unit: sizing.chunks_per_group,
                }),
                ArchivePlan::Time(policy) => Box::new(policy),
            }
        })
    }

    /// Returns a summary carrying the configured sizes.
    pub fn summary_template(&self, username: Option<&str>) -> Summary {
        let (cache_sets, cache_elements) = match self.cache {
            CachePlan::Count(sizing) => (sizing.chunks, sizing.frames_per_chunk),
            CachePlan::Time(_) => (0, 0),
        };
        let (archive_sets, archive_elements) = match self.archive {
            Some(ArchivePlan::Count(sizing)) => (sizing.groups, sizing.chunks_per_group),
            _ => (0, 0),
        };
        Summary {
            username: username.map(str::to_string),
            cache_sets,
            cache_elements,
            archive_sets,
            archive_elements,
            ..Summary::default()
        }
    }
}

fn reject_time_if_synchronized(synchronized: bool) -> Result<()> {
    if synchronized {
        return Err(DenError::InvalidConfig(
            "time-bounded limits are disabled for synchronized routers".to_string(),
        ));
    }
    Ok(())
}

fn time_capacity(flush: Duration, trim: Duration) -> Result<TimeCapacity> {
    if flush.is_zero() || trim < flush {
        return Err(DenError::InvalidConfig(format!(
            "time limits need 0 < flush ({flush:?}) <= trim ({trim:?})"
        )));
    }
    Ok(TimeCapacity::new(flush, trim))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_plan() {
        let plan = TierPlan::new(
            &TierLimits::Frames {
                frames: 100,
                chunks: Some(10),
            },
            Some(&TierLimits::Frames {
                frames: 1000,
                chunks: None,
            }),
            false,
        )
        .unwrap();
        assert_eq!(
            plan.archive,
            Some(ArchivePlan::Count(ArchiveSizing {
                groups: 10,
                chunks_per_group: 10,
            }))
        );
        assert!(!plan.is_latest_value());
        let summary = plan.summary_template(Some("ops"));
        assert_eq!(summary.cache_sets, 10);
        assert_eq!(summary.archive_elements, 10);
        assert_eq!(summary.username.as_deref(), Some("ops"));
    }

    #[test]
    fn test_zero_archive_frames_disables_archive() {
        let plan = TierPlan::new(
            &TierLimits::Frames {
                frames: 1,
                chunks: None,
            },
            Some(&TierLimits::Frames {
                frames: 0,
                chunks: None,
            }),
            false,
        )
        .unwrap();
        assert!(plan.archive.is_none());
        assert!(plan.is_latest_value());
        assert!(plan.archive_policy().is_none());
    }

    #[test]
    fn test_time_limits_rejected_when_synchronized() {
        let time = TierLimits::Time {
            flush: Duration::from_secs(1),
            trim: Duration::from_secs(10),
        };
        assert!(TierPlan::new(&time, None, false).is_ok());
        assert!(matches!(
            TierPlan::new(&time, None, true),
            Err(DenError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_count_archive_needs_count_cache() {
        let time = TierLimits::Time {
            flush: Duration::from_secs(1),
            trim: Duration::from_secs(10),
        };
        let result = TierPlan::new(
            &time,
            Some(&TierLimits::Frames {
                frames: 10,
                chunks: None,
            }),
            false,
        );
        assert!(result.is_err());
    }
}
