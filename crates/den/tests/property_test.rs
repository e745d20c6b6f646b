//! Property-based tests for ingestion.
//!
//! Uses proptest to check sequence numbering and cache bounds for arbitrary
//! frame streams, including streams that go backward in time.

use alopex_den::{ChannelSample, DenError, Frame, PartitionRouter, RouterConfig, TierLimits};
use proptest::prelude::*;

/// Strategy for frame times: mostly forward steps with occasional backward jumps.
fn time_steps_strategy() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-5.0f64..10.0, 1..200)
}

/// Strategy for cache geometry: (chunks, frames per chunk).
fn cache_geometry_strategy() -> impl Strategy<Value = (usize, usize)> {
    (1usize..8, 2usize..8)
}

proptest! {
    /// Accepted frames get consecutive indices; rejected frames never advance them.
    #[test]
    fn test_sequence_monotonicity_proptest(steps in time_steps_strategy()) {
        let router = PartitionRouter::open(
            RouterConfig::default().with_cache(TierLimits::frames(1000)),
        ).unwrap();

        let mut time = 0.0;
        let mut stored = 0u64;
        for step in steps {
            time += step;
            let frame = Frame::new(vec![ChannelSample::float64("ch", time, step)]);
            match router.accept_frame(frame) {
                Ok(index) => {
                    prop_assert_eq!(index, stored);
                    stored += 1;
                }
                Err(DenError::BackwardTime { .. }) => {}
                Err(err) => return Err(TestCaseError::fail(err.to_string())),
            }
        }
        prop_assert_eq!(router.stats().unwrap().next_index, stored);
    }

    /// A count-bounded cache never holds more than chunks x frames-per-chunk frames
    /// and always keeps the newest ones.
    #[test]
    fn test_cache_capacity_proptest(
        (chunks, per_chunk) in cache_geometry_strategy(),
        count in 1usize..300,
    ) {
        let capacity = chunks * per_chunk;
        let router = PartitionRouter::open(
            RouterConfig::default().with_cache(TierLimits::frames_in(capacity, chunks)),
        ).unwrap();

        for i in 0..count {
            router.accept_frame(Frame::new(vec![ChannelSample::float64("ch", i as f64, 0.0)])).unwrap();
            let stats = router.stats().unwrap();
            prop_assert!(stats.cache_frames <= capacity);
        }

        let (entries, _) = router.registration("ch").unwrap();
        let range = entries[0].1.range.unwrap();
        prop_assert_eq!(range.end, (count - 1) as f64);
        prop_assert_eq!(entries[0].1.frames as usize, router.stats().unwrap().cache_frames);
    }
}
