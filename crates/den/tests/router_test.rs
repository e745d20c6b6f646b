//! Integration tests for the partition router.

use alopex_den::{
    ArchiveMode, ChannelSample, DeleteOutcome, DenError, Frame, MatchReason, PartitionRouter,
    Request, RouterConfig, TierLimits, TimeSelector,
};
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Builds a frame with one float sample per channel at `time`.
fn frame(channels: &[&str], time: f64) -> Frame {
    Frame::new(
        channels
            .iter()
            .map(|c| ChannelSample::float64(*c, time, time * 10.0))
            .collect(),
    )
}

fn memory_router(cache: TierLimits) -> PartitionRouter {
    PartitionRouter::open(RouterConfig::default().with_cache(cache)).unwrap()
}

fn archived_config(root: &std::path::Path, mode: ArchiveMode) -> RouterConfig {
    RouterConfig::default()
        .with_archive_root(root, mode)
        .with_cache(TierLimits::frames_in(10, 2))
        .with_archive(TierLimits::frames_in(100, 20))
}

// ============================================================================
// Ingestion
// ============================================================================

/// 150 frames into 10 chunks of 10 frames without an archive: the first
/// chunk is gone once frame 101 arrives.
#[test]
fn test_cache_eviction_moves_registration_start() {
    let router = memory_router(TierLimits::frames_in(100, 10));

    for i in 0..101 {
        router.accept_frame(frame(&["channel"], (i + 1) as f64)).unwrap();
    }
    let (entries, reason) = router.registration("channel").unwrap();
    assert_eq!(reason, MatchReason::Matched);
    assert_eq!(entries[0].1.start(), Some(11.0));

    for i in 101..150 {
        router.accept_frame(frame(&["channel"], (i + 1) as f64)).unwrap();
    }
    let stats = router.stats().unwrap();
    assert!(stats.cache_frames <= 100);
    assert_eq!(stats.chunks_dropped, 5);
    assert_eq!(stats.next_index, 150);
}

#[test]
fn test_backward_time_rejected_without_advancing_index() {
    let router = memory_router(TierLimits::frames(100));

    assert_eq!(router.accept_frame(frame(&["a"], 5.0)).unwrap(), 0);
    let err = router.accept_frame(frame(&["a"], 3.0)).unwrap_err();
    assert!(matches!(err, DenError::BackwardTime { .. }));
    assert_eq!(router.stats().unwrap().next_index, 1);
    assert_eq!(router.accept_frame(frame(&["a"], 6.0)).unwrap(), 1);
}

#[test]
fn test_latest_value_cache_tolerates_backward_time() {
    let router = memory_router(TierLimits::frames(1));
    router.accept_frame(frame(&["a"], 5.0)).unwrap();
    router.accept_frame(frame(&["a"], 3.0)).unwrap();

    let (result, _) = router.traverse(&Request::all("a")).unwrap();
    let hits = result.channel("a").unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].time, 3.0);
}

#[test]
fn test_latest_value_mode_can_be_disabled() {
    let router = PartitionRouter::open(
        RouterConfig::default()
            .with_cache(TierLimits::frames(1))
            .with_latest_value_mode(false),
    )
    .unwrap();
    router.accept_frame(frame(&["a"], 5.0)).unwrap();
    assert!(matches!(
        router.accept_frame(frame(&["a"], 3.0)),
        Err(DenError::BackwardTime { .. })
    ));
}

#[test]
fn test_load_mode_without_archive_fails() {
    let temp_dir = TempDir::new().unwrap();
    let result = PartitionRouter::open(archived_config(
        &temp_dir.path().join("missing"),
        ArchiveMode::Load,
    ));
    assert!(matches!(result, Err(DenError::Io(_))));
}

// ============================================================================
// Traversal
// ============================================================================

#[test]
fn test_traverse_selectors() {
    let router = memory_router(TierLimits::frames(100));
    for i in 0..20 {
        router
            .accept_frame(frame(&["plant/boiler/temp", "plant/boiler/flow"], i as f64))
            .unwrap();
    }
    router.accept_frame(frame(&["plant/pump/rpm"], 0.0)).unwrap();

    let (result, reason) = router
        .traverse(&Request::new(
            "plant/boiler/*",
            TimeSelector::Absolute {
                start: 5.0,
                duration: 2.0,
            },
        ))
        .unwrap();
    assert_eq!(reason, MatchReason::Matched);
    assert_eq!(result.len(), 2);
    assert_eq!(result.channel("plant/boiler/temp").unwrap().len(), 3);

    let (result, _) = router
        .traverse(&Request::new(
            "plant/boiler/temp",
            TimeSelector::Frames { start: 10, count: 4 },
        ))
        .unwrap();
    let indices: Vec<u64> = result
        .channel("plant/boiler/temp")
        .unwrap()
        .iter()
        .map(|h| h.index)
        .collect();
    assert_eq!(indices, vec![10, 11, 12, 13]);

    let (result, _) = router
        .traverse(&Request::new("plant/...", TimeSelector::Newest { duration: 0.0 }))
        .unwrap();
    assert_eq!(result.len(), 3);
    assert_eq!(result.channel("plant/boiler/flow").unwrap()[0].time, 19.0);
    assert_eq!(result.channel("plant/pump/rpm").unwrap()[0].time, 0.0);

    let (result, reason) = router.traverse(&Request::all("plant/boiler")).unwrap();
    assert_eq!(reason, MatchReason::Matched);
    assert_eq!(result.len(), 2);

    let (result, reason) = router.traverse(&Request::all("nowhere/*")).unwrap();
    assert!(result.is_empty());
    assert_eq!(reason, MatchReason::UnmatchedUnknown);

    let (_, reason) = router.traverse(&Request::all("plant/../..")).unwrap();
    assert_eq!(reason, MatchReason::UnmatchedIllegal);
}

/// A folder name resolves to the same channels for traversal and
/// registration when its channels live in different partitions.
#[test]
fn test_traverse_and_registration_agree_across_partitions() {
    let router = memory_router(TierLimits::frames(100));
    router.accept_frame(frame(&["a/b"], 1.0)).unwrap();
    router.accept_frame(frame(&["a/b/c"], 1.0)).unwrap();
    assert_eq!(router.owner_of("a/b").unwrap(), Some(1));
    assert_eq!(router.owner_of("a/b/c").unwrap(), Some(2));

    for pattern in ["a/b", "a", "a/b/c", "a/..."] {
        let (entries, _) = router.registration(pattern).unwrap();
        let mut registered: Vec<String> = entries.into_iter().map(|(name, _)| name).collect();
        registered.sort();
        let (result, _) = router.traverse(&Request::all(pattern)).unwrap();
        let mut traversed: Vec<String> = result.channels().map(|(name, _)| name.to_string()).collect();
        traversed.sort();
        assert_eq!(traversed, registered, "pattern {pattern}");
    }

    let (result, _) = router.traverse(&Request::all("a/b")).unwrap();
    assert_eq!(result.len(), 1);
    assert!(result.channel("a/b/c").is_none());
    let (result, _) = router.traverse(&Request::all("a")).unwrap();
    assert_eq!(result.len(), 2);
}

/// Two traversals racing ingestion only ever see whole frames.
#[test]
fn test_concurrent_traversal_sees_whole_frames() {
    let router = Arc::new(memory_router(TierLimits::frames(10_000)));
    router.accept_frame(frame(&["x", "y"], 0.0)).unwrap();

    let writer = {
        let router = Arc::clone(&router);
        thread::spawn(move || {
            for i in 1..500 {
                router.accept_frame(frame(&["x", "y"], i as f64)).unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let router = Arc::clone(&router);
            thread::spawn(move || {
                let mut last = 0;
                for _ in 0..200 {
                    let (result, _) = router.traverse(&Request::all("*")).unwrap();
                    let x = result.channel("x").unwrap().len();
                    let y = result.channel("y").unwrap().len();
                    assert_eq!(x, y, "partial frame visible");
                    assert!(x >= last);
                    last = x;
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    let (result, _) = router.traverse(&Request::all("x")).unwrap();
    assert_eq!(result.channel("x").unwrap().len(), 500);
}

#[test]
fn test_wait_for_frame_and_termination() {
    let router = Arc::new(memory_router(TierLimits::frames(10)));

    let waiter = {
        let router = Arc::clone(&router);
        thread::spawn(move || router.wait_for_frame(None, Duration::from_secs(10)))
    };
    thread::sleep(Duration::from_millis(20));
    router.accept_frame(frame(&["a"], 1.0)).unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), Some(0));

    assert_eq!(
        router
            .wait_for_frame(Some(0), Duration::from_millis(10))
            .unwrap(),
        None
    );

    let waiter = {
        let router = Arc::clone(&router);
        thread::spawn(move || router.wait_for_frame(Some(0), Duration::from_secs(10)))
    };
    thread::sleep(Duration::from_millis(20));
    router.close().unwrap();
    let err = waiter.join().unwrap().unwrap_err();
    assert!(err.is_terminated());
    assert!(router.accept_frame(frame(&["a"], 2.0)).unwrap_err().is_terminated());
}

/// A wait with no representable deadline still wakes on a frame or on close.
#[test]
fn test_wait_for_frame_without_deadline() {
    let router = Arc::new(memory_router(TierLimits::frames(10)));
    router.accept_frame(frame(&["a"], 1.0)).unwrap();

    let waiter = {
        let router = Arc::clone(&router);
        thread::spawn(move || router.wait_for_frame(Some(0), Duration::MAX))
    };
    thread::sleep(Duration::from_millis(20));
    router.accept_frame(frame(&["a"], 2.0)).unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), Some(1));

    let waiter = {
        let router = Arc::clone(&router);
        thread::spawn(move || router.wait_for_frame(Some(1), Duration::MAX))
    };
    thread::sleep(Duration::from_millis(20));
    router.close().unwrap();
    assert!(waiter.join().unwrap().unwrap_err().is_terminated());
}

// ============================================================================
// Administration
// ============================================================================

/// Deleting one of two channels sharing a partition deletes nothing.
#[test]
fn test_partial_delete_keeps_partition() {
    let router = memory_router(TierLimits::frames(100));
    router.accept_frame(frame(&["A", "B"], 1.0)).unwrap();
    router.accept_frame(frame(&["C"], 1.0)).unwrap();

    let report = router.delete_channels(&["A"]).unwrap();
    assert_eq!(
        report.outcome("A"),
        Some(&DeleteOutcome::AdditionalChannelsRemain(vec!["B".to_string()]))
    );
    assert!(!report.all_succeeded());
    assert_eq!(
        report.outcome("A").unwrap().message(),
        "FAILURE: There are additional channels in the ring buffer."
    );
    let (result, _) = router.traverse(&Request::all("*")).unwrap();
    assert_eq!(result.len(), 3);

    let report = router.delete_channels(&["A", "B", "missing"]).unwrap();
    assert_eq!(report.outcome("A"), Some(&DeleteOutcome::Deleted));
    assert_eq!(report.outcome("B"), Some(&DeleteOutcome::Deleted));
    assert_eq!(report.outcome("missing"), Some(&DeleteOutcome::DidNotExist));
    assert_eq!(router.owner_of("A").unwrap(), None);
    assert_eq!(router.owner_of("C").unwrap(), Some(2));
    assert_eq!(router.stats().unwrap().partitions, 1);

    let (entries, _) = router.registration("*").unwrap();
    let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["C"]);

    assert!(matches!(
        router.delete_channels(&["C*"]),
        Err(DenError::InvalidPattern(_))
    ));
}

#[test]
fn test_delete_everything_resets() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("den");
    let router = PartitionRouter::open(archived_config(&root, ArchiveMode::Create)).unwrap();
    for i in 0..30 {
        router.accept_frame(frame(&["a"], i as f64)).unwrap();
        router.accept_frame(frame(&["b"], i as f64)).unwrap();
    }
    assert!(root.join("RB2").exists());

    let report = router.delete_channels(&["..."]).unwrap();
    assert!(report.all_succeeded());
    assert!(!root.join("RB1").exists());
    assert!(!root.join("RB2").exists());
    let stats = router.stats().unwrap();
    assert_eq!(stats.partitions, 0);
    assert_eq!(stats.next_index, 0);

    assert_eq!(router.accept_frame(frame(&["b"], 0.0)).unwrap(), 0);
    assert_eq!(router.owner_of("b").unwrap(), Some(1));
}

#[test]
fn test_clear_cache_keeps_data() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("den");
    let router = PartitionRouter::open(archived_config(&root, ArchiveMode::Create)).unwrap();
    for i in 0..7 {
        router.accept_frame(frame(&["a"], i as f64)).unwrap();
    }

    router.clear_cache().unwrap();
    let stats = router.stats().unwrap();
    assert_eq!(stats.cache_frames, 0);
    assert_eq!(stats.archive_frames, 7);
    assert!(root.join("RB1").join("seal.den").exists());
    assert!(root.join("seal.den").exists());

    let (result, _) = router.traverse(&Request::all("a")).unwrap();
    assert_eq!(result.channel("a").unwrap().len(), 7);
}

#[test]
fn test_reconnect_resizes_without_losing_data() {
    let router = memory_router(TierLimits::frames_in(20, 4));
    for i in 0..15 {
        router.accept_frame(frame(&["a"], i as f64)).unwrap();
    }
    router.detach().unwrap();
    assert!(matches!(
        router.accept_frame(frame(&["a"], 15.0)),
        Err(DenError::Detached)
    ));

    router
        .reconnect(TierLimits::frames_in(100, 10), TierLimits::frames(0))
        .unwrap();
    let (result, _) = router.traverse(&Request::all("a")).unwrap();
    assert_eq!(result.channel("a").unwrap().len(), 15);

    for i in 15..60 {
        router.accept_frame(frame(&["a"], i as f64)).unwrap();
    }
    let (result, _) = router.traverse(&Request::all("a")).unwrap();
    assert_eq!(result.channel("a").unwrap().len(), 60);
}

// ============================================================================
// Failure Isolation
// ============================================================================

/// A partition whose directory vanishes fails alone.
#[test]
fn test_failed_partition_is_isolated() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("den");
    let router = PartitionRouter::open(archived_config(&root, ArchiveMode::Create)).unwrap();
    router.accept_frame(frame(&["a"], 0.0)).unwrap();
    router.accept_frame(frame(&["b"], 0.0)).unwrap();

    fs::remove_dir_all(root.join("RB1")).unwrap();
    fs::write(root.join("RB1"), b"not a directory").unwrap();

    let mut failure = None;
    for i in 1..30 {
        if let Err(err) = router.accept_frame(frame(&["a"], i as f64)) {
            failure = Some(err);
            break;
        }
    }
    assert!(failure.is_some());
    assert!(matches!(
        router.accept_frame(frame(&["a"], 100.0)),
        Err(DenError::PartitionUnavailable(1))
    ));
    assert!(matches!(
        router.traverse(&Request::all("a")),
        Err(DenError::PartitionUnavailable(1))
    ));

    for i in 1..30 {
        router.accept_frame(frame(&["b"], i as f64)).unwrap();
    }
    let (result, _) = router.traverse(&Request::all("b")).unwrap();
    assert_eq!(result.channel("b").unwrap().len(), 30);
    let (entries, _) = router.registration("*").unwrap();
    let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["b"]);
    assert_eq!(router.stats().unwrap().failed_partitions, 1);
    router.close().unwrap();
}

/// A partition that cannot create its archive on reconnect fails alone;
/// the others and new partitions use the new limits.
#[test]
fn test_reconnect_failure_isolated_to_partition() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("den");
    let router = PartitionRouter::open(
        RouterConfig::default()
            .with_archive_root(&root, ArchiveMode::Create)
            .with_cache(TierLimits::frames(10))
            .with_archive(TierLimits::frames(0)),
    )
    .unwrap();
    router.accept_frame(frame(&["a"], 0.0)).unwrap();
    router.accept_frame(frame(&["b"], 0.0)).unwrap();
    assert!(!root.join("RB1").exists());
    fs::write(root.join("RB2"), b"not a directory").unwrap();

    router.detach().unwrap();
    assert!(router
        .reconnect(TierLimits::frames(10), TierLimits::frames(100))
        .is_err());

    assert!(root.join("RB1").is_dir());
    assert_eq!(router.accept_frame(frame(&["a"], 1.0)).unwrap(), 2);
    router.accept_frame(frame(&["c"], 1.0)).unwrap();
    assert_eq!(router.owner_of("c").unwrap(), Some(3));
    assert!(root.join("RB3").is_dir());

    assert!(matches!(
        router.traverse(&Request::all("b")),
        Err(DenError::PartitionUnavailable(2))
    ));
    let stats = router.stats().unwrap();
    assert_eq!(stats.failed_partitions, 1);
    assert_eq!(stats.partitions, 3);
}
