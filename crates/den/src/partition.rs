//! Ring-buffer partitions.
//!
//! A partition owns one cache tier and at most one archive tier behind its
//! own [`Door`]. Ingestion and administrative operations take the door for
//! writing; traversals and registration reads share it.
//!
//! # State Machine
//!
//! ```text
//!  Loading ──▶ Ready ◀──▶ AcceptingFrame
//!                │
//!                ├──▶ Resetting ────▶ Closed
//!                ├──▶ ShuttingDown ─▶ Closed
//!                └──▶ Failed (inert; every operation reports unavailable)
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::door::Door;
use crate::error::{DenError, Result};
use crate::frame::{is_backward, StoredFrame};
use crate::query::{QueryResult, Queryable, Registerable, TimeSelector, TraversalPlan};
use crate::registration::{PendingChange, Registration, RegistrationUpdate};
use crate::storage::layout::{delete_dir, remove_file_if_exists};
use crate::storage::recovery::{load_partition, RecoveryReport};
use crate::storage::summary::Summary;
use crate::tier::archive::ArchiveTier;
use crate::tier::cache::CacheTier;
use crate::tier::capacity::{CapacityPolicy, CountCapacity};
use crate::tier::TierPlan;

/// Lifecycle state of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// Validating and loading its archive.
    Loading,
    /// Serving requests.
    Ready,
    /// A frame is being stored.
    AcceptingFrame,
    /// Being destroyed.
    Resetting,
    /// Flushing for shutdown.
    ShuttingDown,
    /// Closed or destroyed; the door is terminated.
    Closed,
    /// A fatal error occurred; the partition is inert.
    Failed,
}

/// Per-partition construction options.
#[derive(Debug, Clone)]
pub struct PartitionOptions {
    /// Partition directory; `None` keeps the partition in memory.
    pub dir: Option<PathBuf>,
    /// Door long-wait threshold.
    pub long_wait: Duration,
    /// Tolerate backward time for single-frame caches without an archive.
    pub latest_value_mode: bool,
    /// Frames and archive writes are allowed.
    pub writable: bool,
    /// Summary carrying configured sizes.
    pub summary: Summary,
}

/// Statistics for one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionStats {
    /// Partition id.
    pub id: u32,
    /// Number of channels owned.
    pub channels: usize,
    /// Cache chunks holding data.
    pub cache_chunks: usize,
    /// Frames in the cache.
    pub cache_frames: usize,
    /// Archive chunk-groups, including the open one.
    pub archive_groups: usize,
    /// Frames in the archive.
    pub archive_frames: usize,
    /// Frames accepted since the partition was opened.
    pub frames_accepted: u64,
    /// Cache chunks dropped because there is no archive.
    pub chunks_dropped: u64,
    /// Cache chunks promoted into the archive.
    pub chunks_promoted: u64,
    /// Archive chunk-groups evicted.
    pub groups_evicted: u64,
}

struct PartitionInner {
    cache: CacheTier,
    archive: Option<ArchiveTier>,
    plan: TierPlan,
    dir: Option<PathBuf>,
    channels: BTreeSet<String>,
    last_end: Option<f64>,
    latest_value_mode: bool,
    writable: bool,
    summary: Summary,
    chunks_dropped: u64,
}

impl PartitionInner {
    fn tolerates_backward(&self) -> bool {
        self.latest_value_mode && self.plan.is_latest_value() && self.archive.is_none()
    }

    /// Stores one frame; returns the number of chunks that left the cache.
    fn accept(&mut self, id: u32, stored: StoredFrame) -> Result<usize> {
        let range = stored.frame.time_range();
        if let (Some(previous_end), Some(range)) = (self.last_end, range) {
            if is_backward(previous_end, range.start) && !self.tolerates_backward() {
                return Err(DenError::BackwardTime {
                    previous_end,
                    start: range.start,
                });
            }
        }

        for name in stored.frame.channel_names() {
            if !self.channels.contains(name) {
                self.channels.insert(name.to_string());
            }
        }
        if let Some(range) = range {
            self.last_end = Some(match self.last_end {
                Some(end) if !self.tolerates_backward() => end.max(range.end),
                _ => range.end,
            });
        }

        let outcome = self.cache.append(stored);
        let released = outcome.released.len();
        for chunk in outcome.released {
            match self.archive.as_mut() {
                Some(archive) => {
                    archive.promote(&chunk)?;
                }
                None => {
                    self.chunks_dropped += 1;
                    debug!(
                        partition = id,
                        chunk = chunk.id(),
                        frames = chunk.len(),
                        "Dropped chunk: cache full and no archive"
                    );
                }
            }
        }
        Ok(released)
    }

    fn full_registration(&self) -> Registration {
        let mut registration = match &self.archive {
            Some(archive) => archive.registration(),
            None => Registration::new(),
        };
        registration.merge(&self.cache.registration());
        registration
    }

    /// Moves every cached chunk into the archive and seals it.
    fn flush_to_archive(&mut self) -> Result<bool> {
        let Some(archive) = self.archive.as_mut() else {
            return Ok(false);
        };
        let chunks = self.cache.drain();
        let flushed = !chunks.is_empty();
        for chunk in &chunks {
            archive.promote(chunk)?;
        }
        archive.seal_partition(&self.summary)?;
        Ok(flushed)
    }

    fn last_index(&self) -> Option<u64> {
        let cached = self.cache.chunks().filter_map(|c| c.indices()).last();
        cached
            .map(|(_, last)| last)
            .or_else(|| self.archive.as_ref().and_then(ArchiveTier::last_index))
    }
}

/// Registration cached from the tiers, the change pending since the last
/// refresh, and the change not yet reported to the router.
#[derive(Default)]
struct RegistrationCache {
    cached: Option<Registration>,
    pending: PendingChange,
    unreported: PendingChange,
}

/// A shard of channels with its own cache and optional archive.
pub struct RingBufferPartition {
    id: u32,
    door: Door<PartitionInner>,
    registration: Mutex<RegistrationCache>,
    state: Mutex<PartitionState>,
}

impl RingBufferPartition {
    /// Creates an empty partition.
    ///
    /// The archive tier exists only if the plan has one and `options.dir` is set.
    pub fn create(id: u32, plan: &TierPlan, options: PartitionOptions) -> Result<Self> {
        let archive = match (&options.dir, plan.archive_policy()) {
            (Some(dir), Some(policy)) => Some(ArchiveTier::create(dir, policy)?),
            _ => None,
        };
        debug!(partition = id, archive = archive.is_some(), "Created partition");
        let partition = Self::assemble(id, plan, options, archive, BTreeSet::new(), None);
        partition.set_state(PartitionState::Ready);
        Ok(partition)
    }

    /// Validates, recovers and loads the partition in `options.dir`.
    ///
    /// # Errors
    ///
    /// Returns the validation or recovery error; see [`load_partition`].
    pub fn load(
        id: u32,
        plan: &TierPlan,
        options: PartitionOptions,
    ) -> Result<(Self, Option<RecoveryReport>)> {
        let dir = options.dir.clone().ok_or_else(|| {
            DenError::InvalidConfig(format!("partition {id} has no directory to load"))
        })?;
        let loaded = load_partition(&dir, &options.summary)?;
        let policy = plan
            .archive_policy()
            .unwrap_or_else(|| stored_archive_policy(loaded.summary.as_ref(), loaded.groups.len()));

        let registration = {
            let mut registration = Registration::new();
            for group in &loaded.groups {
                registration.merge(&group.registration);
            }
            registration
        };
        let channels = registration.names().map(str::to_string).collect();
        let archive = ArchiveTier::from_loaded(&dir, policy, loaded.groups, loaded.clock, loaded.sealed);
        info!(
            partition = id,
            groups = archive.group_count(),
            frames = archive.frame_count(),
            recovered = loaded.recovery.is_some(),
            "Loaded partition archive"
        );

        let last_end = archive.range().map(|r| r.end);
        let partition = Self::assemble(id, plan, options, Some(archive), channels, last_end);
        partition.set_state(PartitionState::Ready);
        Ok((partition, loaded.recovery))
    }

    /// Builds an inert partition standing in for one that failed to load.
    pub fn failed(id: u32, plan: &TierPlan, options: PartitionOptions) -> Self {
        let partition = Self::assemble(id, plan, options, None, BTreeSet::new(), None);
        *partition.state.lock() = PartitionState::Failed;
        partition
    }

    fn assemble(
        id: u32,
        plan: &TierPlan,
        options: PartitionOptions,
        archive: Option<ArchiveTier>,
        channels: BTreeSet<String>,
        last_end: Option<f64>,
    ) -> Self {
        let inner = PartitionInner {
            cache: CacheTier::new(plan.cache_policy(), 0),
            archive,
            plan: *plan,
            dir: options.dir,
            channels,
            last_end,
            latest_value_mode: options.latest_value_mode,
            writable: options.writable,
            summary: options.summary,
            chunks_dropped: 0,
        };
        Self {
            id,
            door: Door::with_long_wait(format!("partition-{id}"), inner, options.long_wait),
            registration: Mutex::new(RegistrationCache::default()),
            state: Mutex::new(PartitionState::Loading),
        }
    }

    /// Returns the partition id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the current state.
    pub fn state(&self) -> PartitionState {
        *self.state.lock()
    }

    /// Returns true if the partition failed and is inert.
    pub fn is_failed(&self) -> bool {
        self.state() == PartitionState::Failed
    }

    fn set_state(&self, state: PartitionState) {
        let mut current = self.state.lock();
        if *current != PartitionState::Failed {
            *current = state;
        }
    }

    fn fail(&self, operation: &str, err: &DenError) {
        error!(partition = self.id, operation, "Partition failed: {}", err);
        *self.state.lock() = PartitionState::Failed;
    }

    fn check_available(&self) -> Result<()> {
        if self.is_failed() {
            return Err(DenError::PartitionUnavailable(self.id));
        }
        Ok(())
    }

    /// Stores a frame.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::BackwardTime`] without storing anything if the
    /// frame starts before the previous frame ended. Any other error is
    /// fatal: the partition becomes [`PartitionState::Failed`].
    pub fn accept_frame(&self, stored: StoredFrame) -> Result<()> {
        self.check_available()?;
        let mut inner = self.door.write("partition.accept_frame")?;
        self.check_available()?;
        if !inner.writable {
            return Err(DenError::ReadOnly);
        }

        self.set_state(PartitionState::AcceptingFrame);
        let frame = stored.frame.clone();
        let result = inner.accept(self.id, stored);
        match result {
            Ok(released) => {
                let mut registration = self.registration.lock();
                if released > 0 {
                    registration.pending.mark_major();
                } else {
                    registration.pending.record_frame(&frame);
                }
                self.set_state(PartitionState::Ready);
                Ok(())
            }
            Err(err @ DenError::BackwardTime { .. }) => {
                warn!(partition = self.id, "Rejected frame: {}", err);
                self.set_state(PartitionState::Ready);
                Err(err)
            }
            Err(err) => {
                self.fail("accept_frame", &err);
                Err(err)
            }
        }
    }

    /// Brings the cached registration up to date and reports what changed
    /// since the previous call.
    pub fn update_registration(&self) -> Result<RegistrationUpdate> {
        self.check_available()?;
        let inner = self.door.read("partition.update_registration")?;
        self.refresh_registration(&inner, false);
        let unreported = std::mem::take(&mut self.registration.lock().unreported);
        Ok(match unreported {
            PendingChange::None => RegistrationUpdate::Unchanged,
            PendingChange::Minor(delta) => RegistrationUpdate::Minor(delta),
            PendingChange::Major => RegistrationUpdate::Major,
        })
    }

    fn refresh_registration(&self, inner: &PartitionInner, settle: bool) -> Registration {
        let mut guard = self.registration.lock();
        let cache = &mut *guard;
        let pending = std::mem::take(&mut cache.pending);
        match (cache.cached.is_some(), pending) {
            (true, PendingChange::None) => {}
            (true, PendingChange::Minor(delta)) => {
                if let Some(cached) = cache.cached.as_mut() {
                    cached.merge(&delta);
                }
                cache.unreported = match std::mem::take(&mut cache.unreported) {
                    PendingChange::Major => PendingChange::Major,
                    PendingChange::Minor(mut reported) => {
                        reported.merge(&delta);
                        PendingChange::Minor(reported)
                    }
                    PendingChange::None => PendingChange::Minor(delta),
                };
            }
            (_, _) => {
                cache.cached = Some(inner.full_registration());
                cache.unreported = PendingChange::Major;
            }
        }
        if settle {
            cache.unreported = PendingChange::None;
        }
        cache.cached.clone().unwrap_or_default()
    }

    /// Returns the partition's current registration.
    pub fn registration(&self) -> Result<Registration> {
        self.check_available()?;
        let inner = self.door.read("partition.registration")?;
        Ok(self.refresh_registration(&inner, false))
    }

    /// Returns the partition's current registration and marks every change
    /// in it as reported, so the next [`update_registration`] does not
    /// repeat them.
    ///
    /// [`update_registration`]: RingBufferPartition::update_registration
    pub fn settled_registration(&self) -> Result<Registration> {
        self.check_available()?;
        let inner = self.door.read("partition.settled_registration")?;
        Ok(self.refresh_registration(&inner, true))
    }

    /// Returns the channels this partition owns.
    pub fn channels(&self) -> Result<Vec<String>> {
        let inner = self.door.read("partition.channels")?;
        Ok(inner.channels.iter().cloned().collect())
    }

    /// Collects the samples of `channels` selected by `selector`.
    ///
    /// Names are resolved by the caller; names this partition holds no data
    /// for are ignored. Blocks while a frame is being accepted, so a
    /// traversal never sees a partially stored frame.
    pub fn move_down_from(&self, channels: &[&str], selector: &TimeSelector) -> Result<QueryResult> {
        self.check_available()?;
        let inner = self.door.read("partition.move_down_from")?;
        self.check_available()?;

        let registration = self.refresh_registration(&inner, false);
        let names: Vec<&str> = channels
            .iter()
            .copied()
            .filter(|name| registration.get(name).is_some())
            .collect();
        let mut out = QueryResult::new();
        if names.is_empty() {
            return Ok(out);
        }
        for name in &names {
            out.ensure_channel(name);
        }
        let plan = TraversalPlan::resolve(selector, names.iter().copied(), &registration);
        if let Some(archive) = &inner.archive {
            archive.collect(&plan, &mut out)?;
        }
        inner.cache.collect(&plan, &mut out)?;
        out.finish(selector);
        Ok(out)
    }

    /// Flushes the cache into the archive and seals it. No-op without an archive.
    pub fn clear_cache(&self) -> Result<()> {
        self.check_available()?;
        let mut inner = self.door.write("partition.clear_cache")?;
        if !inner.writable {
            return Err(DenError::ReadOnly);
        }
        match inner.flush_to_archive() {
            Ok(true) => {
                self.registration.lock().pending.mark_major();
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) => {
                self.fail("clear_cache", &err);
                Err(err)
            }
        }
    }

    /// Applies new tier limits without discarding stored data.
    ///
    /// A partition that cannot create its new archive fails.
    pub fn reconnect(&self, plan: &TierPlan, summary: &Summary) -> Result<()> {
        self.check_available()?;
        let mut guard = self.door.write("partition.reconnect")?;
        let inner = &mut *guard;
        inner.cache.set_policy(plan.cache_policy());
        if let Some(policy) = plan.archive_policy() {
            if let Some(archive) = inner.archive.as_mut() {
                archive.set_policy(policy);
            } else if let (Some(dir), true) = (&inner.dir, inner.writable) {
                match ArchiveTier::create(dir, policy) {
                    Ok(archive) => inner.archive = Some(archive),
                    Err(err) => {
                        self.fail("reconnect", &err);
                        return Err(err);
                    }
                }
            }
        }
        inner.plan = *plan;
        inner.summary = summary.clone();
        debug!(partition = self.id, "Reconnected with new limits");
        Ok(())
    }

    /// Flushes, seals and closes the partition. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = match self.door.write("partition.close") {
            Ok(inner) => inner,
            Err(err) if err.is_terminated() => return Ok(()),
            Err(err) => return Err(err),
        };
        let result = if self.is_failed() || !inner.writable {
            Ok(())
        } else {
            self.set_state(PartitionState::ShuttingDown);
            inner.flush_to_archive().map(|_| ())
        };
        inner.terminate();
        self.set_state(PartitionState::Closed);
        if let Err(err) = &result {
            error!(partition = self.id, "Failed to flush partition on close: {}", err);
        }
        result
    }

    /// Terminates the partition and deletes its directory.
    pub fn destroy(&self) -> Result<()> {
        let inner = self.door.write("partition.destroy")?;
        self.set_state(PartitionState::Resetting);
        inner.terminate();
        let result = match &inner.dir {
            Some(dir) => remove_path(dir),
            None => Ok(()),
        };
        *self.state.lock() = PartitionState::Closed;
        info!(partition = self.id, "Destroyed partition");
        result
    }

    /// Returns the newest stored frame index.
    pub fn last_index(&self) -> Result<Option<u64>> {
        let inner = self.door.read("partition.last_index")?;
        Ok(inner.last_index())
    }

    /// Returns partition statistics.
    pub fn stats(&self) -> Result<PartitionStats> {
        let inner = self.door.read("partition.stats")?;
        let archive_stats = inner.archive.as_ref().map(|a| a.stats().clone());
        Ok(PartitionStats {
            id: self.id,
            channels: inner.channels.len(),
            cache_chunks: inner.cache.chunk_count(),
            cache_frames: inner.cache.frame_count(),
            archive_groups: inner.archive.as_ref().map_or(0, ArchiveTier::group_count),
            archive_frames: inner.archive.as_ref().map_or(0, ArchiveTier::frame_count),
            frames_accepted: inner.cache.stats().frames_accepted,
            chunks_dropped: inner.chunks_dropped,
            chunks_promoted: archive_stats.as_ref().map_or(0, |s| s.chunks_promoted),
            groups_evicted: archive_stats.as_ref().map_or(0, |s| s.groups_evicted),
        })
    }
}

impl std::fmt::Debug for RingBufferPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBufferPartition")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("door", &self.door)
            .finish()
    }
}

/// Sizes a loaded archive from its summary when no archive limits are configured.
fn stored_archive_policy(summary: Option<&Summary>, groups: usize) -> Box<dyn CapacityPolicy> {
    let (sets, elements) = summary.map_or((0, 0), |s| (s.archive_sets, s.archive_elements));
    Box::new(CountCapacity {
        units: sets.max(groups).max(1),
        items_per_unit: elements.max(1),
    })
}

fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => remove_file_if_exists(path),
        _ => delete_dir(path),
    }
}
