//! Partition router.
//!
//! The router shards channels across ring-buffer partitions. The first
//! channel of a frame picks the partition; a frame whose first channel is
//! unknown creates a new partition owning every channel in it.
//!
//! # Doors
//!
//! ```text
//! intake     one frame (or administrative operation) in flight
//!   └─▶ router     channel map, partition set, tier plan
//!         └─▶ partition   tiers (see RingBufferPartition)
//!
//! aggregate  derived + explicit registration
//!   └─▶ router (snapshot partitions, release) ─▶ partition
//! ```
//!
//! Traversals snapshot the partition set under the router door and release
//! it before waiting on any partition door, so a busy partition never
//! blocks traversal of its siblings.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{ArchiveMode, RouterConfig, TierLimits};
use crate::door::Door;
use crate::error::{DenError, Result};
use crate::frame::{Frame, StoredFrame};
use crate::partition::{PartitionOptions, PartitionStats, RingBufferPartition};
use crate::query::{MatchReason, QueryResult, Request};
use crate::registration::file::read_registration;
use crate::registration::{ChannelRegistration, NamePattern, Registration, RegistrationUpdate};
use crate::signal::FrameSignal;
use crate::storage::layout::{delete_dir, quarantine, ArchiveLayout, NOT_RECOVERED_DIR};
use crate::storage::recovery::migrate_legacy_layout;
use crate::storage::seal::{current_timestamp_nanos, Seal, SealClock};
use crate::storage::summary::Summary;
use crate::storage::write_partition_files;
use crate::tier::TierPlan;

/// Result of deleting one selector entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Every matched channel was deleted with its partition.
    Deleted,
    /// Nothing matched.
    DidNotExist,
    /// A matched channel shares its partition with unselected channels; nothing was deleted.
    AdditionalChannelsRemain(Vec<String>),
}

impl DeleteOutcome {
    /// Returns the status line reported to administrators.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Deleted => "SUCCESS: Channel deleted.",
            Self::DidNotExist => "SUCCESS: Channel did not exist.",
            Self::AdditionalChannelsRemain(_) => {
                "FAILURE: There are additional channels in the ring buffer."
            }
        }
    }

    /// Returns true unless channels remain.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::AdditionalChannelsRemain(_))
    }
}

/// Per-selector results of [`PartitionRouter::delete_channels`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    /// Outcome for each selector, in request order.
    pub outcomes: Vec<(String, DeleteOutcome)>,
}

impl DeleteReport {
    /// Returns true if every selector succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| outcome.is_success())
    }

    /// Returns the outcome for `selector`.
    pub fn outcome(&self, selector: &str) -> Option<&DeleteOutcome> {
        self.outcomes
            .iter()
            .find(|(s, _)| s == selector)
            .map(|(_, outcome)| outcome)
    }
}

/// Statistics for the router.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Number of partitions.
    pub partitions: usize,
    /// Partitions that failed and are inert.
    pub failed_partitions: usize,
    /// Number of mapped channels.
    pub channels: usize,
    /// Index the next accepted frame will get.
    pub next_index: u64,
    /// Frames held in caches.
    pub cache_frames: usize,
    /// Frames held in archives.
    pub archive_frames: usize,
    /// Cache chunks dropped without an archive.
    pub chunks_dropped: u64,
    /// Cache chunks promoted into archives.
    pub chunks_promoted: u64,
    /// Archive chunk-groups evicted.
    pub groups_evicted: u64,
    /// Per-partition statistics of healthy partitions.
    pub per_partition: Vec<PartitionStats>,
}

struct Intake {
    next_index: u64,
    attached: bool,
}

struct RouterState {
    partitions: BTreeMap<u32, Arc<RingBufferPartition>>,
    channel_map: HashMap<String, u32>,
    next_partition_id: u32,
    plan: TierPlan,
    summary: Summary,
}

impl RouterState {
    fn new(plan: TierPlan, summary: Summary) -> Self {
        Self {
            partitions: BTreeMap::new(),
            channel_map: HashMap::new(),
            next_partition_id: 1,
            plan,
            summary,
        }
    }

    fn snapshot(&self) -> Vec<Arc<RingBufferPartition>> {
        self.partitions.values().cloned().collect()
    }

    fn channels_of(&self, id: u32) -> Vec<String> {
        let mut channels: Vec<String> = self
            .channel_map
            .iter()
            .filter(|(_, owner)| **owner == id)
            .map(|(name, _)| name.clone())
            .collect();
        channels.sort();
        channels
    }
}

#[derive(Default)]
struct AggregateState {
    derived: Registration,
    explicit: Registration,
    built: bool,
}

/// Archive state read from disk at startup.
struct LoadedRoot {
    state: RouterState,
    explicit: Registration,
    last_index: Option<u64>,
}

/// Routes frames to ring-buffer partitions and answers traversals across them.
pub struct PartitionRouter {
    config: RouterConfig,
    layout: Option<ArchiveLayout>,
    intake: Door<Intake>,
    state: Door<RouterState>,
    aggregate: Door<AggregateState>,
    aggregate_stale: AtomicBool,
    signal: FrameSignal,
    clock: Mutex<SealClock>,
    closed: AtomicBool,
}

impl PartitionRouter {
    /// Opens a router, creating, loading or recovering its archive per `config.mode`.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::InvalidConfig`] for inconsistent limits, or the
    /// I/O error that prevented the archive root from being prepared. In
    /// [`ArchiveMode::Append`] an unreadable archive is renamed aside and a
    /// fresh one is created instead of failing.
    pub fn open(config: RouterConfig) -> Result<Self> {
        let plan = config.plan()?;
        let summary = plan.summary_template(config.username.as_deref());
        let layout = config.archive_root().map(ArchiveLayout::new);

        let loaded = match (&layout, config.mode) {
            (None, _) | (_, ArchiveMode::None) => None,
            (Some(layout), ArchiveMode::Create) => {
                delete_dir(layout.root())?;
                fs::create_dir_all(layout.root())?;
                info!("Created archive at {:?}", layout.root());
                None
            }
            (Some(layout), ArchiveMode::Load) => {
                Some(load_root(&config, layout, &plan, &summary)?)
            }
            (Some(layout), ArchiveMode::Append) => {
                match load_root(&config, layout, &plan, &summary) {
                    Ok(loaded) => Some(loaded),
                    Err(err) => {
                        let aside = move_aside(layout.root())?;
                        warn!(
                            "Archive at {:?} is unreadable ({}); moved to {:?}",
                            layout.root(),
                            err,
                            aside
                        );
                        fs::create_dir_all(layout.root())?;
                        None
                    }
                }
            }
        };

        let (state, explicit, last_index) = match loaded {
            Some(loaded) => (loaded.state, loaded.explicit, loaded.last_index),
            None => (RouterState::new(plan, summary), Registration::new(), None),
        };
        let long_wait = config.long_wait;
        Ok(Self {
            intake: Door::with_long_wait(
                "router-intake",
                Intake {
                    next_index: last_index.map_or(0, |i| i + 1),
                    attached: true,
                },
                long_wait,
            ),
            state: Door::with_long_wait("router", state, long_wait),
            aggregate: Door::with_long_wait(
                "router-registration",
                AggregateState {
                    explicit,
                    ..AggregateState::default()
                },
                long_wait,
            ),
            aggregate_stale: AtomicBool::new(true),
            signal: FrameSignal::starting_at(last_index),
            clock: Mutex::new(SealClock::default()),
            closed: AtomicBool::new(false),
            layout,
            config,
        })
    }

    /// Returns the router configuration.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Stores a frame and returns its sequence index.
    ///
    /// Calls are serialized: a second frame waits until the first is fully
    /// stored in its partition. The index advances only on success.
    ///
    /// # Errors
    ///
    /// - [`DenError::EmptyFrame`] if the frame has no samples.
    /// - [`DenError::ReadOnly`] in [`ArchiveMode::Load`].
    /// - [`DenError::Detached`] after [`PartitionRouter::detach`].
    /// - [`DenError::ChannelConflict`] if a channel belongs to another partition.
    /// - The partition's error, e.g. [`DenError::BackwardTime`].
    pub fn accept_frame(&self, frame: Frame) -> Result<u64> {
        if frame.is_empty() {
            return Err(DenError::EmptyFrame);
        }
        let mut intake = self.intake.write("router.accept_frame")?;
        if !self.config.mode.accepts_frames() {
            return Err(DenError::ReadOnly);
        }
        if !intake.attached {
            return Err(DenError::Detached);
        }

        let (partition, unmapped) = self.route(&frame)?;
        let index = intake.next_index;
        if let Err(err) = partition.accept_frame(StoredFrame::new(index, frame)) {
            if partition.is_failed() {
                self.aggregate_stale.store(true, Ordering::Release);
            }
            return Err(err);
        }

        if !unmapped.is_empty() {
            let mut state = self.state.write("router.map_channels")?;
            for name in unmapped {
                state.channel_map.entry(name).or_insert(partition.id());
            }
        }
        intake.next_index += 1;
        self.signal.notify_stored(index);
        Ok(index)
    }

    /// Finds or creates the partition for `frame`.
    ///
    /// Returns the partition and the frame's channels it does not own yet.
    fn route(&self, frame: &Frame) -> Result<(Arc<RingBufferPartition>, Vec<String>)> {
        let mut state = self.state.write("router.route")?;
        let names: BTreeSet<&str> = frame.channel_names().collect();
        let first = frame.channel_names().next().ok_or(DenError::EmptyFrame)?;

        let owner = state.channel_map.get(first).copied();
        for name in &names {
            if let Some(other) = state.channel_map.get(*name).copied() {
                if Some(other) != owner {
                    return Err(DenError::ChannelConflict {
                        channel: name.to_string(),
                        owner: other,
                    });
                }
            }
        }

        match owner {
            Some(id) => {
                let partition = state
                    .partitions
                    .get(&id)
                    .cloned()
                    .ok_or(DenError::PartitionUnavailable(id))?;
                let unmapped = names
                    .iter()
                    .filter(|name| !state.channel_map.contains_key(**name))
                    .map(|name| name.to_string())
                    .collect();
                Ok((partition, unmapped))
            }
            None => {
                let id = state.next_partition_id;
                let partition = Arc::new(self.create_partition(id, &state.plan, &state.summary)?);
                state.next_partition_id += 1;
                state.partitions.insert(id, Arc::clone(&partition));
                for name in &names {
                    state.channel_map.insert(name.to_string(), id);
                }
                self.aggregate_stale.store(true, Ordering::Release);
                if let Some(layout) = &self.layout {
                    Seal::remove(layout.root())?;
                }
                info!(partition = id, channels = names.len(), "Created partition for new channels");
                Ok((partition, Vec::new()))
            }
        }
    }

    fn create_partition(&self, id: u32, plan: &TierPlan, summary: &Summary) -> Result<RingBufferPartition> {
        let options = partition_options(&self.config, self.layout.as_ref(), id, summary);
        RingBufferPartition::create(id, plan, options)
    }

    /// Deletes channels by exact name or wildcard; `...` deletes everything.
    ///
    /// A partition is destroyed only if every channel it owns is selected.
    /// Otherwise nothing in it is deleted and the selector reports the
    /// channels that remain.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::InvalidPattern`] for an illegal selector, or the
    /// first error raised while destroying a partition.
    pub fn delete_channels(&self, selectors: &[&str]) -> Result<DeleteReport> {
        let mut intake = self.intake.write("router.delete_channels")?;
        if !self.config.mode.accepts_frames() {
            return Err(DenError::ReadOnly);
        }
        if selectors
            .iter()
            .any(|s| matches!(s.trim(), "..." | "/..."))
        {
            self.reset_locked(&mut intake)?;
            return Ok(DeleteReport {
                outcomes: selectors
                    .iter()
                    .map(|s| (s.to_string(), DeleteOutcome::Deleted))
                    .collect(),
            });
        }
        let patterns = selectors
            .iter()
            .map(|s| NamePattern::parse(s))
            .collect::<Result<Vec<_>>>()?;

        let mut state = self.state.write("router.delete_channels")?;
        let names: Vec<String> = state.channel_map.keys().cloned().collect();
        let matched: Vec<Vec<String>> = patterns
            .iter()
            .map(|p| {
                p.select(names.iter().map(String::as_str))
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .collect();
        let selected: BTreeSet<&str> = matched.iter().flatten().map(String::as_str).collect();

        let mut remaining: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        let mut doomed = BTreeSet::new();
        for name in &selected {
            if let Some(id) = state.channel_map.get(*name).copied() {
                if remaining.contains_key(&id) || doomed.contains(&id) {
                    continue;
                }
                let left: Vec<String> = state
                    .channels_of(id)
                    .into_iter()
                    .filter(|c| !selected.contains(c.as_str()))
                    .collect();
                if left.is_empty() {
                    doomed.insert(id);
                } else {
                    remaining.insert(id, left);
                }
            }
        }

        let mut outcomes = Vec::with_capacity(selectors.len());
        for (selector, channels) in selectors.iter().zip(&matched) {
            let mut left: Vec<String> = channels
                .iter()
                .filter_map(|c| state.channel_map.get(c))
                .filter_map(|id| remaining.get(id))
                .flatten()
                .cloned()
                .collect();
            left.sort();
            left.dedup();
            let outcome = if channels.is_empty() {
                DeleteOutcome::DidNotExist
            } else if left.is_empty() {
                DeleteOutcome::Deleted
            } else {
                DeleteOutcome::AdditionalChannelsRemain(left)
            };
            outcomes.push((selector.to_string(), outcome));
        }

        let mut deleted_channels = Vec::new();
        let mut first_error = None;
        for id in &doomed {
            let channels = state.channels_of(*id);
            state.channel_map.retain(|_, owner| *owner != *id);
            if let Some(partition) = state.partitions.remove(id) {
                if let Err(err) = partition.destroy() {
                    error!(partition = id, "Failed to destroy partition: {}", err);
                    first_error.get_or_insert(err);
                }
            }
            deleted_channels.extend(channels);
        }
        drop(state);
        drop(intake);

        if !doomed.is_empty() {
            self.aggregate_stale.store(true, Ordering::Release);
            if let Some(layout) = &self.layout {
                Seal::remove(layout.root())?;
            }
            let mut aggregate = self.aggregate.write("router.delete_channels")?;
            for name in &deleted_channels {
                aggregate.explicit.remove(name);
            }
            info!(
                partitions = doomed.len(),
                channels = deleted_channels.len(),
                "Deleted channels"
            );
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(DeleteReport { outcomes }),
        }
    }

    /// Destroys every partition and all persisted state, then starts empty.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::ReadOnly`] in [`ArchiveMode::Load`].
    pub fn reset(&self) -> Result<()> {
        let mut intake = self.intake.write("router.reset")?;
        self.reset_locked(&mut intake)
    }

    fn reset_locked(&self, intake: &mut Intake) -> Result<()> {
        if !self.config.mode.accepts_frames() {
            return Err(DenError::ReadOnly);
        }
        {
            let mut state = self.state.write("router.reset")?;
            let partitions = std::mem::take(&mut state.partitions);
            state.channel_map.clear();
            state.next_partition_id = 1;
            for partition in partitions.values() {
                if let Err(err) = partition.destroy() {
                    warn!(partition = partition.id(), "Destroy during reset failed: {}", err);
                }
            }
            if let Some(layout) = &self.layout {
                delete_dir(layout.root())?;
                fs::create_dir_all(layout.root())?;
            }
        }
        intake.next_index = 0;
        self.signal.reset();
        self.aggregate_stale.store(true, Ordering::Release);
        *self.aggregate.write("router.reset")? = AggregateState::default();
        info!("Router reset");
        Ok(())
    }

    /// Returns registration entries matching `pattern`, explicit metadata applied.
    ///
    /// An illegal pattern yields no entries and [`MatchReason::UnmatchedIllegal`].
    pub fn registration(
        &self,
        pattern: &str,
    ) -> Result<(Vec<(String, ChannelRegistration)>, MatchReason)> {
        let Ok(pattern) = NamePattern::parse(pattern) else {
            return Ok((Vec::new(), MatchReason::UnmatchedIllegal));
        };
        let registration = self.aggregated_registration()?;
        let selected = registration.select(&pattern);
        let reason = if selected.is_empty() {
            MatchReason::UnmatchedUnknown
        } else {
            MatchReason::Matched
        };
        Ok((selected, reason))
    }

    /// Returns the aggregate registration of every healthy partition with
    /// explicit metadata applied.
    pub fn aggregated_registration(&self) -> Result<Registration> {
        let mut aggregate = self.aggregate.write("router.aggregate")?;
        let partitions = self.state.read("router.aggregate")?.snapshot();

        let mut major = self.aggregate_stale.swap(false, Ordering::AcqRel) || !aggregate.built;
        let mut minors = Vec::new();
        for partition in &partitions {
            match partition.update_registration() {
                Ok(RegistrationUpdate::Unchanged) => {}
                Ok(RegistrationUpdate::Minor(delta)) => minors.push(delta),
                Ok(RegistrationUpdate::Major) => major = true,
                Err(err) if skippable(&err) => major = true,
                Err(err) => return Err(err),
            }
        }

        if major {
            let mut derived = Registration::new();
            for partition in &partitions {
                match partition.settled_registration() {
                    Ok(registration) => derived.merge(&registration),
                    Err(err) if skippable(&err) => {}
                    Err(err) => return Err(err),
                }
            }
            aggregate.derived = derived;
            debug!(partitions = partitions.len(), "Recomputed aggregate registration");
        } else {
            for delta in &minors {
                aggregate.derived.merge(delta);
            }
        }
        aggregate.built = true;
        Ok(aggregate.derived.overlay(&aggregate.explicit))
    }

    /// Records user metadata for a channel. Explicit metadata wins over
    /// metadata derived from stored data.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::InvalidPattern`] if `name` is not a plain channel name.
    pub fn register_explicit(&self, name: &str, entry: ChannelRegistration) -> Result<()> {
        let pattern = NamePattern::parse(name)?;
        if pattern.is_wildcard() {
            return Err(DenError::InvalidPattern(format!(
                "{name}: explicit registration needs an exact name"
            )));
        }
        let mut aggregate = self.aggregate.write("router.register_explicit")?;
        aggregate.explicit.insert(name, entry);
        Ok(())
    }

    /// Answers a traversal request across all partitions.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::PartitionUnavailable`] if a failed partition owns
    /// a matching channel, and [`DenError::Terminated`] if a partition is
    /// destroyed while the traversal waits on it.
    pub fn traverse(&self, request: &Request) -> Result<(QueryResult, MatchReason)> {
        let Ok(pattern) = NamePattern::parse(&request.pattern) else {
            return Ok((QueryResult::new(), MatchReason::UnmatchedIllegal));
        };
        let (partitions, selected) = {
            let state = self.state.read("router.traverse")?;
            let names: Vec<&str> = state.channel_map.keys().map(String::as_str).collect();
            let mut selected: BTreeMap<u32, Vec<String>> = BTreeMap::new();
            for name in pattern.select(names) {
                if let Some(id) = state.channel_map.get(name) {
                    selected.entry(*id).or_default().push(name.to_string());
                }
            }
            (state.snapshot(), selected)
        };

        let mut result = QueryResult::new();
        for partition in partitions {
            let Some(channels) = selected.get(&partition.id()) else {
                continue;
            };
            if partition.is_failed() {
                return Err(DenError::PartitionUnavailable(partition.id()));
            }
            let channels: Vec<&str> = channels.iter().map(String::as_str).collect();
            result.extend(partition.move_down_from(&channels, &request.selector)?);
        }
        let reason = if result.is_empty() {
            MatchReason::UnmatchedUnknown
        } else {
            MatchReason::Matched
        };
        Ok((result, reason))
    }

    /// Flushes every cache into its archive and seals the archive.
    pub fn clear_cache(&self) -> Result<()> {
        let intake = self.intake.write("router.clear_cache")?;
        if !self.config.mode.accepts_frames() {
            return Err(DenError::ReadOnly);
        }
        let partitions = self.state.read("router.clear_cache")?.snapshot();
        let mut first_error = None;
        for partition in partitions.iter().filter(|p| !p.is_failed()) {
            if let Err(err) = partition.clear_cache() {
                first_error.get_or_insert(err);
            }
        }
        drop(intake);
        self.write_root_files()?;
        first_error.map_or(Ok(()), Err)
    }

    /// Stops accepting frames until [`PartitionRouter::reconnect`].
    pub fn detach(&self) -> Result<()> {
        let mut intake = self.intake.write("router.detach")?;
        intake.attached = false;
        info!("Producer detached");
        Ok(())
    }

    /// Re-attaches a producer with new tier limits; stored data is kept.
    ///
    /// Smaller limits take effect as new frames arrive.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::InvalidConfig`] for invalid limits, leaving the
    /// router unchanged. A partition that cannot apply the limits fails
    /// alone; every other partition is reconnected and the first such
    /// error is returned.
    pub fn reconnect(&self, cache: TierLimits, archive: TierLimits) -> Result<()> {
        let mut intake = self.intake.write("router.reconnect")?;
        let plan = TierPlan::new(
            &cache,
            self.config.mode.uses_root().then_some(&archive),
            self.config.synchronized,
        )?;
        let summary = plan.summary_template(self.config.username.as_deref());
        let mut first_error = None;
        {
            let mut state = self.state.write("router.reconnect")?;
            for partition in state.partitions.values().filter(|p| !p.is_failed()) {
                if let Err(err) = partition.reconnect(&plan, &summary) {
                    first_error.get_or_insert(err);
                }
            }
            state.plan = plan;
            state.summary = summary;
        }
        intake.attached = true;
        info!("Producer reconnected");
        first_error.map_or(Ok(()), Err)
    }

    /// Blocks until a frame newer than `after` is stored or `timeout` passes.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::Terminated`] if the router closes while waiting.
    pub fn wait_for_frame(&self, after: Option<u64>, timeout: Duration) -> Result<Option<u64>> {
        self.signal.wait_for_frame(after, timeout)
    }

    /// Returns the partition owning `channel`.
    pub fn owner_of(&self, channel: &str) -> Result<Option<u32>> {
        Ok(self.state.read("router.owner_of")?.channel_map.get(channel).copied())
    }

    /// Returns router statistics.
    pub fn stats(&self) -> Result<RouterStats> {
        let next_index = self.intake.read("router.stats")?.next_index;
        let (partitions, channels) = {
            let state = self.state.read("router.stats")?;
            (state.snapshot(), state.channel_map.len())
        };
        let mut stats = RouterStats {
            partitions: partitions.len(),
            channels,
            next_index,
            ..RouterStats::default()
        };
        for partition in &partitions {
            if partition.is_failed() {
                stats.failed_partitions += 1;
                continue;
            }
            let p = partition.stats()?;
            stats.cache_frames += p.cache_frames;
            stats.archive_frames += p.archive_frames;
            stats.chunks_dropped += p.chunks_dropped;
            stats.chunks_promoted += p.chunks_promoted;
            stats.groups_evicted += p.groups_evicted;
            stats.per_partition.push(p);
        }
        Ok(stats)
    }

    /// Flushes and seals every partition, writes the root files and
    /// terminates all doors. Waiters get [`DenError::Terminated`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let intake = self.intake.write("router.close")?;
        let (derived, explicit) = match self.aggregated_registration() {
            Ok(_) => {
                let aggregate = self.aggregate.read("router.close")?;
                (aggregate.derived.clone(), aggregate.explicit.clone())
            }
            Err(err) => {
                warn!("Could not aggregate registration on close: {}", err);
                (Registration::new(), Registration::new())
            }
        };

        let (partitions, summary) = {
            let state = self.state.read("router.close")?;
            (state.snapshot(), state.summary.clone())
        };
        let mut first_error = None;
        for partition in &partitions {
            if let Err(err) = partition.close() {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.persist_root(&summary, partitions.len(), &derived, &explicit) {
            first_error.get_or_insert(err);
        }

        self.state.write("router.close")?.terminate();
        self.aggregate.write("router.close")?.terminate();
        intake.terminate();
        drop(intake);
        self.signal.terminate();
        info!(partitions = partitions.len(), "Router closed");
        first_error.map_or(Ok(()), Err)
    }

    fn write_root_files(&self) -> Result<()> {
        self.aggregated_registration()?;
        let (derived, explicit) = {
            let aggregate = self.aggregate.read("router.write_root_files")?;
            (aggregate.derived.clone(), aggregate.explicit.clone())
        };
        let (summary, partitions) = {
            let state = self.state.read("router.write_root_files")?;
            (state.summary.clone(), state.partitions.len())
        };
        self.persist_root(&summary, partitions, &derived, &explicit)
    }

    fn persist_root(
        &self,
        summary: &Summary,
        partitions: usize,
        derived: &Registration,
        explicit: &Registration,
    ) -> Result<()> {
        let Some(layout) = &self.layout else {
            return Ok(());
        };
        if !self.config.mode.accepts_frames() {
            return Ok(());
        }
        let summary = Summary {
            ring_buffers: partitions,
            ..summary.clone()
        };
        write_partition_files(
            layout.root(),
            &summary,
            derived,
            Some(explicit),
            &mut self.clock.lock(),
        )?;
        Ok(())
    }
}

impl Drop for PartitionRouter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("Failed to close router on drop: {}", err);
        }
    }
}

impl std::fmt::Debug for PartitionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionRouter")
            .field("mode", &self.config.mode)
            .field("root", &self.layout.as_ref().map(ArchiveLayout::root))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Errors that leave a partition out of the aggregate instead of failing it.
fn skippable(err: &DenError) -> bool {
    err.is_terminated() || matches!(err, DenError::PartitionUnavailable(_))
}

fn partition_options(
    config: &RouterConfig,
    layout: Option<&ArchiveLayout>,
    id: u32,
    summary: &Summary,
) -> PartitionOptions {
    PartitionOptions {
        dir: layout.map(|l| l.partition_dir(id)),
        long_wait: config.long_wait,
        latest_value_mode: config.latest_value_mode,
        writable: config.mode.accepts_frames(),
        summary: summary.clone(),
    }
}

/// Loads every partition under the root and rebuilds the channel map.
fn load_root(
    config: &RouterConfig,
    layout: &ArchiveLayout,
    plan: &TierPlan,
    summary: &Summary,
) -> Result<LoadedRoot> {
    let root = layout.root();
    let mut loaded = LoadedRoot {
        state: RouterState::new(*plan, summary.clone()),
        explicit: Registration::new(),
        last_index: None,
    };
    if !root.exists() {
        if config.mode == ArchiveMode::Load {
            return Err(DenError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("archive root {root:?} does not exist"),
            )));
        }
        fs::create_dir_all(root)?;
        return Ok(loaded);
    }

    migrate_legacy_layout(root)?;
    match read_registration(root) {
        Ok(Some(stored)) => loaded.explicit = stored.explicit.unwrap_or_default(),
        Ok(None) => {}
        Err(err) => warn!("Root registration in {:?} is unreadable: {}", root, err),
    }

    for (id, dir) in layout.list_partitions()? {
        let state = &mut loaded.state;
        state.next_partition_id = state.next_partition_id.max(id + 1);
        let options = partition_options(config, Some(layout), id, summary);
        let partition = match RingBufferPartition::load(id, plan, options.clone()) {
            Ok((partition, recovery)) => {
                if let Some(recovery) = recovery {
                    warn!(
                        partition = id,
                        recovered = ?recovery.recovered,
                        not_recovered = ?recovery.not_recovered,
                        unrecoverable = ?recovery.unrecoverable,
                        "Partition archive was recovered"
                    );
                }
                partition
            }
            Err(err) if config.mode == ArchiveMode::Load => {
                error!(partition = id, "Partition failed to load: {}", err);
                if let Ok(Some(stored)) = read_registration(&dir) {
                    for name in stored.derived.names() {
                        state.channel_map.entry(name.to_string()).or_insert(id);
                    }
                }
                state
                    .partitions
                    .insert(id, Arc::new(RingBufferPartition::failed(id, plan, options)));
                continue;
            }
            Err(err) => return Err(err),
        };

        let channels = partition.channels()?;
        if let Some(owner) = channels
            .iter()
            .find_map(|c| state.channel_map.get(c).copied())
        {
            warn!(
                partition = id,
                owner,
                "Partition claims channels of another partition; quarantining it"
            );
            quarantine(&dir, root, NOT_RECOVERED_DIR)?;
            continue;
        }
        for channel in channels {
            state.channel_map.insert(channel, id);
        }
        if let Some(last) = partition.last_index()? {
            loaded.last_index = Some(loaded.last_index.map_or(last, |prev| prev.max(last)));
        }
        state.partitions.insert(id, Arc::new(partition));
    }
    info!(
        partitions = loaded.state.partitions.len(),
        channels = loaded.state.channel_map.len(),
        "Loaded archive at {:?}",
        root
    );
    Ok(loaded)
}

/// Renames an unreadable root to `<root>.unreadable-<ns>`.
fn move_aside(root: &Path) -> Result<PathBuf> {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let aside = root.with_file_name(format!("{name}.unreadable-{}", current_timestamp_nanos()));
    fs::rename(root, &aside)?;
    Ok(aside)
}
