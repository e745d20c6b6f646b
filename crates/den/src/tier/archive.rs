//! On-disk archive tier.
//!
//! The archive receives closed cache chunks and appends them to the open
//! chunk-group's data file. When the capacity policy says the group is full
//! it is synced and sealed, and the oldest sealed groups beyond capacity are
//! deleted. Only group metadata stays in memory; traversals read frames back
//! from the group files.
//!
//! The partition-level seal is removed before the first write after a load
//! and rewritten by [`ArchiveTier::seal_partition`], so a crash in between is
//! detected on the next startup.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::frame::TimeRange;
use crate::query::{QueryResult, Queryable, Registerable, TraversalPlan};
use crate::registration::Registration;
use crate::storage::group_file::{read_group, GroupContents, GroupWriter};
use crate::storage::layout::{delete_dir, group_dir};
use crate::storage::seal::{Seal, SealClock};
use crate::storage::summary::Summary;
use crate::storage::write_partition_files;
use crate::tier::capacity::CapacityPolicy;
use crate::tier::chunk::Chunk;

/// Metadata of one chunk-group.
#[derive(Debug, Clone)]
pub struct GroupMeta {
    /// Group id (`FS<id>`).
    pub id: u64,
    /// Group directory.
    pub dir: PathBuf,
    /// Number of cache chunks in the group.
    pub chunk_count: usize,
    /// Number of frames in the group.
    pub frame_count: usize,
    /// First and last frame index.
    pub indices: Option<(u64, u64)>,
    /// Time range of the group's data.
    pub range: Option<TimeRange>,
    /// Registration of the group's data.
    pub registration: Registration,
    /// Seal written when the group closed.
    pub seal: Option<Seal>,
}

impl GroupMeta {
    fn empty(id: u64, dir: PathBuf) -> Self {
        Self {
            id,
            dir,
            chunk_count: 0,
            frame_count: 0,
            indices: None,
            range: None,
            registration: Registration::new(),
            seal: None,
        }
    }

    /// Builds metadata from a decoded group file.
    pub fn from_contents(dir: &Path, contents: &GroupContents, seal: Option<Seal>) -> Self {
        let mut meta = Self::empty(contents.group_id, dir.to_path_buf());
        meta.seal = seal;
        for chunk in &contents.chunks {
            meta.chunk_count += 1;
            for stored in &chunk.frames {
                meta.add_frame_bounds(stored.index, stored.frame.time_range());
                meta.registration.record_frame(&stored.frame);
            }
            meta.frame_count += chunk.frames.len();
        }
        meta
    }

    fn add_chunk(&mut self, chunk: &Chunk) {
        self.chunk_count += 1;
        self.frame_count += chunk.len();
        if let Some((first, last)) = chunk.indices() {
            self.add_frame_bounds(first, chunk.range());
            self.add_frame_bounds(last, None);
        }
        self.registration.merge(&chunk.registration());
    }

    fn add_frame_bounds(&mut self, index: u64, range: Option<TimeRange>) {
        self.indices = Some(match self.indices {
            Some((first, last)) => (first.min(index), last.max(index)),
            None => (index, index),
        });
        if let Some(range) = range {
            self.range = Some(match self.range {
                Some(existing) => existing.union(&range),
                None => range,
            });
        }
    }

    /// Returns the data-time span in seconds.
    pub fn span(&self) -> f64 {
        self.range.map_or(0.0, |r| r.duration())
    }
}

struct OpenGroup {
    meta: GroupMeta,
    writer: GroupWriter,
}

/// Counters for the archive tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Cache chunks written into the archive.
    pub chunks_promoted: u64,
    /// Chunk-groups sealed.
    pub groups_sealed: u64,
    /// Chunk-groups deleted through capacity pressure.
    pub groups_evicted: u64,
}

/// Bounded on-disk sequence of chunk-groups under a partition directory.
pub struct ArchiveTier {
    dir: PathBuf,
    policy: Box<dyn CapacityPolicy>,
    groups: VecDeque<GroupMeta>,
    open: Option<OpenGroup>,
    next_group_id: u64,
    clock: SealClock,
    partition_sealed: bool,
    stats: ArchiveStats,
}

impl ArchiveTier {
    /// Creates an empty archive in `dir`.
    pub fn create(dir: &Path, policy: Box<dyn CapacityPolicy>) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self::from_loaded(dir, policy, Vec::new(), SealClock::default(), false))
    }

    /// Wraps groups that passed validation.
    pub fn from_loaded(
        dir: &Path,
        policy: Box<dyn CapacityPolicy>,
        groups: Vec<GroupMeta>,
        clock: SealClock,
        partition_sealed: bool,
    ) -> Self {
        let next_group_id = groups.last().map_or(1, |g| g.id + 1);
        Self {
            dir: dir.to_path_buf(),
            policy,
            groups: groups.into(),
            open: None,
            next_group_id,
            clock,
            partition_sealed,
            stats: ArchiveStats::default(),
        }
    }

    /// Returns the partition directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Replaces the capacity policy. Existing groups stay until new chunks push them out.
    pub fn set_policy(&mut self, policy: Box<dyn CapacityPolicy>) {
        self.policy = policy;
    }

    /// Writes a closed cache chunk into the open group.
    ///
    /// Returns the ids of groups deleted to stay within capacity.
    pub fn promote(&mut self, chunk: &Chunk) -> Result<Vec<u64>> {
        self.begin_write()?;

        let open = match self.open.as_mut() {
            Some(open) => open,
            None => {
                let id = self.next_group_id;
                let dir = group_dir(&self.dir, id);
                let writer = GroupWriter::create(&dir, id)?;
                self.next_group_id += 1;
                self.open.insert(OpenGroup {
                    meta: GroupMeta::empty(id, dir),
                    writer,
                })
            }
        };
        open.writer.append_chunk(chunk.id(), chunk.frames())?;
        open.meta.add_chunk(chunk);
        self.stats.chunks_promoted += 1;
        debug!(
            "Promoted chunk {} into group {} ({} chunks)",
            chunk.id(),
            open.meta.id,
            open.meta.chunk_count
        );

        if self
            .policy
            .should_close(open.meta.chunk_count, open.meta.span())
        {
            self.seal_open()?;
        }
        self.evict_excess()
    }

    fn begin_write(&mut self) -> Result<()> {
        if self.partition_sealed {
            Seal::remove(&self.dir)?;
            self.partition_sealed = false;
        }
        Ok(())
    }

    /// Syncs and seals the open group, if any.
    pub fn seal_open(&mut self) -> Result<()> {
        let Some(OpenGroup { mut meta, writer }) = self.open.take() else {
            return Ok(());
        };
        let (data_len, data_crc) = writer.finish()?;
        let seal = Seal {
            as_of: self.clock.next(),
            data_len,
            data_crc,
        };
        seal.write(&meta.dir)?;
        meta.seal = Some(seal);
        debug!(
            "Sealed group {} ({} chunks, {} frames)",
            meta.id, meta.chunk_count, meta.frame_count
        );
        self.groups.push_back(meta);
        self.stats.groups_sealed += 1;
        Ok(())
    }

    fn evict_excess(&mut self) -> Result<Vec<u64>> {
        let spans: Vec<f64> = self.groups.iter().map(GroupMeta::span).collect();
        let excess = self.policy.excess(&spans, self.open.is_some());
        let mut evicted = Vec::with_capacity(excess);
        for _ in 0..excess {
            if let Some(group) = self.groups.pop_front() {
                delete_dir(&group.dir)?;
                debug!("Evicted group {} from {:?}", group.id, self.dir);
                self.stats.groups_evicted += 1;
                evicted.push(group.id);
            }
        }
        Ok(evicted)
    }

    /// Seals the open group and writes the partition summary, registration and seal.
    pub fn seal_partition(&mut self, summary: &Summary) -> Result<()> {
        self.seal_open()?;
        if self.partition_sealed {
            return Ok(());
        }
        let summary = Summary {
            ring_buffers: self.groups.len(),
            oldest_group: self.groups.front().map(|g| g.id),
            newest_group: self.groups.back().map(|g| g.id),
            ..summary.clone()
        };
        write_partition_files(
            &self.dir,
            &summary,
            &self.registration(),
            None,
            &mut self.clock,
        )?;
        self.partition_sealed = true;
        Ok(())
    }

    /// Returns true if the partition seal on disk is current.
    pub fn is_partition_sealed(&self) -> bool {
        self.partition_sealed
    }

    /// Iterates sealed groups, oldest first.
    pub fn groups(&self) -> impl Iterator<Item = &GroupMeta> {
        self.groups.iter()
    }

    fn all_groups(&self) -> impl Iterator<Item = &GroupMeta> {
        self.groups
            .iter()
            .chain(self.open.as_ref().map(|open| &open.meta))
    }

    /// Returns the number of groups including the open one.
    pub fn group_count(&self) -> usize {
        self.groups.len() + usize::from(self.open.is_some())
    }

    /// Returns the number of archived frames.
    pub fn frame_count(&self) -> usize {
        self.all_groups().map(|g| g.frame_count).sum()
    }

    /// Returns the time range of the archived data.
    pub fn range(&self) -> Option<TimeRange> {
        self.all_groups()
            .filter_map(|g| g.range)
            .reduce(|a, b| a.union(&b))
    }

    /// Returns the newest archived frame index.
    pub fn last_index(&self) -> Option<u64> {
        self.all_groups().filter_map(|g| g.indices).map(|(_, last)| last).max()
    }

    /// Returns the archive counters.
    pub fn stats(&self) -> &ArchiveStats {
        &self.stats
    }
}

impl std::fmt::Debug for ArchiveTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveTier")
            .field("dir", &self.dir)
            .field("groups", &self.groups.len())
            .field("open", &self.open.as_ref().map(|o| o.meta.id))
            .field("partition_sealed", &self.partition_sealed)
            .finish()
    }
}

impl Registerable for ArchiveTier {
    fn registration(&self) -> Registration {
        let mut registration = Registration::new();
        for group in self.all_groups() {
            registration.merge(&group.registration);
        }
        registration
    }
}

impl Queryable for ArchiveTier {
    fn collect(&self, plan: &TraversalPlan, out: &mut QueryResult) -> Result<()> {
        for group in self.all_groups() {
            if !plan.may_touch(&group.registration, group.indices) {
                continue;
            }
            let contents = read_group(&group.dir)?;
            for stored in contents.frames() {
                plan.collect_frame(stored.index, stored.frame.samples(), out);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ChannelSample, Frame, StoredFrame};
    use crate::query::TimeSelector;
    use crate::storage::layout::{list_groups, SEAL_FILE};
    use crate::tier::capacity::CountCapacity;
    use tempfile::TempDir;

    fn chunk(id: u64, first: u64, len: u64) -> Chunk {
        let mut chunk = Chunk::new(id);
        for i in first..first + len {
            chunk.push(StoredFrame::new(
                i,
                Frame::default().with_sample(ChannelSample::float64("c", i as f64, i as f64)),
            ));
        }
        chunk
    }

    fn archive(dir: &Path, groups: usize, chunks_per_group: usize) -> ArchiveTier {
        ArchiveTier::create(
            dir,
            Box::new(CountCapacity {
                units: groups,
                items_per_unit: chunks_per_group,
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_archive_seals_full_groups() {
        let temp_dir = TempDir::new().unwrap();
        let mut archive = archive(temp_dir.path(), 3, 2);

        for i in 0..4u64 {
            archive.promote(&chunk(i, i * 5, 5)).unwrap();
        }
        let seals: Vec<i64> = archive
            .groups()
            .map(|g| g.seal.unwrap().as_of)
            .collect();
        assert_eq!(seals.len(), 2);
        assert!(seals[0] < seals[1]);
        assert!(group_dir(temp_dir.path(), 1).join(SEAL_FILE).exists());
        assert_eq!(archive.frame_count(), 20);
        assert_eq!(archive.last_index(), Some(19));
    }

    #[test]
    fn test_archive_evicts_oldest_group() {
        let temp_dir = TempDir::new().unwrap();
        let mut archive = archive(temp_dir.path(), 2, 1);

        let mut evicted = Vec::new();
        for i in 0..5u64 {
            evicted.extend(archive.promote(&chunk(i, i * 2, 2)).unwrap());
        }
        assert_eq!(evicted, vec![1, 2, 3]);
        let on_disk: Vec<u64> = list_groups(temp_dir.path())
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(on_disk, vec![4, 5]);
        assert_eq!(archive.stats().groups_evicted, 3);
    }

    #[test]
    fn test_archive_reads_open_and_sealed_groups() {
        let temp_dir = TempDir::new().unwrap();
        let mut archive = archive(temp_dir.path(), 10, 2);
        for i in 0..3u64 {
            archive.promote(&chunk(i, i * 4, 4)).unwrap();
        }
        assert_eq!(archive.group_count(), 2);

        let registration = archive.registration();
        let plan = TraversalPlan::resolve(
            &TimeSelector::Frames { start: 6, count: 4 },
            ["c"],
            &registration,
        );
        let mut out = QueryResult::new();
        archive.collect(&plan, &mut out).unwrap();
        let indices: Vec<u64> = out.channel("c").unwrap().iter().map(|h| h.index).collect();
        assert_eq!(indices, vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_partition_seal_removed_on_write() {
        let temp_dir = TempDir::new().unwrap();
        let mut archive = archive(temp_dir.path(), 4, 1);
        archive.promote(&chunk(0, 0, 2)).unwrap();
        archive.seal_partition(&Summary::default()).unwrap();
        assert!(temp_dir.path().join(SEAL_FILE).exists());
        assert!(archive.is_partition_sealed());

        archive.promote(&chunk(1, 2, 2)).unwrap();
        assert!(!temp_dir.path().join(SEAL_FILE).exists());
        assert!(!archive.is_partition_sealed());
    }
}
