// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Directory of sealed segments, ordered by time.
//!
//! The catalog owns the list of sealed segments, persists membership
//! through an append-only journal and governs retention. Readers
//! acquire segments as `Arc` references; a segment stays on disk while
//! any reference is held, even if retention would delete it.

/// Append-only membership journal
pub mod journal;

use crate::{
    file::{segment_file_name, BAD_SUFFIX, CATALOG_JOURNAL_FILE, TMP_SUFFIX},
    segment::meta::SegmentMeta,
    Segment, SegmentId, TimeRange,
};
use journal::Journal;
use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex, RwLock},
    time::Duration,
};

/// Governs which sealed segments are eligible for deletion
#[derive(Copy, Clone, Debug, Default)]
pub struct RetentionPolicy {
    /// Deletes segments whose newest event is older than this
    pub max_age: Option<Duration>,

    /// Deletes oldest segments while the total on-disk size exceeds this
    pub max_total_size: Option<u64>,
}

/// Outcome of a retention sweep
#[derive(Clone, Debug, Default)]
pub struct RetentionReport {
    /// Segments deleted by the sweep
    pub deleted: Vec<SegmentId>,

    /// Segments that were eligible but still referenced by readers
    pub kept_referenced: usize,

    /// Total on-disk size after the sweep
    pub remaining_size: u64,
}

/// Broadcast payload published when a segment is sealed
#[derive(Copy, Clone, Debug)]
pub struct SealNotice {
    /// Id of the sealed segment
    pub id: SegmentId,

    /// Time range of the sealed segment
    pub time_range: TimeRange,

    /// Number of events in the sealed segment
    pub event_count: u64,
}

/// What recovery found in the catalog directory
#[derive(Clone, Debug, Default)]
pub struct RecoveryReport {
    /// Segments restored from the journal
    pub recovered: usize,

    /// Segments quarantined because of integrity failures
    pub quarantined: Vec<SegmentId>,

    /// Journal entries dropped because the file no longer exists
    pub dropped: Vec<SegmentId>,
}

/// Directory of sealed segments ordered by min timestamp
///
/// Mutations (registration, retention) are serialized through write
/// locks; readers snapshot the segment list under a read lock and work
/// off their own `Arc`s afterwards.
#[derive(Debug)]
pub struct Catalog {
    folder: PathBuf,

    /// Sealed segments, sorted by (min_ts, id)
    segments: RwLock<Vec<Arc<Segment>>>,

    journal: Mutex<Journal>,

    /// Seal event subscribers; senders with dropped receivers are
    /// pruned on the next publish
    subscribers: Mutex<Vec<mpsc::Sender<SealNotice>>>,
}

impl Catalog {
    /// Creates a fresh catalog in (possibly new) `folder`.
    pub fn create_new<P: AsRef<Path>>(folder: P) -> crate::Result<Self> {
        let folder = folder.as_ref();
        std::fs::create_dir_all(folder)?;

        let journal = Journal::open(folder.join(CATALOG_JOURNAL_FILE))?;

        Ok(Self {
            folder: folder.into(),
            segments: RwLock::new(Vec::new()),
            journal: Mutex::new(journal),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Rebuilds the catalog by replaying the journal and cross-checking
    /// file existence.
    ///
    /// Quarantines segments that fail their integrity checks (renamed
    /// to `.bad`), drops journal entries whose files are gone, and
    /// removes unfinished `.tmp` files left behind by a crash.
    pub fn recover<P: AsRef<Path>>(folder: P) -> crate::Result<(Self, RecoveryReport)> {
        let folder = folder.as_ref();
        std::fs::create_dir_all(folder)?;

        log::info!("Recovering catalog at {folder:?}");

        let replayed = Journal::replay(folder.join(CATALOG_JOURNAL_FILE))?;

        let mut report = RecoveryReport::default();
        let mut segments: Vec<Arc<Segment>> = Vec::with_capacity(replayed.len());
        let mut registered: Vec<SegmentId> = Vec::with_capacity(replayed.len());

        for entry in replayed {
            registered.push(entry.id);

            let path = folder.join(segment_file_name(entry.id));

            if !path.exists() {
                log::warn!("Journal references missing segment {}, dropping", entry.id);
                report.dropped.push(entry.id);
                continue;
            }

            match Segment::open(&path, entry.id) {
                Ok(segment) => {
                    segments.push(Arc::new(segment));
                    report.recovered += 1;
                }
                Err(e) => {
                    log::error!("Quarantining segment {}: {e}", entry.id);

                    let bad_path =
                        folder.join(format!("{}.{BAD_SUFFIX}", segment_file_name(entry.id)));
                    std::fs::rename(&path, bad_path)?;

                    report.quarantined.push(entry.id);
                }
            }
        }

        Self::remove_orphans(folder, &registered)?;

        segments.sort_by_key(|s| (s.meta.time_range.min(), s.meta.id));

        let journal = Journal::open(folder.join(CATALOG_JOURNAL_FILE))?;

        log::info!(
            "Catalog recovered: {} segments, {} quarantined, {} dropped",
            report.recovered,
            report.quarantined.len(),
            report.dropped.len(),
        );

        Ok((
            Self {
                folder: folder.into(),
                segments: RwLock::new(segments),
                journal: Mutex::new(journal),
                subscribers: Mutex::new(Vec::new()),
            },
            report,
        ))
    }

    /// Removes unfinished `.tmp` files and sealed files the journal
    /// does not know about; watch replay covers their content.
    fn remove_orphans(folder: &Path, registered: &[SegmentId]) -> crate::Result<()> {
        for dirent in std::fs::read_dir(folder)? {
            let dirent = dirent?;

            if !dirent.file_type()?.is_file() {
                continue;
            }

            let name = dirent.file_name().to_string_lossy().into_owned();

            if name.ends_with(TMP_SUFFIX) {
                log::warn!("Removing unfinished segment file {name}");
                std::fs::remove_file(dirent.path())?;
                continue;
            }

            if let Some(id) = parse_segment_file_name(&name) {
                if !registered.contains(&id) {
                    log::warn!("Removing orphaned segment file {name}");
                    std::fs::remove_file(dirent.path())?;
                }
            }
        }

        Ok(())
    }

    /// Inserts a sealed segment, maintaining sort order by min
    /// timestamp, and publishes a seal notice.
    ///
    /// The journal line is fsynced before the segment becomes visible.
    pub fn register(&self, segment: Segment) -> crate::Result<Arc<Segment>> {
        let meta = segment.meta.clone();

        self.journal
            .lock()
            .map_err(|_| poisoned())?
            .register(meta.id, meta.time_range, meta.file_size)?;

        let segment = Arc::new(segment);

        {
            let mut lock = self.segments.write().map_err(|_| poisoned())?;

            let idx = lock.partition_point(|s| {
                (s.meta.time_range.min(), s.meta.id) <= (meta.time_range.min(), meta.id)
            });
            lock.insert(idx, Arc::clone(&segment));
        }

        log::debug!("Registered segment {} covering {}", meta.id, meta.time_range);

        self.publish(&meta);

        Ok(segment)
    }

    fn publish(&self, meta: &SegmentMeta) {
        let notice = SealNotice {
            id: meta.id,
            time_range: meta.time_range,
            event_count: meta.event_count,
        };

        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(notice).is_ok());
        }
    }

    /// Subscribes to seal events.
    pub fn subscribe(&self) -> mpsc::Receiver<SealNotice> {
        let (tx, rx) = mpsc::channel();

        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }

        rx
    }

    /// Returns the segments overlapping the given time range,
    /// binary-searching both endpoints.
    pub fn query(&self, range: &TimeRange) -> crate::Result<Vec<Arc<Segment>>> {
        let lock = self.segments.read().map_err(|_| poisoned())?;

        let hi = lock.partition_point(|s| s.meta.time_range.min() <= range.max());
        let lo = lock.get(..hi).map_or(0, |head| {
            head.partition_point(|s| s.meta.time_range.max() < range.min())
        });

        Ok(lock
            .get(lo..hi)
            .unwrap_or_default()
            .iter()
            .filter(|s| s.meta.time_range.overlaps(range))
            .cloned()
            .collect())
    }

    /// Snapshot of all segments, oldest first.
    pub fn segments(&self) -> crate::Result<Vec<Arc<Segment>>> {
        Ok(self.segments.read().map_err(|_| poisoned())?.clone())
    }

    /// Number of sealed segments.
    pub fn len(&self) -> crate::Result<usize> {
        Ok(self.segments.read().map_err(|_| poisoned())?.len())
    }

    /// Returns `true` if no segment is registered.
    pub fn is_empty(&self) -> crate::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Total on-disk size of all sealed segments.
    pub fn total_size(&self) -> crate::Result<u64> {
        Ok(self
            .segments
            .read()
            .map_err(|_| poisoned())?
            .iter()
            .map(|s| s.meta.file_size)
            .sum())
    }

    /// Sweeps segments eligible for deletion, oldest first.
    ///
    /// A segment is eligible when its newest event is older than
    /// `max_age`, or while the total size exceeds `max_total_size`.
    /// Segments still referenced by readers are skipped; the next
    /// sweep will catch them.
    pub fn retain(&self, policy: &RetentionPolicy, now: u64) -> crate::Result<RetentionReport> {
        let mut report = RetentionReport::default();

        let mut lock = self.segments.write().map_err(|_| poisoned())?;

        let mut total_size: u64 = lock.iter().map(|s| s.meta.file_size).sum();

        let mut idx = 0;
        while idx < lock.len() {
            let Some(segment) = lock.get(idx) else {
                break;
            };

            let too_old = policy.max_age.is_some_and(|max_age| {
                now.saturating_sub(segment.meta.time_range.max()) > max_age.as_secs()
            });

            let too_big = policy
                .max_total_size
                .is_some_and(|max_size| total_size > max_size);

            if !(too_old || too_big) {
                // Segments are ordered by time; size pressure only ever
                // removes a prefix, so we can stop at the first keeper
                // unless age still applies further on
                if policy.max_age.is_none() {
                    break;
                }

                idx += 1;
                continue;
            }

            // Readers hold references; keep the file until released
            if Arc::strong_count(segment) > 1 {
                report.kept_referenced += 1;
                idx += 1;
                continue;
            }

            let meta = segment.meta.clone();

            self.journal
                .lock()
                .map_err(|_| poisoned())?
                .delete(meta.id)?;

            std::fs::remove_file(&meta.path)?;

            log::debug!("Retention deleted segment {} ({})", meta.id, meta.time_range);

            total_size = total_size.saturating_sub(meta.file_size);
            report.deleted.push(meta.id);
            lock.remove(idx);
        }

        report.remaining_size = total_size;

        Ok(report)
    }

    /// Path of the catalog directory.
    #[must_use]
    pub fn folder(&self) -> &Path {
        &self.folder
    }
}

fn parse_segment_file_name(name: &str) -> Option<SegmentId> {
    name.strip_prefix("seg-")?
        .strip_suffix(".dat")?
        .parse()
        .ok()
}

fn poisoned() -> crate::Error {
    crate::Error::Io(std::io::Error::other("lock is poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{segment::writer::Options, CompressionType, Event, ResourceIdentity, SegmentWriter, Verb};
    use test_log::test;

    fn seal_segment(folder: &Path, id: SegmentId, ts_base: u64) -> crate::Result<Segment> {
        let mut writer = SegmentWriter::new(Options {
            folder: folder.into(),
            segment_id: id,
            block_soft_max: 1_024 * 1_024,
            block_row_max: 4_096,
            segment_max: 128 * 1_024 * 1_024,
            segment_age_max: Duration::from_secs(3_600),
            compression: CompressionType::Lz4,
            high_water_mark: 8 * 1_024 * 1_024,
        })?;

        for i in 0..10u64 {
            writer.append(Event::new(
                ResourceIdentity::builder()
                    .version("v1")
                    .kind("Pod")
                    .namespace("default")
                    .name(format!("p-{i}"))
                    .uid(format!("uid-{id}-{i}"))
                    .build(),
                ts_base + i,
                Verb::Create,
                br#"{"spec":{}}"#.to_vec(),
            ))?;
        }

        let meta = writer.seal()?.expect("should have events");
        Segment::open(&meta.path, meta.id)
    }

    #[test]
    fn catalog_query_overlapping() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let catalog = Catalog::create_new(folder.path())?;

        for id in 0..5 {
            let segment = seal_segment(folder.path(), id, id * 100)?;
            catalog.register(segment)?;
        }

        assert_eq!(5, catalog.len()?);

        let hits = catalog.query(&TimeRange::new(105, 250))?;
        assert_eq!(2, hits.len());

        let hits = catalog.query(&TimeRange::new(150, 250))?;
        assert_eq!(1, hits.len());

        let hits = catalog.query(&TimeRange::new(0, 1_000))?;
        assert_eq!(5, hits.len());

        let hits = catalog.query(&TimeRange::new(5_000, 6_000))?;
        assert!(hits.is_empty());

        Ok(())
    }

    #[test]
    fn catalog_recover_matches_journal() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;

        {
            let catalog = Catalog::create_new(folder.path())?;
            for id in 0..3 {
                let segment = seal_segment(folder.path(), id, id * 100)?;
                catalog.register(segment)?;
            }
        }

        let (catalog, report) = Catalog::recover(folder.path())?;

        assert_eq!(3, catalog.len()?);
        assert_eq!(3, report.recovered);
        assert!(report.quarantined.is_empty());
        assert!(report.dropped.is_empty());

        Ok(())
    }

    #[test]
    fn catalog_recover_drops_missing_files() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;

        {
            let catalog = Catalog::create_new(folder.path())?;
            for id in 0..3 {
                let segment = seal_segment(folder.path(), id, id * 100)?;
                catalog.register(segment)?;
            }
        }

        std::fs::remove_file(folder.path().join(segment_file_name(1)))?;

        let (catalog, report) = Catalog::recover(folder.path())?;

        assert_eq!(2, catalog.len()?);
        assert_eq!(vec![1], report.dropped);

        Ok(())
    }

    #[test]
    fn catalog_recover_quarantines_corrupt_segment() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;

        {
            let catalog = Catalog::create_new(folder.path())?;
            for id in 0..2 {
                let segment = seal_segment(folder.path(), id, id * 100)?;
                catalog.register(segment)?;
            }
        }

        // Damage the footer of segment 0
        let path = folder.path().join(segment_file_name(0));
        let mut bytes = std::fs::read(&path)?;
        let len = bytes.len();
        if let Some(byte) = bytes.get_mut(len - 10) {
            *byte ^= 0xFF;
        }
        std::fs::write(&path, bytes)?;

        let (catalog, report) = Catalog::recover(folder.path())?;

        assert_eq!(1, catalog.len()?);
        assert_eq!(vec![0], report.quarantined);
        assert!(folder.path().join("seg-0.dat.bad").exists());

        Ok(())
    }

    #[test]
    fn catalog_retention_by_age() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let catalog = Catalog::create_new(folder.path())?;

        for id in 0..3 {
            let segment = seal_segment(folder.path(), id, id * 100)?;
            catalog.register(segment)?;
        }

        let policy = RetentionPolicy {
            max_age: Some(Duration::from_secs(150)),
            max_total_size: None,
        };

        // Now = 300; segment 0 ends at 9, segment 1 at 109 - both too old
        let report = catalog.retain(&policy, 300)?;

        assert_eq!(vec![0, 1], report.deleted);
        assert_eq!(1, catalog.len()?);
        assert!(!folder.path().join(segment_file_name(0)).exists());

        Ok(())
    }

    #[test]
    fn catalog_retention_skips_referenced() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let catalog = Catalog::create_new(folder.path())?;

        let segment = seal_segment(folder.path(), 0, 0)?;
        catalog.register(segment)?;

        // A reader holds the segment
        let held = catalog.query(&TimeRange::all())?;

        let policy = RetentionPolicy {
            max_age: Some(Duration::from_secs(1)),
            max_total_size: None,
        };

        let report = catalog.retain(&policy, 1_000_000)?;
        assert!(report.deleted.is_empty());
        assert_eq!(1, report.kept_referenced);

        drop(held);

        let report = catalog.retain(&policy, 1_000_000)?;
        assert_eq!(vec![0], report.deleted);

        Ok(())
    }

    #[test]
    fn catalog_seal_notices() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let catalog = Catalog::create_new(folder.path())?;

        let rx = catalog.subscribe();

        let segment = seal_segment(folder.path(), 9, 500)?;
        catalog.register(segment)?;

        let notice = rx.try_recv().expect("should have a notice");
        assert_eq!(9, notice.id);
        assert_eq!(10, notice.event_count);

        Ok(())
    }
}
