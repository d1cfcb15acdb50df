// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    catalog::{Catalog, RecoveryReport, RetentionReport},
    lifecycle::Component,
    metadata::ClusterMetadata,
    query::{executor, QueryRequest, QueryResult},
    segment::{
        inverted_index::Dimension,
        writer::{Options as WriterOptions, SegmentWriter},
        Segment,
    },
    Config, Event, MemoryStore, StopSignal, TimeRange,
};
use enum_dispatch::enum_dispatch;
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// The storage capability set
///
/// Implementations are interchangeable behind [`AnyStore`]: the
/// file-backed [`Store`], or the in-memory [`MemoryStore`] for demos
/// and tests.
#[enum_dispatch]
pub trait EventStore {
    /// Appends one event to the log.
    ///
    /// # Errors
    ///
    /// May fail with [`crate::Error::Backpressure`]; the caller
    /// retries after a flush.
    fn append(&self, event: Event) -> crate::Result<()>;

    /// Forces buffered events onto disk (no seal).
    fn flush(&self) -> crate::Result<()>;

    /// Answers a bounded time-range query.
    ///
    /// The cancellation signal is honored at block boundaries.
    fn query(&self, request: &QueryRequest, cancel: Option<&StopSignal>)
        -> crate::Result<QueryResult>;

    /// Summarizes the stored data within a time range without block I/O.
    fn metadata(&self, range: &TimeRange) -> crate::Result<ClusterMetadata>;

    /// Applies the configured retention policy.
    fn retain(&self) -> crate::Result<RetentionReport>;

    /// Runs time-based maintenance (age seal, retention).
    fn maintain(&self) -> crate::Result<()>;
}

/// Any storage implementation behind the capability set
#[enum_dispatch(EventStore)]
pub enum AnyStore {
    /// File-backed block storage
    Persistent(Store),

    /// In-memory storage for demos and tests
    Memory(MemoryStore),
}

#[derive(Default, Debug)]
struct WriterState {
    writer: Option<SegmentWriter>,

    /// In-memory mirror of the open segment, serving live queries
    /// as a consistent prefix of the append order
    tail: Vec<Event>,
}

/// File-backed event store
///
/// Assembles writer, catalog and query execution. A single writer
/// owns the open segment; sealed segments are immutable and shared
/// with readers through the catalog.
///
/// The open segment is visible to queries: appends are mirrored into
/// an in-memory tail that queries snapshot at planning time, so a
/// query started at time T sees every append that happened before T.
/// The tail is bounded by the segment seal thresholds and reset on
/// seal.
#[derive(Debug)]
pub struct Store {
    cfg: Config,
    catalog: Arc<Catalog>,
    writer: Mutex<WriterState>,
    next_segment_id: AtomicU64,
    recovery: RecoveryReport,
}

impl Store {
    /// Opens (or recovers) the store in the configured directory.
    pub(crate) fn open(cfg: Config) -> crate::Result<Self> {
        let (catalog, recovery) = Catalog::recover(&cfg.folder)?;

        // Never reuse an id that exists on disk in any form
        let mut max_id = 0;

        for dirent in std::fs::read_dir(&cfg.folder)? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();

            if let Some(id) = name
                .strip_prefix("seg-")
                .and_then(|rest| rest.split('.').next())
                .and_then(|id| id.parse::<u64>().ok())
            {
                max_id = max_id.max(id);
            }
        }

        Ok(Self {
            cfg,
            catalog: Arc::new(catalog),
            writer: Mutex::new(WriterState::default()),
            next_segment_id: AtomicU64::new(max_id + 1),
            recovery,
        })
    }

    /// The segment catalog.
    #[must_use]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// What recovery found at open time.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Seals the open segment (if any) and registers it in the
    /// catalog. The next append starts a fresh segment.
    pub fn seal_active(&self) -> crate::Result<()> {
        let mut state = self.writer.lock().map_err(|_| poisoned())?;
        self.seal_locked(&mut state)
    }

    fn seal_locked(&self, state: &mut WriterState) -> crate::Result<()> {
        let Some(mut writer) = state.writer.take() else {
            return Ok(());
        };

        match writer.seal() {
            Ok(Some(meta)) => {
                let segment = Segment::open(&meta.path, meta.id)?;
                self.catalog.register(segment)?;
                state.tail.clear();
                Ok(())
            }

            Ok(None) => {
                state.tail.clear();
                Ok(())
            }

            Err(e) => {
                // Fatal to the open segment; replay covers the tail
                writer.abandon().ok();
                state.tail.clear();
                Err(e)
            }
        }
    }

    fn ensure_writer<'a>(
        &self,
        state: &'a mut WriterState,
    ) -> crate::Result<&'a mut SegmentWriter> {
        if state.writer.is_none() {
            let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);

            state.writer = Some(SegmentWriter::new(WriterOptions {
                folder: self.cfg.folder.clone(),
                segment_id: id,
                block_soft_max: self.cfg.block_soft_max,
                block_row_max: self.cfg.block_row_max,
                segment_max: self.cfg.segment_max,
                segment_age_max: self.cfg.segment_age_max,
                compression: self.cfg.compression,
                high_water_mark: self.cfg.high_water_mark,
            })?);
        }

        state.writer.as_mut().ok_or(crate::Error::Closed)
    }
}

impl EventStore for Store {
    fn append(&self, event: Event) -> crate::Result<()> {
        let mut state = self.writer.lock().map_err(|_| poisoned())?;

        let writer = self.ensure_writer(&mut state)?;

        match writer.append(event.clone()) {
            Ok(()) => state.tail.push(event),

            // The open segment stays usable
            Err(
                e @ (crate::Error::Backpressure
                | crate::Error::Closed
                | crate::Error::InvalidRequest(_)),
            ) => return Err(e),

            Err(e) => {
                // Writer failure is fatal to the open segment:
                // quarantine and reopen fresh on the next append
                if let Some(mut writer) = state.writer.take() {
                    writer.abandon().ok();
                }
                state.tail.clear();
                return Err(e);
            }
        }

        if state.writer.as_ref().is_some_and(SegmentWriter::should_seal) {
            self.seal_locked(&mut state)?;
        }

        Ok(())
    }

    fn flush(&self) -> crate::Result<()> {
        let mut state = self.writer.lock().map_err(|_| poisoned())?;

        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
        }

        Ok(())
    }

    fn query(
        &self,
        request: &QueryRequest,
        cancel: Option<&StopSignal>,
    ) -> crate::Result<QueryResult> {
        let tail = {
            let state = self.writer.lock().map_err(|_| poisoned())?;
            state.tail.clone()
        };

        executor::execute(&self.catalog, &tail, request, cancel)
    }

    fn metadata(&self, range: &TimeRange) -> crate::Result<ClusterMetadata> {
        let mut namespaces = BTreeSet::new();
        let mut kinds = BTreeSet::new();
        let mut groups = BTreeSet::new();

        let mut earliest: Option<u64> = None;
        let mut latest: Option<u64> = None;
        let mut event_count = 0u64;

        let mut cover = |lo: u64, hi: u64| {
            earliest = Some(earliest.map_or(lo, |e| e.min(lo)));
            latest = Some(latest.map_or(hi, |l| l.max(hi)));
        };

        for segment in self.catalog.query(range)? {
            for value in segment.distinct_values(Dimension::Namespace) {
                namespaces.insert(value.to_owned());
            }
            for value in segment.distinct_values(Dimension::Kind) {
                kinds.insert(value.to_owned());
            }
            for value in segment.distinct_values(Dimension::Group) {
                groups.insert(value.to_owned());
            }

            event_count += segment.meta.event_count;

            cover(
                segment.meta.time_range.min().max(range.min()),
                segment.meta.time_range.max().min(range.max()),
            );
        }

        {
            let state = self.writer.lock().map_err(|_| poisoned())?;

            for event in state.tail.iter().filter(|e| range.contains(e.ts)) {
                namespaces.insert(event.identity.namespace.clone());
                kinds.insert(event.identity.kind.clone());
                groups.insert(event.identity.group.clone());

                event_count += 1;
                cover(event.ts, event.ts);
            }
        }

        Ok(ClusterMetadata {
            namespaces: namespaces.into_iter().collect(),
            kinds: kinds.into_iter().collect(),
            groups: groups.into_iter().collect(),
            earliest,
            latest,
            event_count,
        })
    }

    fn retain(&self) -> crate::Result<RetentionReport> {
        self.catalog
            .retain(&self.cfg.retention, crate::time::unix_timestamp())
    }

    fn maintain(&self) -> crate::Result<()> {
        {
            let mut state = self.writer.lock().map_err(|_| poisoned())?;

            if state.writer.as_ref().is_some_and(SegmentWriter::should_seal) {
                log::debug!("Sealing open segment by age policy");
                self.seal_locked(&mut state)?;
            }
        }

        let policy = &self.cfg.retention;

        if policy.max_age.is_some() || policy.max_total_size.is_some() {
            self.retain()?;
        }

        Ok(())
    }
}

impl Component for Store {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn start(&self) -> crate::Result<()> {
        // Opening happened in `Config::open`; nothing left to do
        Ok(())
    }

    fn stop(&self, _deadline: Duration) -> crate::Result<()> {
        self.flush()?;
        self.seal_active()
    }
}

impl Component for AnyStore {
    fn name(&self) -> &'static str {
        match self {
            Self::Persistent(store) => store.name(),
            Self::Memory(_) => "memory-storage",
        }
    }

    fn start(&self) -> crate::Result<()> {
        match self {
            Self::Persistent(store) => store.start(),
            Self::Memory(_) => Ok(()),
        }
    }

    fn stop(&self, deadline: Duration) -> crate::Result<()> {
        match self {
            Self::Persistent(store) => Component::stop(store, deadline),
            Self::Memory(_) => Ok(()),
        }
    }
}

fn poisoned() -> crate::Error {
    crate::Error::Io(std::io::Error::other("lock is poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ResourceIdentity, Verb};
    use test_log::test;

    fn event(ts: u64, kind: &str, uid: &str) -> Event {
        Event::new(
            ResourceIdentity::builder()
                .version("v1")
                .kind(kind)
                .namespace("default")
                .name(uid)
                .uid(uid)
                .build(),
            ts,
            Verb::Create,
            br#"{"spec":{}}"#.to_vec(),
        )
    }

    #[test]
    fn store_open_segment_is_visible_to_queries() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let store = Config::new(&folder).open()?;

        store.append(event(100, "Pod", "u1"))?;
        store.append(event(110, "Pod", "u2"))?;

        // No seal, no flush: the tail serves the query
        let result = store.query(&QueryRequest::range(0, 200), None)?;
        assert_eq!(2, result.count);

        Ok(())
    }

    #[test]
    fn store_seal_then_query_sees_sealed_and_tail() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let store = Config::new(&folder).open()?;

        store.append(event(100, "Pod", "u1"))?;
        store.seal_active()?;
        store.append(event(200, "Pod", "u2"))?;

        let result = store.query(&QueryRequest::range(0, 300), None)?;
        assert_eq!(2, result.count);
        assert_eq!(1, store.catalog().len()?);

        Ok(())
    }

    #[test]
    fn store_metadata_without_block_io() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let store = Config::new(&folder).open()?;

        store.append(event(100, "Pod", "u1"))?;
        store.append(event(110, "ConfigMap", "u2"))?;
        store.seal_active()?;
        store.append(event(120, "Deployment", "u3"))?;

        let meta = store.metadata(&TimeRange::new(0, 1_000))?;

        assert_eq!(vec!["ConfigMap", "Deployment", "Pod"], meta.kinds);
        assert_eq!(vec!["default"], meta.namespaces);
        assert_eq!(3, meta.event_count);
        assert_eq!(Some(100), meta.earliest);
        assert_eq!(Some(120), meta.latest);

        Ok(())
    }

    #[test]
    fn store_reopen_recovers_sealed_segments() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;

        {
            let store = Config::new(&folder).open()?;
            store.append(event(100, "Pod", "u1"))?;
            store.seal_active()?;
        }

        let store = Config::new(&folder).open()?;
        assert_eq!(1, store.catalog().len()?);

        let result = store.query(&QueryRequest::range(0, 200), None)?;
        assert_eq!(1, result.count);

        Ok(())
    }
}
