// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    catalog::{RetentionPolicy, RetentionReport},
    metadata::ClusterMetadata,
    query::{Cursor, QueryRequest, QueryResult},
    store::EventStore,
    Event, StopSignal, TimeRange,
};
use std::{collections::BTreeSet, sync::RwLock};

/// In-memory event store for demos and tests
///
/// Keeps every event in a timestamp-ordered vector and answers queries
/// by scanning it. Interchangeable with the file-backed store behind
/// [`crate::AnyStore`]. Cursors stay valid as long as no appends
/// happen between pages.
#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<Vec<Event>>,
    retention: RetentionPolicy,
}

impl MemoryStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty in-memory store with a retention policy.
    #[must_use]
    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            retention,
        }
    }

    /// Number of stored events.
    pub fn len(&self) -> crate::Result<usize> {
        Ok(self.events.read().map_err(|_| poisoned())?.len())
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> crate::Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn order_key(event: &Event) -> (u64, &str, u8) {
    (event.ts, event.identity.uid.as_str(), u8::from(event.verb))
}

impl EventStore for MemoryStore {
    fn append(&self, event: Event) -> crate::Result<()> {
        let mut events = self.events.write().map_err(|_| poisoned())?;

        let (ts, uid, verb) = (event.ts, event.identity.uid.clone(), u8::from(event.verb));
        let key = (ts, uid.as_str(), verb);

        let idx = events.partition_point(|e| order_key(e) < key);

        // Identical (identity, ts, verb) collapses to one
        if events.get(idx).is_some_and(|e| order_key(e) == key) {
            return Ok(());
        }

        events.insert(idx, event);

        Ok(())
    }

    fn flush(&self) -> crate::Result<()> {
        Ok(())
    }

    fn query(
        &self,
        request: &QueryRequest,
        cancel: Option<&StopSignal>,
    ) -> crate::Result<QueryResult> {
        let started = std::time::Instant::now();

        request.validate()?;

        if cancel.is_some_and(StopSignal::is_stopped) {
            return Err(crate::Error::Cancelled);
        }

        let range = request.time_range();
        let limit = request.effective_limit();
        let skip_to = request.cursor.map(|c| c.row as usize + 1).unwrap_or(0);

        let events = self.events.read().map_err(|_| poisoned())?;

        let mut out = Vec::new();
        let mut next_cursor = None;
        let mut last_row = 0usize;

        for (row, event) in events.iter().enumerate().skip(skip_to) {
            if !range.contains(event.ts) || !request.filters.matches(event) {
                continue;
            }

            if out.len() >= limit {
                // NOTE: Row index fits into u32 for any in-memory dataset
                #[allow(clippy::cast_possible_truncation)]
                let cursor = Cursor {
                    segment_id: 0,
                    block_idx: 0,
                    row: last_row as u32,
                    ts: events.get(last_row).map_or(0, |e| e.ts),
                };

                next_cursor = Some(cursor);
                break;
            }

            last_row = row;
            out.push(event.clone());
        }

        Ok(QueryResult {
            count: out.len(),
            events: out,
            execution_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            segments_scanned: 0,
            segments_skipped: 0,
            blocks_decoded: 0,
            cursor: next_cursor,
            partial: false,
        })
    }

    fn metadata(&self, range: &TimeRange) -> crate::Result<ClusterMetadata> {
        let events = self.events.read().map_err(|_| poisoned())?;

        let mut namespaces = BTreeSet::new();
        let mut kinds = BTreeSet::new();
        let mut groups = BTreeSet::new();

        let mut earliest = None;
        let mut latest = None;
        let mut event_count = 0u64;

        for event in events.iter().filter(|e| range.contains(e.ts)) {
            namespaces.insert(event.identity.namespace.clone());
            kinds.insert(event.identity.kind.clone());
            groups.insert(event.identity.group.clone());

            event_count += 1;
            earliest = Some(earliest.map_or(event.ts, |e: u64| e.min(event.ts)));
            latest = Some(latest.map_or(event.ts, |l: u64| l.max(event.ts)));
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
        let mut events = self.events.write().map_err(|_| poisoned())?;

        let now = crate::time::unix_timestamp();

        if let Some(max_age) = self.retention.max_age {
            events.retain(|e| now.saturating_sub(e.ts) <= max_age.as_secs());
        }

        if let Some(max_size) = self.retention.max_total_size {
            let mut total: u64 = events.iter().map(|e| e.size() as u64).sum();

            while total > max_size && !events.is_empty() {
                let removed = events.remove(0);
                total = total.saturating_sub(removed.size() as u64);
            }
        }

        Ok(RetentionReport {
            deleted: vec![],
            kept_referenced: 0,
            remaining_size: events.iter().map(|e| e.size() as u64).sum(),
        })
    }

    fn maintain(&self) -> crate::Result<()> {
        if self.retention.max_age.is_some() || self.retention.max_total_size.is_some() {
            self.retain()?;
        }

        Ok(())
    }
}

fn poisoned() -> crate::Error {
    crate::Error::Io(std::io::Error::other("lock is poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{QueryFilter, ResourceIdentity, Verb};
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
            vec![],
        )
    }

    #[test]
    fn memory_store_orders_and_filters() -> crate::Result<()> {
        let store = MemoryStore::new();

        store.append(event(300, "Pod", "c"))?;
        store.append(event(100, "Pod", "a"))?;
        store.append(event(200, "ConfigMap", "b"))?;

        let result = store.query(&QueryRequest::range(0, 1_000), None)?;
        assert_eq!(vec![100, 200, 300], result.events.iter().map(|e| e.ts).collect::<Vec<_>>());

        let filtered = store.query(
            &QueryRequest::range(0, 1_000).with_filters(QueryFilter {
                kinds: vec!["Pod".into()],
                ..Default::default()
            }),
            None,
        )?;
        assert_eq!(2, filtered.count);

        Ok(())
    }

    #[test]
    fn memory_store_collapses_duplicates() -> crate::Result<()> {
        let store = MemoryStore::new();

        store.append(event(100, "Pod", "a"))?;
        store.append(event(100, "Pod", "a"))?;

        assert_eq!(1, store.len()?);

        Ok(())
    }

    #[test]
    fn memory_store_pagination() -> crate::Result<()> {
        let store = MemoryStore::new();

        for i in 0..10u64 {
            store.append(event(i, "Pod", &format!("u{i}")))?;
        }

        let page1 = store.query(&QueryRequest::range(0, 100).with_limit(4), None)?;
        assert_eq!(4, page1.count);

        let cursor = page1.cursor.expect("should be truncated");

        let page2 = store.query(
            &QueryRequest::range(0, 100).with_limit(100).with_cursor(cursor),
            None,
        )?;
        assert_eq!(6, page2.count);

        Ok(())
    }
}
