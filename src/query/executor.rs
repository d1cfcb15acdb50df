// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    merge::{BoxedStream, Merger, OrderedEvent, Origin, OPEN_SEGMENT_ID},
    Cursor, QueryFilter, QueryRequest, QueryResult,
};
use crate::{
    catalog::Catalog,
    segment::{BlockScan, Segment},
    Event, SegmentId, StopSignal, TimeRange,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
struct ExecStats {
    blocks_decoded: AtomicUsize,
    segments_scanned: AtomicUsize,
    partial: AtomicBool,
}

/// Event stream over one segment's planned blocks
///
/// Applies the residual predicates per event and consults the block
/// bloom filter for exact-name filters before paying for decompression.
/// The cancellation signal is checked at every block boundary.
struct SegmentStream<'a> {
    segment_id: SegmentId,
    scan: BlockScan,
    range: TimeRange,
    filter: &'a QueryFilter,
    cancel: Option<&'a StopSignal>,
    allow_partial: bool,
    stats: &'a ExecStats,
    scanned: bool,
    current: std::vec::IntoIter<OrderedEvent>,
}

impl SegmentStream<'_> {
    fn is_block_level(error: &crate::Error) -> bool {
        matches!(
            error,
            crate::Error::CorruptBlock(..)
                | crate::Error::Decompress(_)
                | crate::Error::Decode(_)
        )
    }
}

impl Iterator for SegmentStream<'_> {
    type Item = crate::Result<OrderedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.current.next() {
                return Some(Ok(item));
            }

            // Block boundary: honor cancellation
            if self.cancel.is_some_and(StopSignal::is_stopped) {
                return Some(Err(crate::Error::Cancelled));
            }

            let (read, raw) = match self.scan.next()? {
                Ok(pair) => pair,
                Err(e) if self.allow_partial && Self::is_block_level(&e) => {
                    log::warn!("Skipping corrupt block in segment {}: {e}", self.segment_id);
                    self.stats.partial.store(true, Ordering::Relaxed);
                    continue;
                }
                Err(e) => return Some(Err(e)),
            };

            // Exact-name filters get a bloom pre-check, sparing the
            // decompression of blocks that cannot match
            if !self.filter.names.is_empty()
                && !self
                    .filter
                    .names
                    .iter()
                    .any(|name| raw.header.bloom.contains(name.as_bytes()))
            {
                continue;
            }

            let block = match raw.decode() {
                Ok(block) => block,
                Err(e) if self.allow_partial && Self::is_block_level(&e) => {
                    log::warn!("Skipping undecodable block in segment {}: {e}", self.segment_id);
                    self.stats.partial.store(true, Ordering::Relaxed);
                    continue;
                }
                Err(e) => return Some(Err(e)),
            };

            self.stats.blocks_decoded.fetch_add(1, Ordering::Relaxed);

            if !self.scanned {
                self.scanned = true;
                self.stats.segments_scanned.fetch_add(1, Ordering::Relaxed);
            }

            let (row_lo, row_hi) = read.rows.map_or((0, u32::MAX), |rows| rows);

            let segment_id = self.segment_id;
            let block_idx = read.entry.block_idx;
            let range = self.range;

            self.current = block
                .events
                .into_vec()
                .into_iter()
                .enumerate()
                .map(|(row, event)| {
                    // NOTE: Rows per block are bounded
                    #[allow(clippy::cast_possible_truncation)]
                    let row = row as u32;

                    OrderedEvent {
                        event,
                        origin: Origin {
                            segment_id,
                            block_idx,
                            row,
                        },
                    }
                })
                .filter(|item| {
                    item.origin.row >= row_lo
                        && item.origin.row <= row_hi
                        && range.contains(item.event.ts)
                        && self.filter.matches(&item.event)
                })
                .collect::<Vec<_>>()
                .into_iter();
        }
    }
}

/// Stream over the in-memory tail of the open segment
fn tail_stream<'a>(
    tail: &[Event],
    range: &TimeRange,
    filter: &'a QueryFilter,
) -> BoxedStream<'a> {
    let items = tail
        .iter()
        .enumerate()
        .filter(|(_, event)| range.contains(event.ts) && filter.matches(event))
        .map(|(row, event)| {
            // NOTE: The tail is bounded by the segment seal thresholds
            #[allow(clippy::cast_possible_truncation)]
            let row = row as u32;

            Ok(OrderedEvent {
                event: event.clone(),
                origin: Origin {
                    segment_id: OPEN_SEGMENT_ID,
                    block_idx: 0,
                    row,
                },
            })
        })
        .collect::<Vec<_>>();

    Box::new(items.into_iter())
}

/// Recovers the full merge-order key of the cursor event.
fn recover_cursor_key(
    segments: &[std::sync::Arc<Segment>],
    tail: &[Event],
    cursor: &Cursor,
) -> crate::Result<(u64, String, u8, Origin)> {
    let origin = Origin {
        segment_id: cursor.segment_id,
        block_idx: cursor.block_idx,
        row: cursor.row,
    };

    let event = if cursor.segment_id == OPEN_SEGMENT_ID {
        tail.get(cursor.row as usize)
            .cloned()
            .ok_or(crate::Error::NotFound)?
    } else {
        let segment = segments
            .iter()
            .find(|s| s.meta.id == cursor.segment_id)
            .ok_or(crate::Error::NotFound)?;

        let block = segment.read_block(cursor.block_idx)?;

        block
            .events
            .get(cursor.row as usize)
            .cloned()
            .ok_or(crate::Error::NotFound)?
    };

    Ok((
        event.ts,
        event.identity.uid.clone(),
        u8::from(event.verb),
        origin,
    ))
}

/// Plans and executes a query over the catalog plus the open-segment
/// tail snapshot.
pub(crate) fn execute(
    catalog: &Catalog,
    tail: &[Event],
    req: &QueryRequest,
    cancel: Option<&StopSignal>,
) -> crate::Result<QueryResult> {
    let started = std::time::Instant::now();

    req.validate()?;

    let all_segments = catalog.segments()?;

    let cursor_key = req
        .cursor
        .as_ref()
        .map(|c| recover_cursor_key(&all_segments, tail, c))
        .transpose()?;

    // Everything below the cursor timestamp was already emitted
    let range = match &cursor_key {
        Some((cursor_ts, ..)) if *cursor_ts > req.end_ts => {
            return Ok(QueryResult {
                execution_time_ms: elapsed_ms(started),
                ..Default::default()
            });
        }
        Some((cursor_ts, ..)) => TimeRange::new(req.start_ts.max(*cursor_ts), req.end_ts),
        None => req.time_range(),
    };

    let segments = catalog.query(&range)?;

    let stats = ExecStats::default();
    let mut segments_skipped = 0;

    let mut streams: Vec<BoxedStream<'_>> = Vec::with_capacity(segments.len() + 1);

    for segment in &segments {
        let scan = segment.scan_blocks(&range, &req.filters)?;

        if scan.planned() == 0 {
            segments_skipped += 1;
            continue;
        }

        streams.push(Box::new(SegmentStream {
            segment_id: segment.meta.id,
            scan,
            range,
            filter: &req.filters,
            cancel,
            allow_partial: req.allow_partial,
            stats: &stats,
            scanned: false,
            current: vec![].into_iter(),
        }));
    }

    streams.push(tail_stream(tail, &range, &req.filters));

    let limit = req.effective_limit();

    let mut events: Vec<Event> = Vec::new();
    let mut last_emitted: Option<(u64, Origin)> = None;
    let mut next_cursor = None;

    let mut merged = Merger::new(streams);

    for item in &mut merged {
        let item = item?;

        if let Some((ts, uid, verb, origin)) = &cursor_key {
            let (its, iuid, iverb, iorigin) = item.order_key();
            if (its, iuid, iverb, iorigin) <= (*ts, uid.as_str(), *verb, *origin) {
                continue;
            }
        }

        if events.len() >= limit {
            // Another event matched, so this page is truncated
            next_cursor = last_emitted.map(|(ts, origin)| Cursor {
                segment_id: origin.segment_id,
                block_idx: origin.block_idx,
                row: origin.row,
                ts,
            });
            break;
        }

        last_emitted = Some((item.event.ts, item.origin));
        events.push(item.event);
    }

    drop(merged);

    Ok(QueryResult {
        count: events.len(),
        events,
        execution_time_ms: elapsed_ms(started),
        segments_scanned: stats.segments_scanned.load(Ordering::Relaxed),
        segments_skipped,
        blocks_decoded: stats.blocks_decoded.load(Ordering::Relaxed),
        cursor: next_cursor,
        partial: stats.partial.load(Ordering::Relaxed),
    })
}

fn elapsed_ms(started: std::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
