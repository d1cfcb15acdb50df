// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Event, SegmentId};
use interval_heap::IntervalHeap as Heap;

/// Sentinel segment id of the open (unsealed) segment tail
pub(crate) const OPEN_SEGMENT_ID: SegmentId = SegmentId::MAX;

/// Physical position of an event, used for cursors and tie-breaks
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct Origin {
    pub segment_id: SegmentId,
    pub block_idx: u32,
    pub row: u32,
}

/// An event tagged with its physical position
#[derive(Clone, Debug)]
pub(crate) struct OrderedEvent {
    pub event: Event,
    pub origin: Origin,
}

impl OrderedEvent {
    /// Total merge order: non-decreasing timestamp, then uid, then
    /// verb order (CREATE < UPDATE < DELETE), then physical position.
    pub(crate) fn order_key(&self) -> (u64, &str, u8, Origin) {
        let (uid, verb) = self.event.tie_break_key();
        (self.event.ts, uid, verb, self.origin)
    }
}

pub(crate) type BoxedStream<'a> = Box<dyn Iterator<Item = crate::Result<OrderedEvent>> + 'a>;

struct HeapItem(usize, OrderedEvent);

impl Eq for HeapItem {}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.1.order_key() == other.1.order_key()
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.1.order_key().cmp(&other.1.order_key())
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges per-segment event streams by timestamp
///
/// Every input stream yields events in non-decreasing timestamp order;
/// the merger interleaves them into one globally ordered stream with
/// deterministic tie-breaks.
pub(crate) struct Merger<'a> {
    iterators: Vec<BoxedStream<'a>>,
    heap: Heap<HeapItem>,
    initialized: bool,
}

impl<'a> Merger<'a> {
    #[must_use]
    pub fn new(iterators: Vec<BoxedStream<'a>>) -> Self {
        let heap = Heap::with_capacity(iterators.len());

        Self {
            iterators,
            heap,
            initialized: false,
        }
    }

    fn initialize(&mut self) -> crate::Result<()> {
        for idx in 0..self.iterators.len() {
            let Some(iterator) = self.iterators.get_mut(idx) else {
                continue;
            };

            if let Some(item) = iterator.next() {
                self.heap.push(HeapItem(idx, item?));
            }
        }

        self.initialized = true;

        Ok(())
    }
}

impl<'a> Iterator for Merger<'a> {
    type Item = crate::Result<OrderedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            fail_iter!(self.initialize());
        }

        let min_item = self.heap.pop_min()?;

        if let Some(iterator) = self.iterators.get_mut(min_item.0) {
            if let Some(next_item) = iterator.next() {
                let next_item = fail_iter!(next_item);
                self.heap.push(HeapItem(min_item.0, next_item));
            }
        }

        Some(Ok(min_item.1))
    }
}
