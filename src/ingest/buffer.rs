// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Event, Verb};
use rustc_hash::FxHashMap;
use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::Duration,
};

/// Load level of the ingestion buffer
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Pressure {
    /// Plenty of room
    Ok,

    /// Above the soft watermark; the watch adapter should slow down.
    /// Nothing is dropped.
    Slow,

    /// At the hard limit; UPDATEs for the same uid are coalesced to
    /// the latest until the buffer drains below the soft watermark.
    /// Every CREATE and DELETE is retained.
    Shed,
}

#[derive(Default)]
struct BufferInner {
    queue: VecDeque<Event>,

    /// Absolute sequence number of the queue front
    head_seq: u64,

    /// uid → absolute sequence of its pending UPDATE, for coalescing
    update_slots: FxHashMap<String, u64>,

    shedding: bool,
    closed: bool,
}

impl BufferInner {
    fn seq_of_back(&self) -> u64 {
        self.head_seq + self.queue.len() as u64 - 1
    }
}

/// Bounded single-producer-single-consumer event buffer
///
/// The producer never blocks and never drops: above the hard limit it
/// shifts to shed mode (UPDATE coalescing) instead.
pub struct IngestBuffer {
    inner: Mutex<BufferInner>,
    not_empty: Condvar,
    soft_limit: usize,
    hard_limit: usize,
}

impl IngestBuffer {
    /// Creates a buffer with the given watermarks.
    ///
    /// # Panics
    ///
    /// Panics if `soft_limit` is zero or above `hard_limit`.
    #[must_use]
    pub fn new(soft_limit: usize, hard_limit: usize) -> Self {
        assert!(soft_limit > 0);
        assert!(soft_limit <= hard_limit);

        Self {
            inner: Mutex::new(BufferInner::default()),
            not_empty: Condvar::new(),
            soft_limit,
            hard_limit,
        }
    }

    /// Enqueues an event.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::Error::Closed`] once the buffer was closed.
    pub fn push(&self, event: Event) -> crate::Result<()> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;

        if inner.closed {
            return Err(crate::Error::Closed);
        }

        // Shed mode exits once the backlog drained below the soft watermark
        if inner.shedding && inner.queue.len() < self.soft_limit {
            log::info!("Ingest buffer drained, leaving shed mode");
            inner.shedding = false;
        }

        if !inner.shedding && inner.queue.len() >= self.hard_limit {
            log::warn!(
                "Ingest buffer hit its hard limit ({}), entering shed mode",
                self.hard_limit,
            );
            inner.shedding = true;
        }

        if inner.shedding && event.verb == Verb::Update {
            // Coalesce into the pending UPDATE of the same uid
            if let Some(&seq) = inner.update_slots.get(&event.identity.uid) {
                let idx = (seq - inner.head_seq) as usize;

                if let Some(slot) = inner.queue.get_mut(idx) {
                    *slot = event;
                    return Ok(());
                }
            }
        }

        if event.verb == Verb::Update {
            let uid = event.identity.uid.clone();
            inner.queue.push_back(event);

            let seq = inner.seq_of_back();
            inner.update_slots.insert(uid, seq);
        } else {
            inner.queue.push_back(event);
        }

        self.not_empty.notify_one();

        Ok(())
    }

    /// Dequeues the oldest event, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout, or when the buffer is closed and
    /// fully drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Event> {
        let mut inner = self.inner.lock().ok()?;

        loop {
            if let Some(event) = inner.queue.pop_front() {
                let seq = inner.head_seq;
                inner.head_seq += 1;

                if event.verb == Verb::Update
                    && inner.update_slots.get(&event.identity.uid) == Some(&seq)
                {
                    inner.update_slots.remove(&event.identity.uid);
                }

                return Some(event);
            }

            if inner.closed {
                return None;
            }

            let (guard, wait) = self.not_empty.wait_timeout(inner, timeout).ok()?;
            inner = guard;

            if wait.timed_out() {
                return None;
            }
        }
    }

    /// Current load level.
    #[must_use]
    pub fn pressure(&self) -> Pressure {
        let Ok(inner) = self.inner.lock() else {
            return Pressure::Ok;
        };

        if inner.shedding {
            Pressure::Shed
        } else if inner.queue.len() >= self.soft_limit {
            Pressure::Slow
        } else {
            Pressure::Ok
        }
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.queue.len()).unwrap_or(0)
    }

    /// Returns `true` if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the buffer; producers fail afterwards, the consumer
    /// drains the remainder.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }

        self.not_empty.notify_all();
    }
}

fn poisoned() -> crate::Error {
    crate::Error::Io(std::io::Error::other("lock is poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceIdentity;
    use test_log::test;

    fn event(uid: &str, ts: u64, verb: Verb) -> Event {
        Event::new(
            ResourceIdentity::builder()
                .version("v1")
                .kind("Pod")
                .namespace("default")
                .name(uid)
                .uid(uid)
                .build(),
            ts,
            verb,
            vec![],
        )
    }

    #[test]
    fn buffer_fifo() {
        let buffer = IngestBuffer::new(4, 8);

        buffer.push(event("a", 1, Verb::Create)).ok();
        buffer.push(event("b", 2, Verb::Create)).ok();

        assert_eq!(
            Some("a"),
            buffer
                .pop_timeout(Duration::ZERO)
                .map(|e| e.identity.uid)
                .as_deref()
        );
        assert_eq!(
            Some("b"),
            buffer
                .pop_timeout(Duration::ZERO)
                .map(|e| e.identity.uid)
                .as_deref()
        );
        assert!(buffer.pop_timeout(Duration::ZERO).is_none());
    }

    #[test]
    fn buffer_pressure_levels() {
        let buffer = IngestBuffer::new(2, 4);
        assert_eq!(Pressure::Ok, buffer.pressure());

        buffer.push(event("a", 1, Verb::Create)).ok();
        buffer.push(event("b", 2, Verb::Create)).ok();
        assert_eq!(Pressure::Slow, buffer.pressure());

        buffer.push(event("c", 3, Verb::Create)).ok();
        buffer.push(event("d", 4, Verb::Create)).ok();

        // The hard limit is observed by the next push
        buffer.push(event("e", 5, Verb::Create)).ok();
        assert_eq!(Pressure::Shed, buffer.pressure());
    }

    #[test]
    fn buffer_shed_coalesces_updates() {
        let buffer = IngestBuffer::new(2, 4);

        for i in 0..4u64 {
            buffer.push(event("filler", i, Verb::Create)).ok();
        }

        // Trip into shed mode
        buffer.push(event("u1", 10, Verb::Update)).ok();
        assert_eq!(Pressure::Shed, buffer.pressure());

        let len_before = buffer.len();

        // These coalesce into the pending u1 UPDATE
        buffer.push(event("u1", 11, Verb::Update)).ok();
        buffer.push(event("u1", 12, Verb::Update)).ok();
        assert_eq!(len_before, buffer.len());

        // CREATE and DELETE are always retained
        buffer.push(event("u2", 13, Verb::Create)).ok();
        buffer.push(event("u1", 14, Verb::Delete)).ok();
        assert_eq!(len_before + 2, buffer.len());

        // Drain; the surviving u1 UPDATE is the latest
        let mut updates = vec![];
        while let Some(e) = buffer.pop_timeout(Duration::ZERO) {
            if e.verb == Verb::Update {
                updates.push(e.ts);
            }
        }
        assert_eq!(vec![12], updates);
    }

    #[test]
    fn buffer_shed_exits_below_soft() {
        let buffer = IngestBuffer::new(2, 4);

        for i in 0..5u64 {
            buffer.push(event("filler", i, Verb::Create)).ok();
        }
        assert_eq!(Pressure::Shed, buffer.pressure());

        while buffer.pop_timeout(Duration::ZERO).is_some() {}

        // Next push notices the drained backlog
        buffer.push(event("x", 100, Verb::Create)).ok();
        assert_eq!(Pressure::Ok, buffer.pressure());
    }

    #[test]
    fn buffer_close_stops_producers_drains_consumer() {
        let buffer = IngestBuffer::new(2, 4);

        buffer.push(event("a", 1, Verb::Create)).ok();
        buffer.close();

        assert!(matches!(
            buffer.push(event("b", 2, Verb::Create)),
            Err(crate::Error::Closed)
        ));

        assert!(buffer.pop_timeout(Duration::ZERO).is_some());
        assert!(buffer.pop_timeout(Duration::ZERO).is_none());
    }
}
