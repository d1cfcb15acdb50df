// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Ingestion pipeline between the watch source and the segment writer.
//!
//! Stages, in order: dedup (bounded LRU over (uid, verb, ts) triples),
//! enrich (lift `involvedObject.uid` out of Kubernetes Event payloads),
//! classify (table-driven status derivation) and buffer (bounded queue
//! drained by the writer worker).
//!
//! Backpressure never drops events: above the soft watermark the
//! pipeline reports [`Pressure::Slow`] so the watch adapter stops
//! consuming; at the hard limit it shifts to shed mode, retaining
//! every CREATE/DELETE and coalescing consecutive UPDATEs per uid.

mod buffer;
mod dedup;

pub use buffer::{IngestBuffer, Pressure};
pub use dedup::DedupWindow;

use crate::{
    lifecycle::Component,
    store::{AnyStore, EventStore},
    Event, StopCause, StopSignal,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

/// How long the writer worker waits for events before running
/// time-based maintenance (age seal, retention)
const IDLE_TICK: Duration = Duration::from_millis(100);

/// Accepts watch events and hands them to the segment writer
///
/// Cheap to share behind an [`Arc`]; the single background worker is
/// started and stopped through the [`Component`] lifecycle.
pub struct Pipeline {
    dedup: DedupWindow,
    buffer: Arc<IngestBuffer>,
    store: Arc<AnyStore>,
    stop: StopSignal,
    started: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Creates a pipeline feeding the given store.
    #[must_use]
    pub fn new(store: Arc<AnyStore>, dedup_window: usize, soft_limit: usize, hard_limit: usize) -> Self {
        Self {
            dedup: DedupWindow::new(dedup_window),
            buffer: Arc::new(IngestBuffer::new(soft_limit, hard_limit)),
            store,
            stop: StopSignal::default(),
            started: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Offers one watch event to the pipeline.
    ///
    /// Returns the current buffer pressure; callers are contractually
    /// required to slow down on [`Pressure::Slow`]. Duplicates within
    /// the dedup window are silently collapsed.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::Error::Closed`] after shutdown started.
    pub fn offer(&self, mut event: Event) -> crate::Result<Pressure> {
        if self.stop.is_stopped() {
            return Err(crate::Error::Closed);
        }

        if self.dedup.seen(&event) {
            log::trace!("Dropping duplicate event {}", event.id());
            return Ok(self.buffer.pressure());
        }

        enrich(&mut event);

        event.status = crate::status::classify(&event.identity.kind, &event.payload);

        self.buffer.push(event)?;

        Ok(self.buffer.pressure())
    }

    /// Current buffer pressure.
    #[must_use]
    pub fn pressure(&self) -> Pressure {
        self.buffer.pressure()
    }

    /// Number of events waiting for the writer.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.buffer.len()
    }
}

/// Lifts `involvedObject.uid` out of Kubernetes Event payloads into
/// the identity, so timeline queries can correlate by object uid.
fn enrich(event: &mut Event) {
    if event.identity.kind != "Event" || event.identity.involved_object_uid.is_some() {
        return;
    }

    let Ok(doc) = serde_json::from_slice::<serde_json::Value>(&event.payload) else {
        return;
    };

    if let Some(uid) = doc
        .pointer("/involvedObject/uid")
        .and_then(serde_json::Value::as_str)
    {
        event.identity.involved_object_uid = Some(uid.into());
    }
}

fn worker_loop(store: &AnyStore, buffer: &IngestBuffer, stop: &StopSignal) {
    loop {
        match buffer.pop_timeout(IDLE_TICK) {
            Some(event) => loop {
                match store.append(event.clone()) {
                    Ok(()) => break,

                    Err(crate::Error::Backpressure) => {
                        // Writer wants a drain; flush and retry
                        if let Err(e) = store.flush() {
                            log::error!("Flush after backpressure failed: {e}");
                        }
                        std::thread::sleep(Duration::from_millis(10));
                    }

                    Err(e) => {
                        log::error!("Dropping event after append failure: {e}");
                        break;
                    }
                }
            },

            None => {
                if stop.is_stopped() && buffer.is_empty() {
                    break;
                }

                if let Err(e) = store.maintain() {
                    log::error!("Store maintenance failed: {e}");
                }
            }
        }
    }

    log::debug!("Ingest worker drained and stopped");
}

impl Component for Pipeline {
    fn name(&self) -> &'static str {
        "ingest-pipeline"
    }

    fn start(&self) -> crate::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let store = Arc::clone(&self.store);
        let buffer = Arc::clone(&self.buffer);
        let stop = self.stop.clone();

        let handle = std::thread::Builder::new()
            .name("spectre-ingest".into())
            .spawn(move || worker_loop(&store, &buffer, &stop))?;

        *self.worker.lock().map_err(|_| poisoned())? = Some(handle);

        Ok(())
    }

    fn stop(&self, deadline: Duration) -> crate::Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        // Stop accepting, then let the worker drain the backlog
        self.stop.send_with(StopCause::Shutdown);
        self.buffer.close();

        let Some(handle) = self.worker.lock().map_err(|_| poisoned())?.take() else {
            return Ok(());
        };

        let started = std::time::Instant::now();

        while !handle.is_finished() {
            if started.elapsed() > deadline {
                log::error!(
                    "Ingest worker missed the shutdown deadline, {} events abandoned",
                    self.buffer.len(),
                );
                return Ok(());
            }

            std::thread::sleep(Duration::from_millis(10));
        }

        handle.join().ok();

        Ok(())
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

    #[test]
    fn enrich_lifts_involved_object_uid() {
        let mut event = Event::new(
            ResourceIdentity::builder()
                .version("v1")
                .kind("Event")
                .namespace("default")
                .name("pod-failed.1")
                .uid("evt-1")
                .build(),
            100,
            Verb::Create,
            br#"{"type":"Warning","involvedObject":{"kind":"Pod","uid":"pod-uid-9"}}"#.to_vec(),
        );

        enrich(&mut event);

        assert_eq!(Some("pod-uid-9"), event.identity.involved_object_uid.as_deref());
    }

    #[test]
    fn enrich_ignores_other_kinds() {
        let mut event = Event::new(
            ResourceIdentity::builder()
                .version("v1")
                .kind("Pod")
                .namespace("default")
                .name("p")
                .uid("u")
                .build(),
            100,
            Verb::Create,
            br#"{"involvedObject":{"uid":"x"}}"#.to_vec(),
        );

        enrich(&mut event);

        assert_eq!(None, event.identity.involved_object_uid);
    }
}
