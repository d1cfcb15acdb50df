// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    event::{Status, UnixTimestamp},
    Event, Verb,
};
use serde::{Deserialize, Serialize};

/// A derived `[start, end)` status interval of one resource
///
/// Computed from consecutive events of the resource; the interval
/// carries the status derived at its starting event. The last interval
/// of a resource that was not deleted is open-ended.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StatusSegment {
    /// Uid of the resource
    pub uid: String,

    /// Start of the interval (inclusive)
    pub start: UnixTimestamp,

    /// End of the interval (exclusive); `None` while the resource
    /// still exists in this state
    pub end: Option<UnixTimestamp>,

    /// Status during the interval
    pub status: Status,

    /// Message of the event that started the interval
    pub message: String,
}

/// Computes per-resource status intervals from a timestamp-ordered
/// event stream (the shape the timeline UI renders).
#[must_use]
pub fn status_segments(events: &[Event]) -> Vec<StatusSegment> {
    let mut out: Vec<StatusSegment> = Vec::new();

    // uid → index of the open interval in `out`
    let mut open: rustc_hash::FxHashMap<&str, usize> = rustc_hash::FxHashMap::default();

    for event in events {
        let uid = event.identity.uid.as_str();

        if let Some(idx) = open.remove(uid) {
            if let Some(interval) = out.get_mut(idx) {
                interval.end = Some(event.ts);
            }
        }

        if event.verb != Verb::Delete {
            open.insert(uid, out.len());

            out.push(StatusSegment {
                uid: uid.to_owned(),
                start: event.ts,
                end: None,
                status: event.status.status,
                message: event.status.message.clone(),
            });
        }
    }

    out
}
