// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::event::UnixTimestamp;
use serde::{Deserialize, Serialize};

/// What the cluster looked like within a time range
///
/// Served from segment metadata and resident indices only - answering
/// this costs no block I/O. Bounds and counts are segment-granular:
/// a segment partially overlapping the range contributes all of its
/// values.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    /// Distinct namespaces observed, sorted
    pub namespaces: Vec<String>,

    /// Distinct kinds observed, sorted
    pub kinds: Vec<String>,

    /// Distinct API groups observed, sorted
    pub groups: Vec<String>,

    /// Timestamp of the earliest covered event
    pub earliest: Option<UnixTimestamp>,

    /// Timestamp of the latest covered event
    pub latest: Option<UnixTimestamp>,

    /// Total number of events
    pub event_count: u64,
}
