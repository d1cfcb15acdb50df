// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{event::UnixTimestamp, CompressionType, SegmentId, TimeRange};
use std::path::PathBuf;

/// Descriptor of a sealed segment
///
/// Footer-derived fields are populated when the segment is opened;
/// the catalog journal only persists id, time range and size.
#[derive(Clone, Debug)]
pub struct SegmentMeta {
    /// Segment id
    pub id: SegmentId,

    /// Path of the segment file
    pub path: PathBuf,

    /// Minimum and maximum event timestamp across all blocks
    pub time_range: TimeRange,

    /// Number of events
    pub event_count: u64,

    /// Number of blocks
    pub block_count: u32,

    /// On-disk size in bytes
    pub file_size: u64,

    /// Compression used for block bodies
    pub compression: CompressionType,

    /// Unix timestamp of the seal
    pub seal_time: UnixTimestamp,
}
