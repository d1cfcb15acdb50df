// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Query planning and execution.
//!
//! A query resolves its time range to a set of sealed segments through
//! the catalog, intersects per-segment posting lists, prunes blocks via
//! the sparse index and per-block bloom filters, decodes the survivors
//! and merges the per-segment streams by timestamp.

pub(crate) mod executor;
pub(crate) mod merge;
mod timeline;

pub use timeline::{status_segments, StatusSegment};

use crate::{event::UnixTimestamp, Event, SegmentId, TimeRange};
use serde::{Deserialize, Serialize};

/// Default result limit
pub const DEFAULT_LIMIT: usize = 1_000;

/// Hard cap on the result limit
pub const MAX_LIMIT: usize = 100_000;

/// Hard cap on values per filter dimension
pub const MAX_FILTER_VALUES: usize = 256;

/// Predicate filters of a query
///
/// The list dimensions (groups, versions, kinds, namespaces, names)
/// are OR within a dimension and AND across dimensions; an empty list
/// matches everything. `names` matches exactly (and is bloom-checked
/// per block); `name_contains` is a residual substring predicate.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// API groups to match
    pub groups: Vec<String>,

    /// API versions to match
    pub versions: Vec<String>,

    /// Kinds to match
    pub kinds: Vec<String>,

    /// Namespaces to match
    pub namespaces: Vec<String>,

    /// Exact resource names to match
    pub names: Vec<String>,

    /// Substring of the resource name to match
    pub name_contains: Option<String>,

    /// Exact uid to match
    pub uid: Option<String>,
}

impl QueryFilter {
    /// Returns `true` if no predicate is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
            && self.versions.is_empty()
            && self.kinds.is_empty()
            && self.namespaces.is_empty()
            && self.names.is_empty()
            && self.name_contains.is_none()
            && self.uid.is_none()
    }

    /// Full predicate, applied to every decoded event.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        let identity = &event.identity;

        let list_match =
            |values: &[String], field: &str| values.is_empty() || values.iter().any(|v| v == field);

        list_match(&self.groups, &identity.group)
            && list_match(&self.versions, &identity.version)
            && list_match(&self.kinds, &identity.kind)
            && list_match(&self.namespaces, &identity.namespace)
            && list_match(&self.names, &identity.name)
            && self
                .name_contains
                .as_ref()
                .is_none_or(|needle| identity.name.contains(needle))
            && self.uid.as_ref().is_none_or(|uid| {
                identity.uid == *uid
                    || identity.involved_object_uid.as_deref() == Some(uid.as_str())
            })
    }
}

/// Resumable pagination cursor
///
/// Identifies the last emitted event by its physical position; the
/// next page starts right after it. Fails with
/// [`crate::Error::NotFound`] if the segment was deleted in between.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Segment of the last emitted event
    pub segment_id: SegmentId,

    /// Block of the last emitted event
    pub block_idx: u32,

    /// Row of the last emitted event
    pub row: u32,

    /// Timestamp of the last emitted event
    pub ts: UnixTimestamp,
}

/// A bounded time-range query with predicate filters
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Start of the queried range (inclusive)
    pub start_ts: UnixTimestamp,

    /// End of the queried range (inclusive)
    pub end_ts: UnixTimestamp,

    /// Predicate filters
    pub filters: QueryFilter,

    /// Maximum number of events to return
    /// (defaults to [`DEFAULT_LIMIT`], capped at [`MAX_LIMIT`])
    pub limit: Option<usize>,

    /// Resume position of a previous query
    pub cursor: Option<Cursor>,

    /// Opt-in to partial results: block-level corruption skips the
    /// block and marks the result partial instead of failing
    pub allow_partial: bool,
}

impl QueryRequest {
    /// Creates a request for everything in `[start_ts, end_ts]`.
    #[must_use]
    pub fn range(start_ts: UnixTimestamp, end_ts: UnixTimestamp) -> Self {
        Self {
            start_ts,
            end_ts,
            ..Default::default()
        }
    }

    /// Sets the predicate filters.
    #[must_use]
    pub fn with_filters(mut self, filters: QueryFilter) -> Self {
        self.filters = filters;
        self
    }

    /// Sets the result limit.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Resumes after a cursor.
    #[must_use]
    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Effective limit after defaulting and capping.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }

    /// Validates range and filter bounds.
    pub fn validate(&self) -> crate::Result<()> {
        if self.start_ts > self.end_ts {
            return Err(crate::Error::InvalidRequest("start_ts must be <= end_ts"));
        }

        if self.limit == Some(0) {
            return Err(crate::Error::InvalidRequest("limit must be > 0"));
        }

        for values in [
            &self.filters.groups,
            &self.filters.versions,
            &self.filters.kinds,
            &self.filters.namespaces,
            &self.filters.names,
        ] {
            if values.len() > MAX_FILTER_VALUES {
                return Err(crate::Error::InvalidRequest("oversized filter"));
            }
        }

        Ok(())
    }

    /// The queried time range.
    #[must_use]
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.start_ts, self.end_ts)
    }
}

/// Result of a query
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Matching events, ordered by timestamp with deterministic
    /// tie-breaks
    pub events: Vec<Event>,

    /// Number of returned events
    pub count: usize,

    /// Wall-clock execution time
    pub execution_time_ms: u64,

    /// Segments that had at least one block decoded
    pub segments_scanned: usize,

    /// Segments pruned without any block I/O
    pub segments_skipped: usize,

    /// Blocks whose bodies were decompressed and parsed
    pub blocks_decoded: usize,

    /// Position to resume from, when the limit truncated the result
    pub cursor: Option<Cursor>,

    /// `true` if corrupt blocks were skipped (only with
    /// [`QueryRequest::allow_partial`])
    pub partial: bool,
}
