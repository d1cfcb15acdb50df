// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A block-based, time-ordered event log for Kubernetes resource history.
//!
//! ##### About
//!
//! This crate stores every resource mutation observed in a cluster as an
//! immutable [`Event`] (full snapshot per mutation) and answers bounded
//! time-range queries with predicate filters over group/version/kind/
//! namespace/name.
//!
//! Events are appended to an *open segment* through a [`SegmentWriter`].
//! The writer batches events into compressed blocks (the unit of I/O),
//! builds a per-segment inverted index over kind, namespace and group,
//! and a sparse timestamp index over blocks. Sealing a segment fsyncs it,
//! atomically renames it into the catalog directory and registers it in
//! the [`Catalog`], which governs retention.
//!
//! Queries resolve the time range to a set of sealed segments, intersect
//! posting lists, prune blocks by timestamp and bloom filter, decode the
//! survivors and merge the per-segment streams by timestamp.
//!
//! # Example usage
//!
//! ```
//! use spectre_store::{Config, Event, EventStore, QueryRequest, ResourceIdentity, Verb};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let store = Config::new(&folder).open()?;
//!
//! let identity = ResourceIdentity::builder()
//!     .kind("Pod")
//!     .namespace("default")
//!     .name("web-0")
//!     .uid("5f6ea6a0-9c2f")
//!     .build();
//!
//! store.append(Event::new(identity, 1_700_000_000, Verb::Create, b"{}".to_vec()))?;
//! store.flush()?;
//!
//! let result = store.query(&QueryRequest::range(0, u64::MAX), None)?;
//! assert_eq!(1, result.count);
//! #
//! # Ok::<(), spectre_store::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

#[doc(hidden)]
pub mod block;

#[doc(hidden)]
pub mod bloom;

pub mod catalog;

mod checksum;
mod coding;
mod compression;
mod config;
mod error;
mod event;

#[doc(hidden)]
pub mod file;

pub mod ingest;

mod lifecycle;
mod memory;
mod metadata;

pub mod query;

pub mod segment;

mod status;

#[doc(hidden)]
pub mod stop_signal;

mod store;
mod time;
mod time_range;

#[doc(hidden)]
pub use {
    checksum::Checksum,
    coding::{Decode, DecodeError, Encode, EncodeError},
    segment::id::SegmentId,
};

pub use {
    catalog::{Catalog, RetentionPolicy, RetentionReport},
    compression::CompressionType,
    config::Config,
    error::{Error, Result},
    event::{
        Event, EventId, ResourceIdentity, ResourceIdentityBuilder, Status, StatusSummary,
        UnixTimestamp, Verb,
    },
    ingest::{Pipeline, Pressure},
    lifecycle::{exit_code, Component, Lifecycle},
    memory::MemoryStore,
    metadata::ClusterMetadata,
    query::{status_segments, Cursor, QueryFilter, QueryRequest, QueryResult, StatusSegment},
    segment::{writer::SegmentWriter, Segment},
    status::classify,
    stop_signal::{StopCause, StopSignal},
    store::{AnyStore, EventStore, Store},
    time_range::TimeRange,
};
