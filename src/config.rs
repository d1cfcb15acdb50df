// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    catalog::RetentionPolicy, ingest::Pipeline, store::AnyStore, CompressionType, Store,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Store configuration, built through the typical builder pattern
///
/// ```
/// use spectre_store::Config;
/// # let folder = tempfile::tempdir()?;
///
/// let store = Config::new(&folder)
///     .segment_size(64 * 1_024 * 1_024)
///     .open()?;
/// #
/// # Ok::<(), spectre_store::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Catalog directory
    pub(crate) folder: PathBuf,

    /// Close the current block when its uncompressed size crosses this
    pub(crate) block_soft_max: u32,

    /// Close the current block when its event count crosses this
    pub(crate) block_row_max: u32,

    /// Seal the open segment when its on-disk size crosses this
    pub(crate) segment_max: u64,

    /// Seal the open segment when this much time passed since its
    /// first append
    pub(crate) segment_age_max: Duration,

    /// Compression for block bodies
    pub(crate) compression: CompressionType,

    /// Retention policy applied by [`crate::EventStore::retain`]
    pub(crate) retention: RetentionPolicy,

    /// Capacity of the ingest dedup window (recent (uid, verb, ts)
    /// triples)
    pub(crate) dedup_window: usize,

    /// Soft watermark of the ingest buffer (events)
    pub(crate) buffer_soft_limit: usize,

    /// Hard limit of the ingest buffer (events)
    pub(crate) buffer_hard_limit: usize,

    /// Writer backpressure threshold (pending uncompressed bytes)
    pub(crate) high_water_mark: usize,
}

impl Config {
    /// Creates a config for the given catalog directory with default
    /// thresholds.
    pub fn new<P: AsRef<Path>>(folder: P) -> Self {
        Self {
            folder: folder.as_ref().into(),
            block_soft_max: /* 1 MiB */ 1_024 * 1_024,
            block_row_max: 4_096,
            segment_max: /* 128 MiB */ 128 * 1_024 * 1_024,
            segment_age_max: /* 1 hour */ Duration::from_secs(3_600),
            compression: CompressionType::Lz4,
            retention: RetentionPolicy::default(),
            dedup_window: 16_384,
            buffer_soft_limit: 8_192,
            buffer_hard_limit: 32_768,
            high_water_mark: /* 8 MiB */ 8 * 1_024 * 1_024,
        }
    }

    /// Sets the uncompressed block size threshold.
    #[must_use]
    pub fn block_size(mut self, bytes: u32) -> Self {
        self.block_soft_max = bytes;
        self
    }

    /// Sets the block row count threshold.
    #[must_use]
    pub fn block_rows(mut self, rows: u32) -> Self {
        self.block_row_max = rows;
        self
    }

    /// Sets the segment size seal threshold.
    #[must_use]
    pub fn segment_size(mut self, bytes: u64) -> Self {
        self.segment_max = bytes;
        self
    }

    /// Sets the segment age seal threshold.
    #[must_use]
    pub fn segment_age(mut self, age: Duration) -> Self {
        self.segment_age_max = age;
        self
    }

    /// Sets the block body compression.
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the retention policy.
    #[must_use]
    pub fn retention(mut self, policy: RetentionPolicy) -> Self {
        self.retention = policy;
        self
    }

    /// Sets the dedup window capacity.
    #[must_use]
    pub fn dedup_window(mut self, capacity: usize) -> Self {
        self.dedup_window = capacity;
        self
    }

    /// Sets the ingest buffer watermarks.
    #[must_use]
    pub fn buffer_limits(mut self, soft: usize, hard: usize) -> Self {
        self.buffer_soft_limit = soft;
        self.buffer_hard_limit = hard;
        self
    }

    /// Opens (or recovers) the file-backed store.
    pub fn open(self) -> crate::Result<Store> {
        Store::open(self)
    }

    /// Opens the store and wires an ingestion pipeline in front of it.
    pub fn open_with_pipeline(self) -> crate::Result<(Arc<AnyStore>, Arc<Pipeline>)> {
        let dedup_window = self.dedup_window;
        let soft = self.buffer_soft_limit;
        let hard = self.buffer_hard_limit;

        let store = Arc::new(AnyStore::from(self.open()?));
        let pipeline = Arc::new(Pipeline::new(Arc::clone(&store), dedup_window, soft, hard));

        Ok((store, pipeline))
    }
}
