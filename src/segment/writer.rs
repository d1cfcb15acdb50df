// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    inverted_index::{Builder as InvertedIndexBuilder, Dimension},
    meta::SegmentMeta,
    sparse_index::{SparseEntry, SparseIndex},
    trailer::{Trailer, TRAILER_LEN},
};
use crate::{
    block::Block,
    coding::Encode,
    file::{fsync_directory, segment_file_name, BAD_SUFFIX, FORMAT_VERSION, MAGIC_BYTES, TMP_SUFFIX},
    Checksum, CompressionType, Event, SegmentId, TimeRange,
};
use byteorder::{LittleEndian, WriteBytesExt};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    time::{Duration, Instant},
};

/// Serialized size of the segment file header
pub const SEGMENT_HEADER_LEN: usize = 8;

/// Construction parameters of a segment writer
#[derive(Debug)]
pub struct Options {
    /// Catalog directory the sealed file is renamed into
    pub folder: PathBuf,

    /// Id of the segment being written
    pub segment_id: SegmentId,

    /// Close the current block when its uncompressed size crosses this
    pub block_soft_max: u32,

    /// Close the current block when its event count crosses this
    pub block_row_max: u32,

    /// Seal the segment when the on-disk size crosses this
    pub segment_max: u64,

    /// Seal the segment when this much time passed since the first append
    pub segment_age_max: Duration,

    /// Compression for block bodies
    pub compression: CompressionType,

    /// Appends fail with backpressure while the pending
    /// block buffer holds more bytes than this
    pub high_water_mark: usize,
}

/// Streams events into blocks and writes them to an open segment file
///
/// The writer owns the open segment exclusively until [`SegmentWriter::seal`].
/// While appending it maintains the per-segment posting lists and the
/// sparse timestamp index, which are written ahead of the footer on seal.
///
/// The open file carries a `.tmp` suffix and is atomically renamed into
/// the catalog directory when sealed; an unsealed file lost in a crash
/// is recovered by watch replay.
#[derive(Debug)]
pub struct SegmentWriter {
    opts: Options,

    /// Path of the open (`.tmp`) file
    tmp_path: PathBuf,

    block_writer: BufWriter<File>,

    /// Buffer of events of the current block
    chunk: Vec<Event>,
    chunk_size: usize,

    /// Sparse index entries of the blocks written so far
    sparse: Vec<SparseEntry>,

    /// Posting lists being built
    postings: InvertedIndexBuilder,

    time_range: TimeRange,
    event_count: u64,
    file_pos: u64,

    last_ts: Option<u64>,
    first_append: Option<Instant>,

    sealed: bool,
}

impl SegmentWriter {
    /// Sets up a new writer, creating the `.tmp` segment file.
    pub fn new(opts: Options) -> crate::Result<Self> {
        let tmp_path = opts
            .folder
            .join(format!("{}.{TMP_SUFFIX}", segment_file_name(opts.segment_id)));

        log::debug!("Opening segment writer at {tmp_path:?}");

        let file = File::create(&tmp_path)?;
        let mut block_writer = BufWriter::with_capacity(u16::MAX.into(), file);

        // Segment file header
        block_writer.write_all(&MAGIC_BYTES)?;
        block_writer.write_u8(FORMAT_VERSION)?;
        block_writer.write_u8(0)?; // Flags
        opts.compression
            .encode_into(&mut block_writer)
            .map_err(crate::Error::Encode)?;
        block_writer.write_u8(0)?; // Reserved

        Ok(Self {
            opts,
            tmp_path,
            block_writer,
            chunk: Vec::new(),
            chunk_size: 0,
            sparse: Vec::new(),
            postings: InvertedIndexBuilder::default(),
            time_range: TimeRange::empty(),
            event_count: 0,
            file_pos: SEGMENT_HEADER_LEN as u64,
            last_ts: None,
            first_append: None,
            sealed: false,
        })
    }

    /// Id of the segment being written.
    #[must_use]
    pub fn segment_id(&self) -> SegmentId {
        self.opts.segment_id
    }

    /// Number of events appended so far.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    /// Returns `true` if nothing was appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    /// Returns `true` once the size or age seal policy triggers.
    #[must_use]
    pub fn should_seal(&self) -> bool {
        if self.file_pos >= self.opts.segment_max {
            return true;
        }

        self.first_append
            .is_some_and(|t| t.elapsed() >= self.opts.segment_age_max)
    }

    /// Appends an event into the current block buffer.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::Error::Closed`] after seal, with
    /// [`crate::Error::Backpressure`] while the pending buffer is above
    /// its high-water mark (retry after a flush), and with
    /// [`crate::Error::InvalidRequest`] if the timestamp regresses -
    /// the watch source contract guarantees per-segment monotonicity.
    pub fn append(&mut self, event: Event) -> crate::Result<()> {
        if self.sealed {
            return Err(crate::Error::Closed);
        }

        if self.chunk_size >= self.opts.high_water_mark {
            return Err(crate::Error::Backpressure);
        }

        if self.last_ts.is_some_and(|last| event.ts < last) {
            return Err(crate::Error::InvalidRequest(
                "event timestamps must be non-decreasing within a segment",
            ));
        }

        // NOTE: Truncation is OK, block count and rows per block are bounded
        #[allow(clippy::cast_possible_truncation)]
        let (block_idx, row) = (self.sparse.len() as u32, self.chunk.len() as u32);

        self.postings
            .insert(Dimension::Kind, &event.identity.kind, block_idx, row);
        self.postings
            .insert(Dimension::Namespace, &event.identity.namespace, block_idx, row);
        self.postings
            .insert(Dimension::Group, &event.identity.group, block_idx, row);

        self.time_range.fold(event.ts);
        self.last_ts = Some(event.ts);
        self.first_append.get_or_insert_with(Instant::now);

        self.event_count += 1;
        self.chunk_size += event.size();
        self.chunk.push(event);

        if self.chunk_size >= self.opts.block_soft_max as usize
            || self.chunk.len() >= self.opts.block_row_max as usize
        {
            self.spill_block()?;
        }

        Ok(())
    }

    /// Writes the current block to disk.
    ///
    /// No-op when the block buffer is empty.
    fn spill_block(&mut self) -> crate::Result<()> {
        if self.chunk.is_empty() {
            return Ok(());
        }

        let (header, bytes_written) =
            Block::write_into(&mut self.block_writer, &self.chunk, self.opts.compression)?;

        // NOTE: Truncation is OK, see above
        #[allow(clippy::cast_possible_truncation)]
        self.sparse.push(SparseEntry {
            block_idx: self.sparse.len() as u32,
            offset: self.file_pos,
            len: bytes_written as u32,
            time_range: header.time_range,
        });

        self.file_pos += bytes_written;

        log::trace!(
            "Spilled block {} ({} events, {} -> {} bytes)",
            self.sparse.len() - 1,
            header.event_count,
            header.uncompressed_length,
            header.data_length,
        );

        self.chunk.clear();
        self.chunk_size = 0;

        Ok(())
    }

    /// Forces the current block to be encoded and written,
    /// regardless of thresholds.
    pub fn flush(&mut self) -> crate::Result<()> {
        if self.sealed {
            return Err(crate::Error::Closed);
        }

        self.spill_block()?;
        self.block_writer.flush()?;

        Ok(())
    }

    /// Writes any pending block, the index sections and the footer,
    /// fsyncs, and atomically renames the file into the catalog
    /// directory.
    ///
    /// Returns `None` if nothing was ever appended (the file is
    /// removed instead).
    pub fn seal(&mut self) -> crate::Result<Option<SegmentMeta>> {
        if self.sealed {
            return Err(crate::Error::Closed);
        }

        self.spill_block()?;
        self.sealed = true;

        if self.event_count == 0 {
            log::debug!("Nothing appended, removing {:?}", self.tmp_path);
            self.block_writer.flush()?;
            std::fs::remove_file(&self.tmp_path)?;
            return Ok(None);
        }

        let inverted = std::mem::take(&mut self.postings).build();
        let inverted_bytes = inverted.encode_into_vec();

        let sparse_index = SparseIndex::new(std::mem::take(&mut self.sparse));
        let sparse_bytes = sparse_index.encode_into_vec();

        let inverted_offset = self.file_pos;
        let sparse_offset =
            inverted_offset + (std::mem::size_of::<u64>() + inverted_bytes.len()) as u64;

        // NOTE: Block count fits into u32
        #[allow(clippy::cast_possible_truncation)]
        let mut trailer = Trailer {
            block_count: sparse_index.len() as u32,
            inverted_offset,
            sparse_offset,
            time_range: self.time_range,
            checksum: Checksum::from_raw(0),
        };

        // The checksum covers both sections (length prefixes included)
        // and the footer head
        let mut hasher = crc32fast::Hasher::new();

        let mut section = Vec::with_capacity(inverted_bytes.len() + 8);
        section.write_u64::<LittleEndian>(inverted_bytes.len() as u64)?;
        section.extend(&inverted_bytes);
        hasher.update(&section);
        self.block_writer.write_all(&section)?;

        let mut section = Vec::with_capacity(sparse_bytes.len() + 8);
        section.write_u64::<LittleEndian>(sparse_bytes.len() as u64)?;
        section.extend(&sparse_bytes);
        hasher.update(&section);
        self.block_writer.write_all(&section)?;

        hasher.update(&trailer.head_bytes());
        trailer.checksum = Checksum::from_raw(hasher.finalize());

        trailer
            .encode_into(&mut self.block_writer)
            .map_err(crate::Error::Encode)?;

        self.block_writer.flush()?;
        self.block_writer.get_mut().sync_all()?;

        let file_size = self.file_pos
            + (2 * std::mem::size_of::<u64>() + inverted_bytes.len() + sparse_bytes.len()) as u64
            + TRAILER_LEN as u64;

        let path = self.opts.folder.join(segment_file_name(self.opts.segment_id));
        std::fs::rename(&self.tmp_path, &path)?;

        // IMPORTANT: fsync folder on Unix
        fsync_directory(&self.opts.folder)?;

        log::debug!(
            "Sealed segment {} with {} events in {} blocks ({file_size} bytes)",
            self.opts.segment_id,
            self.event_count,
            trailer.block_count,
        );

        Ok(Some(SegmentMeta {
            id: self.opts.segment_id,
            path,
            time_range: self.time_range,
            event_count: self.event_count,
            block_count: trailer.block_count,
            file_size,
            compression: self.opts.compression,
            seal_time: crate::time::unix_timestamp(),
        }))
    }

    /// Closes the writer without sealing, moving the `.tmp` file
    /// aside as `.bad`.
    ///
    /// Called when a write failure makes the open segment unusable
    /// (also after a failed seal); replay covers the lost tail.
    pub fn abandon(&mut self) -> crate::Result<()> {
        self.sealed = true;

        let bad_path = self
            .opts
            .folder
            .join(format!("{}.{BAD_SUFFIX}", segment_file_name(self.opts.segment_id)));

        log::error!("Abandoning open segment, moving {:?} to {bad_path:?}", self.tmp_path);

        self.block_writer.flush().ok();
        std::fs::rename(&self.tmp_path, &bad_path)?;

        Ok(())
    }
}
