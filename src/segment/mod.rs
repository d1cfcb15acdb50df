// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Sealed segment files: reading, writing and their resident indices.

/// Segment identifiers
pub mod id;

/// Per-segment posting lists over kind, namespace and group
pub mod inverted_index;

/// Segment descriptors
pub mod meta;

/// Per-block timestamp index
pub mod sparse_index;

/// Segment footer
pub mod trailer;

/// Streaming segment writer
pub mod writer;

use crate::{
    block::{header::BlockHeader, RawBlock},
    coding::Decode,
    file::{FORMAT_VERSION, MAGIC_BYTES},
    query::QueryFilter,
    CompressionType, SegmentId, TimeRange,
};
use byteorder::{LittleEndian, ReadBytesExt};
use inverted_index::{InvertedIndex, Selection};
use meta::SegmentMeta;
use sparse_index::{SparseEntry, SparseIndex};
use std::{
    fs::File,
    io::{BufReader, Cursor, Read, Seek, SeekFrom},
    path::Path,
};
use trailer::{Trailer, TRAILER_LEN};
use writer::SEGMENT_HEADER_LEN;

/// A sealed, immutable segment
///
/// Opening a segment validates magic and version, verifies the footer
/// checksum and keeps the sparse and inverted indices resident.
/// Everything is read-only afterwards, so concurrent readers need no
/// locking.
pub struct Segment {
    /// Descriptor
    pub meta: SegmentMeta,

    pub(crate) sparse: SparseIndex,
    pub(crate) inverted: InvertedIndex,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Segment:{}({})", self.meta.id, self.meta.time_range)
    }
}

/// One block selected by the planner
#[derive(Copy, Clone, Debug)]
pub struct BlockRead {
    /// Sparse index entry of the block
    pub entry: SparseEntry,

    /// Row bound from posting-list intersection, if any dimension
    /// was constrained
    pub rows: Option<(u32, u32)>,
}

impl Segment {
    /// Opens a sealed segment file.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::Error::CorruptSegment`] if magic, version,
    /// footer or checksum are damaged; the caller quarantines the file.
    pub fn open<P: AsRef<Path>>(path: P, id: SegmentId) -> crate::Result<Self> {
        let path = path.as_ref();
        log::debug!("Opening segment {id} at {path:?}");

        let file_size = std::fs::metadata(path)?.len();

        if file_size < (SEGMENT_HEADER_LEN + TRAILER_LEN) as u64 {
            log::error!("Segment {id} is truncated ({file_size} bytes)");
            return Err(crate::Error::CorruptSegment(id));
        }

        let mut reader = BufReader::new(File::open(path)?);

        // File header
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(crate::Error::CorruptSegment(id));
        }

        let version = reader.read_u8()?;
        if version != FORMAT_VERSION {
            log::error!("Segment {id} has unsupported version {version}");
            return Err(crate::Error::CorruptSegment(id));
        }

        let _flags = reader.read_u8()?;
        let compression = CompressionType::decode_from(&mut reader)
            .map_err(|_| crate::Error::CorruptSegment(id))?;
        let _reserved = reader.read_u8()?;

        // Footer
        reader.seek(SeekFrom::Start(file_size - TRAILER_LEN as u64))?;
        let trailer =
            Trailer::decode_from(&mut reader).map_err(|_| crate::Error::CorruptSegment(id))?;

        let sections_end = file_size - TRAILER_LEN as u64;

        if trailer.inverted_offset < SEGMENT_HEADER_LEN as u64
            || trailer.sparse_offset <= trailer.inverted_offset
            || trailer.sparse_offset >= sections_end
        {
            return Err(crate::Error::CorruptSegment(id));
        }

        // Index sections, checksummed together with the footer head
        reader.seek(SeekFrom::Start(trailer.inverted_offset))?;

        let mut sections = vec![0u8; (sections_end - trailer.inverted_offset) as usize];
        reader.read_exact(&mut sections)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&sections);
        hasher.update(&trailer.head_bytes());

        if hasher.finalize() != *trailer.checksum {
            log::error!("Segment {id} failed its footer checksum");
            return Err(crate::Error::CorruptSegment(id));
        }

        let mut sections = Cursor::new(sections);

        let inverted_len = sections.read_u64::<LittleEndian>()?;
        let mut inverted_bytes = vec![0u8; inverted_len as usize];
        sections.read_exact(&mut inverted_bytes)?;
        let inverted = InvertedIndex::decode_from(&mut Cursor::new(inverted_bytes))
            .map_err(|_| crate::Error::CorruptSegment(id))?;

        let sparse_len = sections.read_u64::<LittleEndian>()?;
        let mut sparse_bytes = vec![0u8; sparse_len as usize];
        sections.read_exact(&mut sparse_bytes)?;
        let sparse = SparseIndex::decode_from(&mut Cursor::new(sparse_bytes))
            .map_err(|_| crate::Error::CorruptSegment(id))?;

        if sparse.len() != trailer.block_count as usize {
            return Err(crate::Error::CorruptSegment(id));
        }

        // Event count, served by block headers only (no body I/O)
        let mut event_count = 0u64;

        for entry in sparse.entries() {
            reader.seek(SeekFrom::Start(entry.offset))?;

            let mut prefix = vec![0u8; BlockHeader::fixed_prefix_len()];
            reader.read_exact(&mut prefix)?;

            if prefix.get(..MAGIC_BYTES.len()) != Some(MAGIC_BYTES.as_slice()) {
                return Err(crate::Error::CorruptSegment(id));
            }

            let mut cursor = Cursor::new(&prefix);
            cursor.seek(SeekFrom::Start((MAGIC_BYTES.len() + 1) as u64))?;
            event_count += u64::from(cursor.read_u32::<LittleEndian>()?);
        }

        let seal_time = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());

        Ok(Self {
            meta: SegmentMeta {
                id,
                path: path.into(),
                time_range: trailer.time_range,
                event_count,
                block_count: trailer.block_count,
                file_size,
                compression,
                seal_time,
            },
            sparse,
            inverted,
        })
    }

    /// Iterates the distinct values of an indexed dimension.
    pub fn distinct_values(&self, dim: inverted_index::Dimension) -> impl Iterator<Item = &str> {
        self.inverted.values(dim)
    }

    /// The resident sparse index entries, one per block.
    #[must_use]
    pub fn sparse_entries(&self) -> &[SparseEntry] {
        self.sparse.entries()
    }

    /// Plans the blocks to read for a time range and filter.
    ///
    /// Posting lists are intersected first, then the survivors are cut
    /// down to the sparse index's time slice. An empty plan means the
    /// segment can be skipped without any I/O.
    #[must_use]
    pub fn plan_blocks(&self, range: &TimeRange, filter: &QueryFilter) -> Vec<BlockRead> {
        let slice = self.sparse.blocks_for_range(range);

        let Some(first) = slice.first().map(|e| e.block_idx) else {
            return vec![];
        };
        let last = slice.last().map_or(first, |e| e.block_idx);

        match self
            .inverted
            .intersect(&filter.kinds, &filter.namespaces, &filter.groups)
        {
            Selection::Universe => slice
                .iter()
                .map(|entry| BlockRead {
                    entry: *entry,
                    rows: None,
                })
                .collect(),

            Selection::Blocks(matches) => matches
                .into_iter()
                .filter(|m| m.block_idx >= first && m.block_idx <= last)
                .filter_map(|m| {
                    self.sparse.get(m.block_idx).map(|entry| BlockRead {
                        entry: *entry,
                        rows: Some(m.rows),
                    })
                })
                .collect(),
        }
    }

    /// Produces a lazy, finite stream of CRC-checked blocks whose time
    /// range intersects `range` and whose posting intersection matches
    /// `filter`.
    pub fn scan_blocks(&self, range: &TimeRange, filter: &QueryFilter) -> crate::Result<BlockScan> {
        let plan = self.plan_blocks(range, filter);
        BlockScan::new(&self.meta.path, plan)
    }

    /// Reads and decodes a single block.
    ///
    /// Fails with [`crate::Error::NotFound`] for an unknown block index.
    pub fn read_block(&self, block_idx: u32) -> crate::Result<crate::block::Block> {
        let entry = self.sparse.get(block_idx).ok_or(crate::Error::NotFound)?;

        let mut file = BufReader::new(File::open(&self.meta.path)?);
        file.seek(SeekFrom::Start(entry.offset))?;

        RawBlock::from_reader(&mut file)?.decode()
    }
}

/// Lazy block stream over one segment
pub struct BlockScan {
    file: BufReader<File>,
    blocks: std::vec::IntoIter<BlockRead>,
    planned: usize,
}

impl BlockScan {
    fn new(path: &Path, plan: Vec<BlockRead>) -> crate::Result<Self> {
        let file = BufReader::new(File::open(path)?);
        let planned = plan.len();

        Ok(Self {
            file,
            blocks: plan.into_iter(),
            planned,
        })
    }

    /// Number of blocks selected by the plan.
    #[must_use]
    pub fn planned(&self) -> usize {
        self.planned
    }
}

impl Iterator for BlockScan {
    type Item = crate::Result<(BlockRead, RawBlock)>;

    fn next(&mut self) -> Option<Self::Item> {
        let read = self.blocks.next()?;

        fail_iter!(self.file.seek(SeekFrom::Start(read.entry.offset)).map_err(crate::Error::Io));
        let raw = fail_iter!(RawBlock::from_reader(&mut self.file));

        Some(Ok((read, raw)))
    }
}
