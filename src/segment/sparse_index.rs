// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    TimeRange,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Sparse index entry, one per block
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SparseEntry {
    /// Index of the block inside its segment
    pub block_idx: u32,

    /// File offset of the block
    pub offset: u64,

    /// On-disk length of the block (header, body and trailer)
    pub len: u32,

    /// Minimum and maximum event timestamp of the block
    pub time_range: TimeRange,
}

/// Per-segment sparse timestamp index
///
/// One entry per block, sorted by min timestamp. Because blocks are
/// written in timestamp order, block ranges never overlap except at
/// boundaries, so a `[lo, hi]` lookup is a pair of binary searches.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SparseIndex(Vec<SparseEntry>);

impl SparseIndex {
    /// Wraps entries that are already sorted by min timestamp.
    #[must_use]
    pub fn new(entries: Vec<SparseEntry>) -> Self {
        debug_assert!(
            entries.windows(2).all(|w| match w {
                [a, b] => a.time_range.min() <= b.time_range.min(),
                _ => true,
            }),
            "sparse entries must be sorted by min timestamp",
        );

        Self(entries)
    }

    /// Number of blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the segment has no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns all entries.
    #[must_use]
    pub fn entries(&self) -> &[SparseEntry] {
        &self.0
    }

    /// Returns the entry of the given block.
    #[must_use]
    pub fn get(&self, block_idx: u32) -> Option<&SparseEntry> {
        self.0.get(block_idx as usize)
    }

    /// Returns the contiguous run of blocks whose time range intersects
    /// `[lo, hi]`, including a block whose max timestamp equals `lo`.
    ///
    /// An empty result is not an error.
    #[must_use]
    pub fn blocks_for_range(&self, range: &TimeRange) -> &[SparseEntry] {
        let lo = self.0.partition_point(|e| e.time_range.max() < range.min());
        let hi = self.0.partition_point(|e| e.time_range.min() <= range.max());

        self.0.get(lo..hi).unwrap_or_default()
    }
}

impl Encode for SparseIndex {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Block count fits into u32
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.0.len() as u32)?;

        for entry in &self.0 {
            writer.write_u32::<LittleEndian>(entry.block_idx)?;
            writer.write_u64::<LittleEndian>(entry.offset)?;
            writer.write_u32::<LittleEndian>(entry.len)?;
            entry.time_range.encode_into(writer)?;
        }

        Ok(())
    }
}

impl Decode for SparseIndex {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let count = reader.read_u32_varint()?;

        let mut entries = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let block_idx = reader.read_u32::<LittleEndian>()?;
            let offset = reader.read_u64::<LittleEndian>()?;
            let len = reader.read_u32::<LittleEndian>()?;
            let time_range = TimeRange::decode_from(reader)?;

            entries.push(SparseEntry {
                block_idx,
                offset,
                len,
                time_range,
            });
        }

        Ok(Self(entries))
    }
}
