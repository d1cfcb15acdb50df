// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    bloom::BloomFilter,
    coding::{Decode, DecodeError, Encode, EncodeError},
    file::MAGIC_BYTES,
    CompressionType, TimeRange,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Header of a disk-based block
///
/// The bloom filter is keyed by the kind, namespace, group and name of
/// every event in the block, so a block can be skipped without
/// decompressing its body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    /// Compression type used for the body
    pub compression: CompressionType,

    /// Number of events in the block
    pub event_count: u32,

    /// Compressed size of the body
    pub data_length: u32,

    /// Uncompressed size of the body
    pub uncompressed_length: u32,

    /// Minimum and maximum event timestamp
    pub time_range: TimeRange,

    /// Membership filter over identity dimensions
    pub bloom: BloomFilter,
}

impl BlockHeader {
    /// Serialized size of everything ahead of the bloom filter.
    #[must_use]
    pub const fn fixed_prefix_len() -> usize {
        MAGIC_BYTES.len()
            // Compression
            + std::mem::size_of::<u8>()
            // Event count
            + std::mem::size_of::<u32>()
            // Data length
            + std::mem::size_of::<u32>()
            // Uncompressed data length
            + std::mem::size_of::<u32>()
            // Time range
            + 2 * std::mem::size_of::<u64>()
    }

    /// Total serialized size.
    #[must_use]
    pub fn serialized_len(&self) -> usize {
        // Bloom m + k
        Self::fixed_prefix_len() + 2 * std::mem::size_of::<u32>() + self.bloom.len()
    }
}

impl Encode for BlockHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC_BYTES)?;

        self.compression.encode_into(writer)?;

        writer.write_u32::<LittleEndian>(self.event_count)?;
        writer.write_u32::<LittleEndian>(self.data_length)?;
        writer.write_u32::<LittleEndian>(self.uncompressed_length)?;

        self.time_range.encode_into(writer)?;

        self.bloom.encode_into(writer)?;

        Ok(())
    }
}

impl Decode for BlockHeader {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("Block"));
        }

        let compression = CompressionType::decode_from(reader)?;

        let event_count = reader.read_u32::<LittleEndian>()?;
        let data_length = reader.read_u32::<LittleEndian>()?;
        let uncompressed_length = reader.read_u32::<LittleEndian>()?;

        let time_range = TimeRange::decode_from(reader)?;

        let bloom = BloomFilter::decode_from(reader)?;

        Ok(Self {
            compression,
            event_count,
            data_length,
            uncompressed_length,
            time_range,
            bloom,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn block_header_roundtrip() -> crate::Result<()> {
        let mut builder = crate::bloom::Builder::with_fp_rate(4, 0.01);
        builder.set_with_hash(BloomFilter::get_hash(b"Pod"));

        let header = BlockHeader {
            compression: CompressionType::Lz4,
            event_count: 4,
            data_length: 100,
            uncompressed_length: 500,
            time_range: TimeRange::new(100, 130),
            bloom: builder.build(),
        };

        let bytes = header.encode_into_vec();
        assert_eq!(header.serialized_len(), bytes.len());

        let decoded = BlockHeader::decode_from(&mut std::io::Cursor::new(bytes))?;
        assert_eq!(header, decoded);

        Ok(())
    }

    #[test]
    fn block_header_rejects_bad_magic() {
        let bytes = b"NOPE.............................".to_vec();

        assert!(matches!(
            BlockHeader::decode_from(&mut std::io::Cursor::new(bytes)),
            Err(DecodeError::InvalidHeader("Block"))
        ));
    }
}
