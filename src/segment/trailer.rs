// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    file::MAGIC_BYTES,
    Checksum, TimeRange,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Serialized size of the segment footer
pub const TRAILER_LEN: usize =
    // Block count
    std::mem::size_of::<u32>()
    // Index section offsets
    + 2 * std::mem::size_of::<u64>()
    // Time range
    + 2 * std::mem::size_of::<u64>()
    // Checksum
    + std::mem::size_of::<u32>()
    // Magic
    + MAGIC_BYTES.len();

/// Footer of a segment file
///
/// The checksum covers both index sections (including their length
/// prefixes) plus the footer fields ahead of the checksum itself.
/// A checksum mismatch quarantines the segment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Trailer {
    /// Number of blocks in the segment
    pub block_count: u32,

    /// File offset of the inverted index section
    pub inverted_offset: u64,

    /// File offset of the sparse index section
    pub sparse_offset: u64,

    /// Minimum and maximum event timestamp of the segment
    pub time_range: TimeRange,

    /// CRC32 over the index sections and the footer head
    pub checksum: Checksum,
}

impl Trailer {
    /// Serializes the fields covered by the checksum.
    #[must_use]
    pub fn head_bytes(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(TRAILER_LEN);

        // NOTE: Writing into a Vec cannot fail
        #[allow(clippy::expect_used)]
        {
            v.write_u32::<LittleEndian>(self.block_count)
                .expect("cannot fail");
            v.write_u64::<LittleEndian>(self.inverted_offset)
                .expect("cannot fail");
            v.write_u64::<LittleEndian>(self.sparse_offset)
                .expect("cannot fail");
            self.time_range.encode_into(&mut v).expect("cannot fail");
        }

        v
    }
}

impl Encode for Trailer {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&self.head_bytes())?;
        writer.write_u32::<LittleEndian>(*self.checksum)?;
        writer.write_all(&MAGIC_BYTES)?;
        Ok(())
    }
}

impl Decode for Trailer {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let block_count = reader.read_u32::<LittleEndian>()?;
        let inverted_offset = reader.read_u64::<LittleEndian>()?;
        let sparse_offset = reader.read_u64::<LittleEndian>()?;
        let time_range = TimeRange::decode_from(reader)?;
        let checksum = Checksum::from_raw(reader.read_u32::<LittleEndian>()?);

        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidTrailer("Segment"));
        }

        Ok(Self {
            block_count,
            inverted_offset,
            sparse_offset,
            time_range,
            checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn trailer_roundtrip() -> crate::Result<()> {
        let trailer = Trailer {
            block_count: 3,
            inverted_offset: 1_000,
            sparse_offset: 1_500,
            time_range: TimeRange::new(100, 400),
            checksum: Checksum::from_raw(0xDEAD_BEEF),
        };

        let bytes = trailer.encode_into_vec();
        assert_eq!(TRAILER_LEN, bytes.len());

        let decoded = Trailer::decode_from(&mut std::io::Cursor::new(bytes))?;
        assert_eq!(trailer, decoded);

        Ok(())
    }

    #[test]
    fn trailer_rejects_bad_magic() {
        let trailer = Trailer {
            block_count: 1,
            inverted_offset: 8,
            sparse_offset: 16,
            time_range: TimeRange::new(0, 1),
            checksum: Checksum::from_raw(0),
        };

        let mut bytes = trailer.encode_into_vec();
        bytes.truncate(TRAILER_LEN - 4);
        bytes.extend(b"NOPE");

        assert!(matches!(
            Trailer::decode_from(&mut std::io::Cursor::new(bytes)),
            Err(DecodeError::InvalidTrailer("Segment"))
        ));
    }
}
