// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Compression algorithm to use for block bodies
///
/// The on-disk tag space is shared with other Spectre implementations:
/// `{0=none, 1=zstd, 2=snappy, 3=lz4}`. This implementation writes
/// `none` or `lz4` and refuses the other tags on decode.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum CompressionType {
    /// No compression
    ///
    /// Not recommended.
    None,

    /// LZ4 compression
    #[default]
    Lz4,
}

impl CompressionType {
    /// Compresses a buffer.
    #[must_use]
    pub fn compress(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::None => bytes.to_vec(),
            Self::Lz4 => lz4_flex::compress_prepend_size(bytes),
        }
    }

    /// Decompresses a buffer.
    pub fn decompress(self, bytes: &[u8]) -> crate::Result<Vec<u8>> {
        match self {
            Self::None => Ok(bytes.to_vec()),
            Self::Lz4 => lz4_flex::decompress_size_prepended(bytes)
                .map_err(|_| crate::Error::Decompress(self)),
        }
    }
}

impl Encode for CompressionType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::None => writer.write_u8(0)?,
            Self::Lz4 => writer.write_u8(3)?,
        }

        Ok(())
    }
}

impl Decode for CompressionType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        match tag {
            0 => Ok(Self::None),
            3 => Ok(Self::Lz4),

            // NOTE: 1=zstd and 2=snappy are valid in the shared tag space
            // but not supported by this implementation
            tag => Err(DecodeError::InvalidTag(("CompressionType", tag))),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "no compression",
                Self::Lz4 => "lz4",
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn compression_serialize() {
        assert_eq!(vec![0], CompressionType::None.encode_into_vec());
        assert_eq!(vec![3], CompressionType::Lz4.encode_into_vec());
    }

    #[test]
    fn compression_refuses_foreign_tags() {
        for tag in [1u8, 2, 4, 255] {
            let mut cursor = std::io::Cursor::new(vec![tag]);
            assert!(matches!(
                CompressionType::decode_from(&mut cursor),
                Err(DecodeError::InvalidTag(("CompressionType", t))) if t == tag
            ));
        }
    }

    #[test]
    fn compression_roundtrip() -> crate::Result<()> {
        let payload = b"{\"kind\":\"Pod\"}".repeat(100);

        for compression in [CompressionType::None, CompressionType::Lz4] {
            let packed = compression.compress(&payload);
            assert_eq!(payload, *compression.decompress(&packed)?);
        }

        Ok(())
    }

    #[test]
    fn compression_shrinks_repetitive_payloads() {
        let payload = b"{\"status\":{\"phase\":\"Running\"}}".repeat(1_000);
        let packed = CompressionType::Lz4.compress(&payload);
        assert!(packed.len() * 10 < payload.len());
    }
}
