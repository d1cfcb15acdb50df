// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod header;

use crate::{
    bloom::{BloomFilter, Builder as BloomBuilder},
    coding::{Decode, Encode},
    Checksum, CompressionType, Event, TimeRange,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use header::BlockHeader;
use std::io::{Cursor, Read, Write};

/// Bloom false positive target for block filters
const BLOOM_FP_RATE: f32 = 0.01;

/// A disk-based block of events, the unit of read I/O
///
/// A block is split into its header and a compressed blob of
/// length-prefixed event records, followed by a CRC32 trailer
/// covering the compressed blob:
///
/// \[ header \]
/// \[  body  \]
/// \[  crc   \]
///
/// Events inside a block are ordered by timestamp (ties allowed).
#[derive(Clone, Debug)]
pub struct Block {
    pub header: BlockHeader,
    pub events: Box<[Event]>,
}

/// A block whose integrity is verified, but whose body is still compressed
///
/// Lets the planner consult the header bloom filter before paying for
/// decompression.
#[derive(Clone, Debug)]
pub struct RawBlock {
    pub header: BlockHeader,
    body: Vec<u8>,
}

impl RawBlock {
    /// Reads a block, verifying the trailer CRC.
    ///
    /// Refuses to hand out a corrupt block.
    pub fn from_reader<R: Read>(reader: &mut R) -> crate::Result<Self> {
        let header = BlockHeader::decode_from(reader)?;
        log::trace!("Got block header: {header:?}");

        let mut body = vec![0u8; header.data_length as usize];
        reader.read_exact(&mut body)?;

        let expected = Checksum::from_raw(reader.read_u32::<LittleEndian>()?);
        let got = Checksum::from_bytes(&body);

        if got != expected {
            return Err(crate::Error::CorruptBlock(got, expected));
        }

        Ok(Self { header, body })
    }

    /// Decompresses and parses the body.
    pub fn decode(&self) -> crate::Result<Block> {
        let bytes = self.header.compression.decompress(&self.body)?;
        let mut bytes = Cursor::new(bytes);

        let base_ts = self.header.time_range.min();

        let mut events = Vec::with_capacity(self.header.event_count as usize);
        for _ in 0..self.header.event_count {
            events.push(Event::decode_from(&mut bytes, base_ts).map_err(crate::Error::Decode)?);
        }

        Ok(Block {
            header: self.header.clone(),
            events: events.into_boxed_slice(),
        })
    }
}

impl Block {
    /// Serializes and compresses events into (header, body) parts.
    ///
    /// # Panics
    ///
    /// Panics if `events` is empty - empty blocks are never written.
    pub fn to_bytes_compressed(
        events: &[Event],
        compression: CompressionType,
    ) -> crate::Result<(BlockHeader, Vec<u8>)> {
        assert!(!events.is_empty(), "blocks contain 1..N events");

        let mut time_range = TimeRange::empty();
        for event in events {
            time_range.fold(event.ts);
        }

        // 4 dimension keys per event
        let mut bloom = BloomBuilder::with_fp_rate(events.len() * 4, BLOOM_FP_RATE);
        for event in events {
            bloom.set_with_hash(BloomFilter::get_hash(event.identity.kind.as_bytes()));
            bloom.set_with_hash(BloomFilter::get_hash(event.identity.namespace.as_bytes()));
            bloom.set_with_hash(BloomFilter::get_hash(event.identity.group.as_bytes()));
            bloom.set_with_hash(BloomFilter::get_hash(event.identity.name.as_bytes()));
        }

        let mut buf = Vec::with_capacity(u16::MAX.into());
        for event in events {
            event
                .encode_into(&mut buf, time_range.min())
                .map_err(crate::Error::Encode)?;
        }

        let packed = compression.compress(&buf);

        let header = BlockHeader {
            compression,

            // NOTE: Truncation is OK because blocks are capped at a few thousand rows
            #[allow(clippy::cast_possible_truncation)]
            event_count: events.len() as u32,

            // NOTE: Truncation is OK because block size is capped at a few MiB
            #[allow(clippy::cast_possible_truncation)]
            data_length: packed.len() as u32,

            #[allow(clippy::cast_possible_truncation)]
            uncompressed_length: buf.len() as u32,

            time_range,
            bloom: bloom.build(),
        };

        Ok((header, packed))
    }

    /// Writes a full block (header, body, CRC trailer) into the writer.
    ///
    /// Returns the header and the number of bytes written.
    pub fn write_into<W: Write>(
        writer: &mut W,
        events: &[Event],
        compression: CompressionType,
    ) -> crate::Result<(BlockHeader, u64)> {
        let (header, body) = Self::to_bytes_compressed(events, compression)?;

        header.encode_into(writer).map_err(crate::Error::Encode)?;
        writer.write_all(&body)?;
        writer.write_u32::<LittleEndian>(*Checksum::from_bytes(&body))?;

        let len = header.serialized_len() + body.len() + std::mem::size_of::<u32>();

        Ok((header, len as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ResourceIdentity, Verb};
    use test_log::test;

    fn events() -> Vec<Event> {
        (0..10u64)
            .map(|i| {
                Event::new(
                    ResourceIdentity::builder()
                        .version("v1")
                        .kind(if i % 2 == 0 { "Pod" } else { "ConfigMap" })
                        .namespace("default")
                        .name(format!("res-{i}"))
                        .uid(format!("uid-{i}"))
                        .build(),
                    1_000 + i,
                    Verb::Create,
                    br#"{"spec":{}}"#.to_vec(),
                )
            })
            .collect()
    }

    #[test]
    fn block_roundtrip() -> crate::Result<()> {
        let events = events();

        let mut serialized = vec![];
        let (header, len) = Block::write_into(&mut serialized, &events, CompressionType::Lz4)?;

        assert_eq!(serialized.len() as u64, len);
        assert_eq!(10, header.event_count);
        assert_eq!(TimeRange::new(1_000, 1_009), header.time_range);

        let raw = RawBlock::from_reader(&mut Cursor::new(serialized))?;
        let block = raw.decode()?;

        assert_eq!(events, *block.events);

        Ok(())
    }

    #[test]
    fn block_bloom_accepts_contained_dimensions() -> crate::Result<()> {
        let events = events();
        let (header, _) = Block::to_bytes_compressed(&events, CompressionType::None)?;

        // No false negatives
        assert!(header.bloom.contains(b"Pod"));
        assert!(header.bloom.contains(b"ConfigMap"));
        assert!(header.bloom.contains(b"default"));
        assert!(header.bloom.contains(b"res-3"));

        Ok(())
    }

    #[test]
    fn block_refuses_corrupt_body() -> crate::Result<()> {
        let events = events();

        let mut serialized = vec![];
        let (header, _) = Block::write_into(&mut serialized, &events, CompressionType::Lz4)?;

        // Flip a byte in the middle of the body
        let victim = header.serialized_len() + 5;
        if let Some(byte) = serialized.get_mut(victim) {
            *byte ^= 0xFF;
        }

        assert!(matches!(
            RawBlock::from_reader(&mut Cursor::new(serialized)),
            Err(crate::Error::CorruptBlock(_, _))
        ));

        Ok(())
    }

    #[test]
    fn block_compresses_repetitive_events() -> crate::Result<()> {
        let events = (0..500u64)
            .map(|i| {
                Event::new(
                    ResourceIdentity::builder()
                        .version("v1")
                        .kind("Pod")
                        .namespace("default")
                        .name("web-0")
                        .uid("uid-0")
                        .build(),
                    1_000 + i,
                    Verb::Update,
                    br#"{"status":{"phase":"Running","ready":true}}"#.to_vec(),
                )
            })
            .collect::<Vec<_>>();

        let (header, body) = Block::to_bytes_compressed(&events, CompressionType::Lz4)?;

        // 90%+ compression on snapshot streams
        assert!(body.len() * 10 < header.uncompressed_length as usize);

        Ok(())
    }
}
