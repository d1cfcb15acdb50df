// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod bit_array;

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use bit_array::BitArray;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Two hashes for enhanced double hashing
pub type CompositeHash = (u64, u64);

fn secondary_hash(h1: u64) -> u64 {
    // Taken from https://github.com/tomtomwombat/fastbloom
    h1.wrapping_shr(32).wrapping_mul(0x51_7c_c1_b7_27_22_0a_95)
}

/// A standard bloom filter over block key dimensions
/// (kind, namespace, group, name)
///
/// Uses enhanced double hashing instead of `k` hash functions.
/// Will never have a false negative.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BloomFilter {
    /// Raw bytes exposed as bit array
    inner: BitArray,

    /// Bit count
    m: usize,

    /// Number of hash functions
    k: usize,
}

impl BloomFilter {
    /// Size of the filter in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.bytes().len()
    }

    /// Returns `true` if the filter has no bits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the key may be contained.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.contains_hash(Self::get_hash(key))
    }

    /// Returns `true` if the hash may be contained.
    #[must_use]
    pub fn contains_hash(&self, hash: CompositeHash) -> bool {
        let (mut h1, mut h2) = hash;

        for i in 1..=(self.k as u64) {
            let idx = h1 % (self.m as u64);

            // NOTE: Index is in bounds because of the modulo
            #[allow(clippy::cast_possible_truncation)]
            if !self.inner.get(idx as usize) {
                return false;
            }

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_mul(i);
        }

        true
    }

    /// Gets the hash of a key.
    #[must_use]
    pub fn get_hash(key: &[u8]) -> CompositeHash {
        let h1 = xxhash_rust::xxh3::xxh3_64(key);
        (h1, secondary_hash(h1))
    }
}

impl Encode for BloomFilter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Block-level filters are tiny, m and k fit into u32
        #[allow(clippy::cast_possible_truncation)]
        {
            writer.write_u32::<LittleEndian>(self.m as u32)?;
            writer.write_u32::<LittleEndian>(self.k as u32)?;
        }
        writer.write_all(self.inner.bytes())?;
        Ok(())
    }
}

impl Decode for BloomFilter {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let m = reader.read_u32::<LittleEndian>()? as usize;
        let k = reader.read_u32::<LittleEndian>()? as usize;

        if k == 0 || m == 0 || m % 8 != 0 {
            return Err(DecodeError::InvalidHeader("BloomFilter"));
        }

        let mut bytes = vec![0; m / 8];
        reader.read_exact(&mut bytes)?;

        Ok(Self {
            inner: BitArray::from_bytes(bytes.into_boxed_slice()),
            m,
            k,
        })
    }
}

/// Bloom filter builder
///
/// Key hashes are buffered by the segment writer until the block is
/// closed, so the filter can be sized for the actual item count.
#[derive(Debug)]
pub struct Builder {
    /// Raw bytes exposed as bit array
    inner: BitArray,

    /// Bit count
    m: usize,

    /// Number of hash functions
    k: usize,
}

impl Builder {
    /// Constructs a bloom filter that can hold `n` items
    /// while maintaining a certain false positive rate `fpr`.
    #[must_use]
    pub fn with_fp_rate(n: usize, fpr: f32) -> Self {
        use std::f32::consts::LN_2;

        assert!(n > 0);

        // NOTE: Some sensible minimum
        let fpr = fpr.max(0.000_000_1);

        let m = Self::calculate_m(n, fpr);
        let bpk = m / n;
        let k = (((bpk as f32) * LN_2) as usize).max(1);

        Self {
            inner: BitArray::with_capacity(m / 8),
            m,
            k,
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn calculate_m(n: usize, fp_rate: f32) -> usize {
        use std::f32::consts::LN_2;

        let n = n as f32;
        let ln2_squared = LN_2.powi(2);

        let numerator = n * fp_rate.ln();
        let m = -(numerator / ln2_squared);

        // Round up to next byte
        ((m / 8.0).ceil() * 8.0) as usize
    }

    /// Adds a hashed key to the filter.
    pub fn set_with_hash(&mut self, hash: CompositeHash) {
        let (mut h1, mut h2) = hash;

        for i in 1..=(self.k as u64) {
            let idx = h1 % (self.m as u64);

            #[allow(clippy::cast_possible_truncation)]
            self.inner.enable(idx as usize);

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_mul(i);
        }
    }

    /// Builds the filter.
    #[must_use]
    pub fn build(self) -> BloomFilter {
        BloomFilter {
            inner: self.inner,
            m: self.m,
            k: self.k,
        }
    }
}
