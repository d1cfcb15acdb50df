// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    event::UnixTimestamp,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// A time range in the format of [min, max] (inclusive on both sides)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimeRange(UnixTimestamp, UnixTimestamp);

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}<=>{}]", self.0, self.1)
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::empty()
    }
}

impl TimeRange {
    /// Creates a new time range.
    ///
    /// # Panics
    ///
    /// Panics if `min > max`.
    #[must_use]
    pub fn new(min: UnixTimestamp, max: UnixTimestamp) -> Self {
        assert!(min <= max, "time range min must be <= max");
        Self(min, max)
    }

    /// Creates an empty time range.
    #[must_use]
    pub fn empty() -> Self {
        Self(UnixTimestamp::MAX, 0)
    }

    /// Creates the all-time range.
    #[must_use]
    pub fn all() -> Self {
        Self(0, UnixTimestamp::MAX)
    }

    /// Returns `true` if no timestamp was ever folded in.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 > self.1
    }

    /// Returns the lower bound.
    #[must_use]
    pub fn min(&self) -> UnixTimestamp {
        self.0
    }

    /// Returns the upper bound.
    #[must_use]
    pub fn max(&self) -> UnixTimestamp {
        self.1
    }

    /// Widens the range to contain the given timestamp.
    pub fn fold(&mut self, ts: UnixTimestamp) {
        self.0 = self.0.min(ts);
        self.1 = self.1.max(ts);
    }

    /// Returns `true` if the timestamp falls within this range.
    #[must_use]
    pub fn contains(&self, ts: UnixTimestamp) -> bool {
        ts >= self.0 && ts <= self.1
    }

    /// Returns `true` if the `other` overlaps at least partially with this range.
    ///
    /// Ranges that only touch at a boundary count as overlapping.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.1 >= other.0 && self.0 <= other.1
    }

    /// Aggregates a set of ranges.
    pub fn aggregate<'a>(iter: impl Iterator<Item = &'a Self>) -> Self {
        let mut out = Self::empty();

        for other in iter {
            out.0 = out.0.min(other.0);
            out.1 = out.1.max(other.1);
        }

        out
    }
}

impl Encode for TimeRange {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.0)?;
        writer.write_u64::<LittleEndian>(self.1)?;
        Ok(())
    }
}

impl Decode for TimeRange {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let min = reader.read_u64::<LittleEndian>()?;
        let max = reader.read_u64::<LittleEndian>()?;
        Ok(Self(min, max))
    }
}
