// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    Checksum, CompressionType, SegmentId,
};

/// Represents errors that can occur in the event store
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress(CompressionType),

    /// Block failed its integrity check (got, expected)
    CorruptBlock(Checksum, Checksum),

    /// Segment footer or index section failed its integrity check
    CorruptSegment(SegmentId),

    /// Catalog journal could not be parsed
    CorruptCatalog(String),

    /// Operation against a sealed writer or closed reader
    Closed,

    /// Write buffer is above its high-water mark, retry after the writer drains
    Backpressure,

    /// Cancellation signal observed
    Cancelled,

    /// Segment or cursor no longer exists
    NotFound,

    /// Bad time range, oversized filter or limit, or unknown field
    InvalidRequest(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SpectreError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Store result
pub type Result<T> = std::result::Result<T, Error>;
