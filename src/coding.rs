// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::io::{Read, Write};

/// Error during serialization
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error
    Io(std::io::Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EncodeError({})",
            match self {
                Self::Io(e) => e.to_string(),
            }
        )
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
        }
    }
}

/// Error during deserialization
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error
    Io(std::io::Error),

    /// Invalid UTF-8 string
    Utf8(std::str::Utf8Error),

    /// Invalid enum tag
    InvalidTag((&'static str, u8)),

    /// Invalid magic bytes or version
    InvalidHeader(&'static str),

    /// Invalid file trailer
    InvalidTrailer(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DecodeError({})",
            match self {
                Self::Io(e) => e.to_string(),
                e => format!("{e:?}"),
            }
        )
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<std::str::Utf8Error> for DecodeError {
    fn from(value: std::str::Utf8Error) -> Self {
        Self::Utf8(value)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Utf8(e) => Some(e),
            _ => None,
        }
    }
}

/// Trait to serialize stuff
pub trait Encode {
    /// Serializes into writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into vector.
    #[allow(clippy::expect_used)]
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_into(&mut v).expect("cannot fail");
        v
    }
}

/// Trait to deserialize stuff
pub trait Decode {
    /// Deserializes from reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}

/// Reads a varint-length-prefixed UTF-8 string.
pub fn read_string<R: Read>(reader: &mut R) -> Result<String, DecodeError> {
    use varint_rs::VarintReader;

    let len = reader.read_u32_varint()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;

    let s = std::str::from_utf8(&buf)?;
    Ok(s.into())
}

/// Writes a varint-length-prefixed UTF-8 string.
pub fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<(), EncodeError> {
    use varint_rs::VarintWriter;

    // NOTE: Identity strings are limited to 2^16 bytes
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32_varint(s.len() as u32)?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}
