// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// A CRC32 checksum
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Checksum(u32);

impl std::ops::Deref for Checksum {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl Checksum {
    /// Wraps a checksum value.
    #[must_use]
    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Computes the checksum of a byte slice.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(crc32fast::hash(bytes))
    }
}

/// Writer shim that checksums everything written through it.
pub struct ChecksummedWriter<W: std::io::Write> {
    inner: W,
    hasher: crc32fast::Hasher,
}

impl<W: std::io::Write> ChecksummedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: writer,
            hasher: crc32fast::Hasher::new(),
        }
    }

    pub fn checksum(&self) -> Checksum {
        Checksum(self.hasher.clone().finalize())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: std::io::Write> std::io::Write for ChecksummedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;

        // NOTE: Only hash the bytes that were actually accepted
        #[allow(clippy::indexing_slicing)]
        self.hasher.update(&buf[..n]);

        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
