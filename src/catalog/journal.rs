// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{event::UnixTimestamp, SegmentId, TimeRange};
use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::Path,
};

/// A segment surviving journal replay
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReplayedSegment {
    /// Segment id
    pub id: SegmentId,

    /// Time range recorded at registration
    pub time_range: TimeRange,

    /// Size recorded at registration
    pub size: u64,
}

/// Append-only catalog journal
///
/// One line per mutation:
///
/// ```text
/// REGISTER <id> <min_ts> <max_ts> <size>
/// DELETE <id>
/// ```
///
/// The catalog is rebuilt on startup by replaying the journal and
/// cross-checking file existence. Journal write failures are fatal to
/// the store.
#[derive(Debug)]
pub struct Journal {
    file: File,
}

impl Journal {
    /// Opens (or creates) the journal in append mode.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Appends a REGISTER line and fsyncs.
    pub fn register(
        &mut self,
        id: SegmentId,
        time_range: TimeRange,
        size: u64,
    ) -> crate::Result<()> {
        writeln!(
            self.file,
            "REGISTER {id} {} {} {size}",
            time_range.min(),
            time_range.max(),
        )?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Appends a DELETE line and fsyncs.
    pub fn delete(&mut self, id: SegmentId) -> crate::Result<()> {
        writeln!(self.file, "DELETE {id}")?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Replays the journal, returning the surviving segments in
    /// registration order.
    ///
    /// # Errors
    ///
    /// A malformed line fails with [`crate::Error::CorruptCatalog`];
    /// the journal is never silently skipped over.
    pub fn replay<P: AsRef<Path>>(path: P) -> crate::Result<Vec<ReplayedSegment>> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(vec![]);
        }

        let reader = BufReader::new(File::open(path)?);
        let mut segments: Vec<ReplayedSegment> = Vec::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;

            if line.is_empty() {
                continue;
            }

            let mut parts = line.split_whitespace();

            let corrupt =
                || crate::Error::CorruptCatalog(format!("line {}: {line:?}", line_no + 1));

            match parts.next() {
                Some("REGISTER") => {
                    let id = parse(parts.next()).ok_or_else(corrupt)?;
                    let min_ts: UnixTimestamp = parse(parts.next()).ok_or_else(corrupt)?;
                    let max_ts: UnixTimestamp = parse(parts.next()).ok_or_else(corrupt)?;
                    let size = parse(parts.next()).ok_or_else(corrupt)?;

                    if parts.next().is_some() || min_ts > max_ts {
                        return Err(corrupt());
                    }

                    segments.retain(|s| s.id != id);
                    segments.push(ReplayedSegment {
                        id,
                        time_range: TimeRange::new(min_ts, max_ts),
                        size,
                    });
                }

                Some("DELETE") => {
                    let id: SegmentId = parse(parts.next()).ok_or_else(corrupt)?;

                    if parts.next().is_some() {
                        return Err(corrupt());
                    }

                    segments.retain(|s| s.id != id);
                }

                _ => return Err(corrupt()),
            }
        }

        Ok(segments)
    }
}

fn parse<T: std::str::FromStr>(part: Option<&str>) -> Option<T> {
    part.and_then(|s| s.parse().ok())
}
