// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::path::Path;

pub const MAGIC_BYTES: [u8; 4] = *b"SPCT";

pub const FORMAT_VERSION: u8 = 1;

/// File name of the catalog journal inside the catalog directory.
pub const CATALOG_JOURNAL_FILE: &str = "catalog.log";

/// Suffix of an open (not yet sealed) segment file.
pub const TMP_SUFFIX: &str = "tmp";

/// Suffix of a quarantined segment file.
pub const BAD_SUFFIX: &str = "bad";

/// Builds the file name of a sealed segment.
#[must_use]
pub fn segment_file_name(id: u64) -> String {
    format!("seg-{id}.dat")
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    let file = std::fs::File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory<P: AsRef<Path>>(_path: P) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}
