// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Gets the unix timestamp in seconds
#[allow(clippy::expect_used)]
pub fn unix_timestamp() -> u64 {
    let now = std::time::SystemTime::now();

    now.duration_since(std::time::SystemTime::UNIX_EPOCH)
        .expect("time went backwards")
        .as_secs()
}
