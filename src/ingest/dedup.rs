// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Event;
use quick_cache::sync::Cache;

/// Bounded LRU over recently seen (uid, verb, ts) triples
///
/// Watch reconnects replay events; exact re-emits within the window
/// collapse to one stored event.
pub struct DedupWindow {
    cache: Cache<(String, u8, u64), ()>,
}

impl DedupWindow {
    /// Creates a window remembering up to `capacity` recent triples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Cache::new(capacity),
        }
    }

    /// Records the event and returns `true` if it was already seen
    /// within the window.
    pub fn seen(&self, event: &Event) -> bool {
        let key = (event.identity.uid.clone(), u8::from(event.verb), event.ts);

        if self.cache.get(&key).is_some() {
            return true;
        }

        self.cache.insert(key, ());

        false
    }
}
