// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

/// Why a stop was requested
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StopCause {
    /// The caller gave up on the operation (query cancellation)
    Cancel,

    /// Graceful shutdown is draining the components
    Shutdown,

    /// An interrupt signal was received; the host binary exits 130
    Interrupt,
}

const RUNNING: u8 = 0;

/// Cheaply clonable one-way stop flag that remembers its cause.
///
/// Used as the cancellation token of queries (checked at block
/// boundaries) and as the shutdown signal of background workers.
/// The first cause wins; later sends are ignored, so a query that is
/// cancelled during shutdown still reports the shutdown cause to the
/// exit-code mapping.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicU8>);

impl StopSignal {
    /// Raises the signal as a caller cancellation.
    pub fn send(&self) {
        self.send_with(StopCause::Cancel);
    }

    /// Raises the signal with an explicit cause.
    ///
    /// Only the first cause is kept.
    pub fn send_with(&self, cause: StopCause) {
        let value = match cause {
            StopCause::Cancel => 1,
            StopCause::Shutdown => 2,
            StopCause::Interrupt => 3,
        };

        self.0
            .compare_exchange(RUNNING, value, Ordering::AcqRel, Ordering::Acquire)
            .ok();
    }

    /// Returns `true` if the signal was raised.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire) != RUNNING
    }

    /// Returns why the signal was raised, if it was.
    #[must_use]
    pub fn cause(&self) -> Option<StopCause> {
        match self.0.load(Ordering::Acquire) {
            1 => Some(StopCause::Cancel),
            2 => Some(StopCause::Shutdown),
            3 => Some(StopCause::Interrupt),
            _ => None,
        }
    }
}
