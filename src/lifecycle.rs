// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{
    sync::{atomic::AtomicBool, Arc},
    time::{Duration, Instant},
};

/// Exit codes of the host binary
pub mod exit_code {
    /// Normal termination
    pub const SUCCESS: i32 = 0;

    /// Unrecoverable storage error at startup
    pub const STORAGE_ERROR: i32 = 1;

    /// Catalog journal could not be parsed
    pub const CORRUPT_CATALOG: i32 = 2;

    /// Interrupted by a signal
    pub const INTERRUPTED: i32 = 130;

    /// Maps a startup error to its exit code.
    #[must_use]
    pub fn for_error(error: &crate::Error) -> i32 {
        match error {
            crate::Error::CorruptCatalog(_) => CORRUPT_CATALOG,
            crate::Error::Cancelled => INTERRUPTED,
            _ => STORAGE_ERROR,
        }
    }

    /// Maps the cause recorded in a stop signal to the exit code of a
    /// graceful termination.
    #[must_use]
    pub fn for_signal(signal: &crate::StopSignal) -> i32 {
        match signal.cause() {
            Some(crate::StopCause::Interrupt) => INTERRUPTED,
            _ => SUCCESS,
        }
    }
}

/// Overall deadline for a graceful stop
pub const DEFAULT_STOP_DEADLINE: Duration = Duration::from_secs(10);

/// A startable/stoppable unit managed by the [`Lifecycle`]
///
/// Both operations must be idempotent.
pub trait Component: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &'static str;

    /// Starts the component.
    fn start(&self) -> crate::Result<()>;

    /// Stops the component, finishing within `deadline`.
    fn stop(&self, deadline: Duration) -> crate::Result<()>;
}

/// Starts components in dependency order and stops them in reverse
///
/// Start order is registration order (storage before ingestion before
/// any façade). Stop walks backwards under one overall deadline; a
/// component missing its share is logged loudly and abandoned -
/// truncation of unsealed data is covered by watch replay.
#[derive(Default)]
pub struct Lifecycle {
    components: Vec<Arc<dyn Component>>,
    started: AtomicBool,
}

impl Lifecycle {
    /// Creates an empty lifecycle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component; start order is registration order.
    pub fn register(&mut self, component: Arc<dyn Component>) {
        self.components.push(component);
    }

    /// Starts all components sequentially.
    ///
    /// On failure, the already started components are stopped in
    /// reverse order before the error is returned.
    pub fn start(&self) -> crate::Result<()> {
        if self.started.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }

        for (idx, component) in self.components.iter().enumerate() {
            log::info!("Starting {}", component.name());

            if let Err(e) = component.start() {
                log::error!("Starting {} failed: {e}", component.name());

                for started in self.components.iter().take(idx).rev() {
                    started.stop(DEFAULT_STOP_DEADLINE).ok();
                }

                self.started
                    .store(false, std::sync::atomic::Ordering::SeqCst);

                return Err(e);
            }
        }

        Ok(())
    }

    /// Stops all components in reverse order with the default deadline.
    pub fn stop(&self) -> crate::Result<()> {
        self.stop_with_deadline(DEFAULT_STOP_DEADLINE)
    }

    /// Stops all components in reverse order within `deadline`.
    pub fn stop_with_deadline(&self, deadline: Duration) -> crate::Result<()> {
        if !self.started.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }

        let started = Instant::now();
        let mut first_error = None;

        for component in self.components.iter().rev() {
            let remaining = deadline.saturating_sub(started.elapsed());

            if remaining.is_zero() {
                log::error!(
                    "Shutdown deadline exhausted, {} stops forcefully",
                    component.name(),
                );
            }

            log::info!("Stopping {}", component.name());

            if let Err(e) = component.stop(remaining) {
                log::error!("Stopping {} failed: {e}", component.name());
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use test_log::test;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
    }

    impl Component for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn start(&self) -> crate::Result<()> {
            self.log
                .lock()
                .map(|mut l| l.push(format!("start {}", self.name)))
                .ok();

            if self.fail_start {
                return Err(crate::Error::InvalidRequest("boom"));
            }

            Ok(())
        }

        fn stop(&self, _deadline: Duration) -> crate::Result<()> {
            self.log
                .lock()
                .map(|mut l| l.push(format!("stop {}", self.name)))
                .ok();
            Ok(())
        }
    }

    #[test]
    fn lifecycle_start_stop_order() -> crate::Result<()> {
        let log = Arc::new(Mutex::new(vec![]));

        let mut lifecycle = Lifecycle::new();
        for name in ["storage", "ingest", "facade"] {
            lifecycle.register(Arc::new(Recorder {
                name,
                log: Arc::clone(&log),
                fail_start: false,
            }));
        }

        lifecycle.start()?;
        lifecycle.stop()?;

        let recorded = log.lock().map(|l| l.clone()).unwrap_or_default();
        assert_eq!(
            vec![
                "start storage",
                "start ingest",
                "start facade",
                "stop facade",
                "stop ingest",
                "stop storage",
            ],
            recorded
        );

        Ok(())
    }

    #[test]
    fn lifecycle_start_failure_unwinds() {
        let log = Arc::new(Mutex::new(vec![]));

        let mut lifecycle = Lifecycle::new();
        lifecycle.register(Arc::new(Recorder {
            name: "storage",
            log: Arc::clone(&log),
            fail_start: false,
        }));
        lifecycle.register(Arc::new(Recorder {
            name: "ingest",
            log: Arc::clone(&log),
            fail_start: true,
        }));

        assert!(lifecycle.start().is_err());

        let recorded = log.lock().map(|l| l.clone()).unwrap_or_default();
        assert_eq!(
            vec!["start storage", "start ingest", "stop storage"],
            recorded
        );
    }

    #[test]
    fn lifecycle_stop_is_idempotent() -> crate::Result<()> {
        struct Counting(AtomicUsize);

        impl Component for Counting {
            fn name(&self) -> &'static str {
                "counting"
            }

            fn start(&self) -> crate::Result<()> {
                Ok(())
            }

            fn stop(&self, _deadline: Duration) -> crate::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let component = Arc::new(Counting(AtomicUsize::new(0)));

        let mut lifecycle = Lifecycle::new();
        lifecycle.register(Arc::clone(&component) as Arc<dyn Component>);

        lifecycle.start()?;
        lifecycle.stop()?;
        lifecycle.stop()?;

        assert_eq!(1, component.0.load(Ordering::SeqCst));

        Ok(())
    }

    #[test]
    fn exit_codes() {
        assert_eq!(0, exit_code::SUCCESS);
        assert_eq!(
            exit_code::CORRUPT_CATALOG,
            exit_code::for_error(&crate::Error::CorruptCatalog("x".into()))
        );
        assert_eq!(
            exit_code::STORAGE_ERROR,
            exit_code::for_error(&crate::Error::NotFound)
        );
        assert_eq!(
            exit_code::INTERRUPTED,
            exit_code::for_error(&crate::Error::Cancelled)
        );
    }

    #[test]
    fn exit_code_follows_stop_cause() {
        let interrupted = crate::StopSignal::default();
        interrupted.send_with(crate::StopCause::Interrupt);
        assert_eq!(exit_code::INTERRUPTED, exit_code::for_signal(&interrupted));

        let graceful = crate::StopSignal::default();
        graceful.send_with(crate::StopCause::Shutdown);
        assert_eq!(exit_code::SUCCESS, exit_code::for_signal(&graceful));

        // Never raised: a clean run
        assert_eq!(
            exit_code::SUCCESS,
            exit_code::for_signal(&crate::StopSignal::default())
        );
    }
}
