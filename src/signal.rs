// src/signal.rs
//
// Cross-thread signals of the tuning session.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

/// Longest uninterrupted sleep of a stop-aware wait.
const SLEEP_CHUNK: Duration = Duration::from_millis(10);

/// "Re-tune as soon as possible" flag.
///
/// Set by note-on handlers, consumed by the tuning loop. Several requests
/// before the next poll collapse into one pass.
#[derive(Debug, Default)]
pub struct TuningRequest {
    requested: AtomicBool,
}

impl TuningRequest {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn set(&self) {
        self.requested.store(true, Ordering::Release);
    }

    /// Test-and-clear.
    #[inline]
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Cooperative cancellation token shared by every task of a session.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Sleep for `duration`, waking early once the signal fires.
    ///
    /// Returns `true` if the signal fired.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(SLEEP_CHUNK));
        }
    }
}
