//! Clock seam for the polling loops.
//!
//! The coordinator's barrier and election states busy-wait with a fixed
//! backoff. Routing the sleeps through a trait keeps the state machine
//! testable without real time passing.

use std::sync::Mutex;
use std::time::Duration;

/// Trait for timing operations used by the coordinator's poll loops.
pub trait Clock: Send + Sync {
    /// Blocks the calling worker for the given duration.
    fn sleep(&self, duration: Duration);
}

/// Production clock backed by `std::thread::sleep`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Test clock that records requested sleeps and returns immediately.
#[derive(Default)]
pub struct MockClock {
    slept: Mutex<Vec<Duration>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }

    pub fn sleep_count(&self) -> usize {
        self.slept.lock().unwrap().len()
    }
}

impl Clock for MockClock {
    fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}
