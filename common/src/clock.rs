use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Source of time for every blocking wait in the controller.
///
/// All suspension points (radio polling, serial reads, accept loops, tick
/// scheduling) go through this trait so the whole loop can be driven by a
/// manual clock in tests.
pub trait Clock {
    fn monotonic_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
    fn utc_now(&self) -> DateTime<Utc>;

    fn elapsed_since(&self, start_ms: u64) -> u64 {
        self.monotonic_ms().saturating_sub(start_ms)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_ms(&self) -> u64 {
        self.origin
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    fn sleep_ms(&self, ms: u64) {
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
