//! Injectable time source
//!
//! Breaker cooldowns, cache ages, probe schedules, and predictive windows
//! are all measured against this trait so tests can drive time explicitly
//! instead of sleeping.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time source used by every stateful component in the engine
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic now, used for intervals, cooldowns, and ages
    fn now(&self) -> Instant;

    /// Wall-clock now, used for record and event timestamps
    fn timestamp(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Production clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually-advanced clock for tests
///
/// Clones share the same offset, so a clock handed to the engine can be
/// advanced from the test body.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move time forward by `by`
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}
