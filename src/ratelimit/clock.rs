//! Timestamp sources for the rate limiters.
//!
//! Limiters work on `f64` seconds. Timestamps handed to a single limiter must
//! be non-decreasing, which a monotonic clock provides.

use std::time::Instant;

/// A source of timestamps in seconds.
pub trait Clock: Send + Sync {
    /// Current time in seconds since an arbitrary fixed origin.
    fn now(&self) -> f64;
}

/// Monotonic clock measuring seconds since its creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually driven clock for tests.
///
/// Clones share the same time value.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    current: std::sync::Arc<parking_lot::Mutex<f64>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            current: std::sync::Arc::new(parking_lot::Mutex::new(start)),
        }
    }

    pub fn advance(&self, seconds: f64) {
        *self.current.lock() += seconds;
    }

    pub fn set(&self, seconds: f64) {
        *self.current.lock() = seconds;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.current.lock()
    }
}
