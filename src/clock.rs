//! Timestamp clock
//!
//! Every component that needs "now" receives a [`Clock`] instead of reading the
//! system time directly, so recordings can be simulated deterministically.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Timestamp;

/// Source of wall-clock milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    /// Current time in ms; never decreases between calls
    fn now(&self) -> Timestamp;
}

/// Clock backed by the system wall clock
///
/// The system clock can step backwards (NTP adjustments); the last returned
/// value is kept so `now()` stays non-decreasing.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_bits: AtomicU64,
}

impl SystemClock {
    /// Create a new system clock
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = chrono::Utc::now().timestamp_micros() as f64 / 1000.0;
        let mut current = self.last_bits.load(Ordering::Acquire);
        loop {
            let last = f64::from_bits(current);
            if wall <= last {
                return last;
            }
            match self.last_bits.compare_exchange_weak(
                current,
                wall.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return wall,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Manually driven clock for tests and simulated acquisitions
#[derive(Debug, Default)]
pub struct ManualClock {
    now_bits: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at `start` ms
    pub fn new(start: Timestamp) -> Self {
        Self {
            now_bits: AtomicU64::new(start.to_bits()),
        }
    }

    /// Set the current time; earlier values are ignored
    pub fn set(&self, t: Timestamp) {
        let _ = self
            .now_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                (t > f64::from_bits(bits)).then(|| t.to_bits())
            });
    }

    /// Advance the clock by `ms`
    pub fn advance(&self, ms: f64) {
        self.set(self.now() + ms.max(0.0));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        f64::from_bits(self.now_bits.load(Ordering::Acquire))
    }
}

/// Format a timestamp the way session ids embed it (`YYYYMMDDTHHMMSS`, UTC)
pub fn format_compact(t: Timestamp) -> String {
    chrono::DateTime::from_timestamp_millis(t as i64)
        .map(|dt| dt.format("%Y%m%dT%H%M%S").to_string())
        .unwrap_or_else(|| "00000000T000000".to_string())
}

/// Convert a timestamp to a UTC date-time
pub fn to_datetime(t: Timestamp) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(t as i64).unwrap_or_default()
}
