//! Time sources for breakers and limiters
//!
//! Everything in this crate measures time as `f64` seconds since the clock's
//! anchor. Production code uses [`MonotonicClock`] so NTP adjustments never
//! reopen or starve a window; tests drive a [`ManualClock`] instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of monotonic time in seconds
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Seconds elapsed since the clock's anchor
    fn now(&self) -> f64;
}

/// Clock backed by `std::time::Instant`
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start_time: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
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
        self.start_time.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock with microsecond resolution
///
/// ```rust
/// use market_guard::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// clock.advance(1.5);
/// assert_eq!(clock.now(), 1.5);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward by `seconds`
    pub fn advance(&self, seconds: f64) {
        let delta = (seconds.max(0.0) * 1_000_000.0).round() as u64;
        self.micros.fetch_add(delta, Ordering::SeqCst);
    }

    /// Jump to an absolute reading
    pub fn set(&self, seconds: f64) {
        let micros = (seconds.max(0.0) * 1_000_000.0).round() as u64;
        self.micros.store(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
}

/// Wall-clock time as unix seconds
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Apply jitter to a delay using the chrono-machines policy formula
///
/// The result lies in `base * (1 - jitter) ..= base`. A `jitter_factor` of
/// zero returns `base` unchanged.
pub fn jittered(base: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return base;
    }

    let base_ms = base.as_millis() as u64;
    let policy = chrono_machines::Policy {
        max_attempts: 1,
        base_delay_ms: base_ms,
        multiplier: 1.0,
        max_delay_ms: base_ms,
    };
    Duration::from_millis(policy.calculate_delay(1, jitter_factor.min(1.0)))
}
