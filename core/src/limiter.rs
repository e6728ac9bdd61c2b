//! Sliding-window rate limiter
//!
//! Each limiter tracks one client key and keeps the timestamps of the requests
//! it admitted inside the trailing window. Expired entries are pruned on every
//! read, so an idle limiter heals the next time it is touched.

use crate::clock::{Clock, MonotonicClock, unix_now};
use crate::errors::RateLimitExceeded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Quota for one client key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests admitted per window; 0 rejects everything
    pub max_requests: usize,
    pub window_secs: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_secs: 60.0,
        }
    }
}

/// Quota snapshot returned for an admitted request
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStatus {
    pub limit: usize,
    pub remaining: usize,
    /// Time until the oldest admitted request leaves the window
    pub reset_after: Duration,
    /// Unix seconds at which that happens
    pub reset_at: u64,
}

impl RateLimitStatus {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.to_string()),
        ]
    }
}

/// Sliding-window limiter for a single key
#[derive(Debug)]
pub struct RateLimiter {
    key: String,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    history: Mutex<VecDeque<f64>>,
}

impl RateLimiter {
    pub fn new(key: impl Into<String>, config: RateLimitConfig) -> Self {
        Self::with_clock(key, config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(key: impl Into<String>, config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            key: key.into(),
            config,
            clock,
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit the request if the window has room, recording it
    ///
    /// Rejected attempts are not recorded.
    pub fn is_allowed(&self) -> bool {
        self.check().is_ok()
    }

    /// Like [`is_allowed`](Self::is_allowed), with quota details either way
    pub fn check(&self) -> Result<RateLimitStatus, RateLimitExceeded> {
        let mut history = self.history.lock();
        let now = self.clock.now();
        self.prune(&mut history, now);

        if history.len() < self.config.max_requests {
            history.push_back(now);
            let reset_after = self.reset_after(&history, now);
            return Ok(RateLimitStatus {
                limit: self.config.max_requests,
                remaining: self.config.max_requests - history.len(),
                reset_after,
                reset_at: unix_at(reset_after),
            });
        }

        let retry_after = self.reset_after(&history, now);
        debug!(
            key = %self.key,
            limit = self.config.max_requests,
            retry_after_secs = retry_after.as_secs_f64(),
            "rate limit exceeded"
        );
        Err(RateLimitExceeded {
            key: self.key.clone(),
            limit: self.config.max_requests,
            retry_after,
            reset_at: unix_at(retry_after),
        })
    }

    pub fn remaining_requests(&self) -> usize {
        let mut history = self.history.lock();
        self.prune(&mut history, self.clock.now());
        self.config.max_requests.saturating_sub(history.len())
    }

    /// Clock reading at which the oldest retained request leaves the window,
    /// or now when nothing is retained
    pub fn reset_time(&self) -> f64 {
        let mut history = self.history.lock();
        let now = self.clock.now();
        self.prune(&mut history, now);
        history
            .front()
            .map(|oldest| oldest + self.config.window_secs)
            .unwrap_or(now)
    }

    /// Time until [`reset_time`](Self::reset_time)
    pub fn retry_after(&self) -> Duration {
        let mut history = self.history.lock();
        let now = self.clock.now();
        self.prune(&mut history, now);
        self.reset_after(&history, now)
    }

    pub fn reset(&self) {
        self.history.lock().clear();
    }

    /// True once every admitted request has left the window
    pub fn is_idle(&self) -> bool {
        let mut history = self.history.lock();
        self.prune(&mut history, self.clock.now());
        history.is_empty()
    }

    fn prune(&self, history: &mut VecDeque<f64>, now: f64) {
        let cutoff = now - self.config.window_secs;
        while history.front().is_some_and(|&t| t <= cutoff) {
            history.pop_front();
        }
    }

    fn reset_after(&self, history: &VecDeque<f64>, now: f64) -> Duration {
        let secs = history
            .front()
            .map(|oldest| oldest + self.config.window_secs - now)
            .unwrap_or(0.0);
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}

fn unix_at(after: Duration) -> u64 {
    (unix_now() + after.as_secs_f64()).ceil() as u64
}
