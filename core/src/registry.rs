//! Keyed factories for limiters and breakers
//!
//! Construct one registry of each kind at process start and pass it by
//! reference to whatever needs it. Lookups are memoized by key and creation is
//! atomic, so concurrent first use of a key never produces two instances.

use crate::{
    callbacks::Callbacks,
    circuit::{CircuitBreaker, CircuitStats, Config},
    clock::{Clock, MonotonicClock},
    errors::RateLimitExceeded,
    history::{CallHistory, MemoryHistory},
    limiter::{RateLimitConfig, RateLimitStatus, RateLimiter},
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Per-client rate limiters, created lazily on first use
#[derive(Debug)]
pub struct RateLimiterRegistry {
    defaults: RateLimitConfig,
    clock: Arc<dyn Clock>,
    limiters: DashMap<String, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new(defaults: RateLimitConfig) -> Self {
        Self::with_clock(defaults, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(defaults: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            defaults,
            clock,
            limiters: DashMap::new(),
        }
    }

    pub fn defaults(&self) -> &RateLimitConfig {
        &self.defaults
    }

    /// Limiter for `key`, creating it with the given overrides if absent
    ///
    /// Overrides only apply on creation: the first caller's quota sticks.
    pub fn get_or_create(
        &self,
        key: &str,
        max_requests: Option<usize>,
        window_secs: Option<f64>,
    ) -> Arc<RateLimiter> {
        let entry = self.limiters.entry(key.to_string()).or_insert_with(|| {
            let config = RateLimitConfig {
                max_requests: max_requests.unwrap_or(self.defaults.max_requests),
                window_secs: window_secs.unwrap_or(self.defaults.window_secs),
            };
            debug!(key, max_requests = config.max_requests, window_secs = config.window_secs, "rate limiter created");
            Arc::new(RateLimiter::with_clock(key, config, Arc::clone(&self.clock)))
        });
        Arc::clone(entry.value())
    }

    /// Limiter for `key` with the default quota
    pub fn limiter(&self, key: &str) -> Arc<RateLimiter> {
        self.get_or_create(key, None, None)
    }

    pub fn is_allowed(&self, key: &str) -> bool {
        self.limiter(key).is_allowed()
    }

    pub fn check(&self, key: &str) -> Result<RateLimitStatus, RateLimitExceeded> {
        self.limiter(key).check()
    }

    pub fn get(&self, key: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, key: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.remove(key).map(|(_, limiter)| limiter)
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    pub fn reset_all(&self) {
        for entry in self.limiters.iter() {
            entry.value().reset();
        }
    }

    /// Drop limiters whose window is empty; returns how many were removed
    pub fn evict_idle(&self) -> usize {
        let before = self.limiters.len();
        self.limiters.retain(|_, limiter| !limiter.is_idle());
        let evicted = before.saturating_sub(self.limiters.len());
        if evicted > 0 {
            debug!(evicted, "idle rate limiters evicted");
        }
        evicted
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

/// Circuit breakers per upstream dependency
///
/// Every breaker handed out shares the registry's call history and
/// transition hooks.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    defaults: Config,
    overrides: HashMap<String, Config>,
    history: Arc<dyn CallHistory>,
    callbacks: Callbacks,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: Config) -> Self {
        Self::with_history(defaults, Arc::new(MemoryHistory::new()))
    }

    pub fn with_history(defaults: Config, history: Arc<dyn CallHistory>) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            history,
            callbacks: Callbacks::new(),
            breakers: DashMap::new(),
        }
    }

    /// Configuration used instead of the defaults when `name` is first created
    pub fn with_override(mut self, name: impl Into<String>, config: Config) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn history(&self) -> &Arc<dyn CallHistory> {
        &self.history
    }

    /// Breaker for `name`, using its configured override or the defaults
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        let config = self.overrides.get(name).unwrap_or(&self.defaults).clone();
        self.get_or_create_with(name, config)
    }

    /// Breaker for `name`; `config` only applies if the breaker is new
    pub fn get_or_create_with(&self, name: &str, config: Config) -> Arc<CircuitBreaker> {
        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(circuit = name, "circuit breaker created");
            Arc::new(
                CircuitBreaker::builder(name)
                    .config(config)
                    .history(Arc::clone(&self.history))
                    .callbacks(self.callbacks.clone())
                    .build(),
            )
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Names of every breaker created so far, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Stats for every breaker, sorted by name
    pub fn all_stats(&self) -> Vec<CircuitStats> {
        // Snapshot first; stats() may fire hooks that call back into the registry.
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| Arc::clone(e.value())).collect();
        let mut stats: Vec<CircuitStats> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| Arc::clone(e.value())).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
