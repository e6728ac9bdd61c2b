//! Fluent construction of circuit breakers

use crate::{
    MemoryHistory,
    callbacks::Callbacks,
    circuit::{CircuitBreaker, CircuitContext, Config, HalfOpenFailurePolicy, Tally},
    classifier::FailureClassifier,
    clock::Clock,
    history::CallHistory,
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`CircuitBreaker`]
pub struct CircuitBuilder {
    name: String,
    config: Config,
    history: Option<Arc<dyn CallHistory>>,
    clock: Option<Arc<dyn Clock>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
}

impl CircuitBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::default(),
            history: None,
            clock: None,
            failure_classifier: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Failures that open the circuit (at least 1)
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.config.failure_threshold = threshold.max(1);
        self
    }

    pub fn recovery_timeout_secs(mut self, seconds: f64) -> Self {
        self.config.recovery_timeout_secs = seconds.max(0.0);
        self
    }

    pub fn recovery_timeout(self, timeout: Duration) -> Self {
        self.recovery_timeout_secs(timeout.as_secs_f64())
    }

    /// Probe budget in half-open, also the number of successes that close it
    pub fn half_open_max_calls(mut self, calls: usize) -> Self {
        self.config.half_open_max_calls = calls.max(1);
        self
    }

    pub fn failure_window_secs(mut self, seconds: f64) -> Self {
        self.config.failure_window_secs = seconds.max(0.0);
        self
    }

    pub fn half_open_failure_policy(mut self, policy: HalfOpenFailurePolicy) -> Self {
        self.config.half_open_failure_policy = policy;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Share a call history between breakers
    ///
    /// Takes precedence over [`clock`](Self::clock); time is read from the
    /// history.
    pub fn history(mut self, history: Arc<dyn CallHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Time source for the breaker's private history
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Decide which errors count toward opening the circuit
    ///
    /// ```rust
    /// use market_guard::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    ///
    /// let circuit = CircuitBreaker::builder("kiwoom")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only slow errors count
    ///         ctx.duration > 1.0
    ///     })))
    ///     .build();
    /// # assert!(circuit.is_closed());
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Replace every transition hook at once
    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> CircuitBreaker {
        let history = match (self.history, self.clock) {
            (Some(history), _) => history,
            (None, Some(clock)) => Arc::new(MemoryHistory::new().with_clock(clock)),
            (None, None) => Arc::new(MemoryHistory::new()),
        };

        // Whole configs from `config()` or a registry get the same clamps as the setters.
        let mut config = self.config;
        config.failure_threshold = config.failure_threshold.max(1);
        config.half_open_max_calls = config.half_open_max_calls.max(1);
        config.recovery_timeout_secs = config.recovery_timeout_secs.max(0.0);
        config.failure_window_secs = config.failure_window_secs.max(0.0);
        config.jitter_factor = config.jitter_factor.clamp(0.0, 1.0);

        let context = CircuitContext {
            name: self.name,
            config,
            history,
            tally: Arc::new(Tally::default()),
            failure_classifier: self.failure_classifier,
        };

        CircuitBreaker::with_context_and_callbacks(context, self.callbacks)
    }
}
