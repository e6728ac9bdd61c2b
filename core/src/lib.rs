//! market-guard - Resilience primitives for a market data service
//!
//! This crate protects calls to flaky upstream dependencies (broker APIs,
//! quote vendors, scoring services) and meters inbound clients:
//! - A circuit breaker per dependency (Closed → Open → HalfOpen) built on a
//!   typed state machine, with monotonic timing and transition hooks
//! - A sliding-window rate limiter per client key
//! - Registries that hand out shared instances by name, and a [`Gate`] that
//!   combines both checks for one request
//!
//! # Example
//!
//! ```rust
//! use market_guard::CircuitBreaker;
//!
//! let circuit = CircuitBreaker::builder("kiwoom")
//!     .failure_threshold(5)
//!     .recovery_timeout_secs(30.0)
//!     .half_open_max_calls(2)
//!     .on_open(|name| println!("Circuit {} opened!", name))
//!     .build();
//!
//! let result = circuit.call(|| Ok::<_, String>("quote"));
//! assert!(result.is_ok());
//!
//! if circuit.is_open() {
//!     println!("Circuit is open, serving cached data");
//! }
//! ```

pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod errors;
pub mod gate;
pub mod history;
pub mod limiter;
pub mod registry;

pub use builder::CircuitBuilder;
pub use callbacks::{Callbacks, Transition};
pub use circuit::{
    CallOptions, CircuitBreaker, CircuitState, CircuitStats, Config, FallbackContext,
    HalfOpenFailurePolicy,
};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigError, GuardConfig, load_config, load_config_from_str};
pub use errors::{CircuitError, GuardError, RateLimitExceeded};
pub use gate::Gate;
pub use history::{CallHistory, MemoryHistory};
pub use limiter::{RateLimitConfig, RateLimitStatus, RateLimiter};
pub use registry::{CircuitBreakerRegistry, RateLimiterRegistry};

/// Outcome of a protected call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// A single outcome recorded in a [`CallHistory`]
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub outcome: Outcome,
    /// Monotonic seconds on the history's clock
    pub timestamp: f64,
    pub duration: f64,
    pub message: Option<String>,
}
