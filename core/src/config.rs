//! Guard configuration loaded from JSON
//!
//! ```json
//! {
//!   "circuit_defaults": { "failure_threshold": 5, "recovery_timeout_secs": 60.0 },
//!   "circuits": { "kiwoom": { "failure_threshold": 3, "half_open_max_calls": 1 } },
//!   "rate_limit": { "max_requests": 100, "window_secs": 60.0 }
//! }
//! ```
//!
//! Every field is optional. A per-circuit entry is a complete [`Config`]; the
//! fields it omits take the built-in defaults, not `circuit_defaults`.

use crate::circuit::Config;
use crate::limiter::RateLimitConfig;
use crate::registry::{CircuitBreakerRegistry, RateLimiterRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Breaker and limiter settings for one process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub circuit_defaults: Config,
    /// Per-dependency breaker settings keyed by circuit name
    pub circuits: HashMap<String, Config>,
    pub rate_limit: RateLimitConfig,
}

/// Load guard configuration from a JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<GuardConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_str(&content)
}

/// Load guard configuration from a JSON string
pub fn load_config_from_str(json: &str) -> Result<GuardConfig, ConfigError> {
    let config: GuardConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}

impl GuardConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_circuit("circuit_defaults", &self.circuit_defaults)?;
        for (name, config) in &self.circuits {
            validate_circuit(name, config)?;
        }

        if !(self.rate_limit.window_secs.is_finite() && self.rate_limit.window_secs > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "rate_limit.window_secs must be positive, got {}",
                self.rate_limit.window_secs
            )));
        }
        Ok(())
    }

    /// Breaker registry carrying the defaults and per-circuit overrides
    pub fn breaker_registry(&self) -> CircuitBreakerRegistry {
        self.circuits.iter().fold(
            CircuitBreakerRegistry::new(self.circuit_defaults.clone()),
            |registry, (name, config)| registry.with_override(name.clone(), config.clone()),
        )
    }

    pub fn limiter_registry(&self) -> RateLimiterRegistry {
        RateLimiterRegistry::new(self.rate_limit.clone())
    }
}

fn validate_circuit(name: &str, config: &Config) -> Result<(), ConfigError> {
    if config.failure_threshold == 0 {
        return Err(ConfigError::Invalid(format!("{name}: failure_threshold must be at least 1")));
    }
    if config.half_open_max_calls == 0 {
        return Err(ConfigError::Invalid(format!("{name}: half_open_max_calls must be at least 1")));
    }
    if !(config.recovery_timeout_secs.is_finite() && config.recovery_timeout_secs >= 0.0) {
        return Err(ConfigError::Invalid(format!(
            "{name}: recovery_timeout_secs must be a non-negative number"
        )));
    }
    if !(config.failure_window_secs.is_finite() && config.failure_window_secs >= 0.0) {
        return Err(ConfigError::Invalid(format!(
            "{name}: failure_window_secs must be a non-negative number"
        )));
    }
    if !(0.0..=1.0).contains(&config.jitter_factor) {
        return Err(ConfigError::Invalid(format!("{name}: jitter_factor must be within 0.0..=1.0")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::HalfOpenFailurePolicy;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = load_config_from_str("{}").unwrap();

        assert_eq!(config, GuardConfig::default());
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.circuit_defaults.failure_threshold, 5);
    }

    #[test]
    fn test_overrides_and_policy_parse() {
        let config = load_config_from_str(
            r#"{
                "circuit_defaults": { "recovery_timeout_secs": 30.0 },
                "circuits": {
                    "kiwoom": {
                        "failure_threshold": 3,
                        "half_open_failure_policy": "reopen_when_budget_exhausted"
                    }
                },
                "rate_limit": { "max_requests": 20, "window_secs": 1.0 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.circuit_defaults.recovery_timeout_secs, 30.0);
        let kiwoom = &config.circuits["kiwoom"];
        assert_eq!(kiwoom.failure_threshold, 3);
        assert_eq!(
            kiwoom.half_open_failure_policy,
            HalfOpenFailurePolicy::ReopenWhenBudgetExhausted
        );

        let breakers = config.breaker_registry();
        assert_eq!(breakers.get_or_create("kiwoom").config().failure_threshold, 3);
        assert_eq!(breakers.get_or_create("scoring").config().recovery_timeout_secs, 30.0);

        let limiters = config.limiter_registry();
        assert_eq!(limiters.limiter("10.0.0.1").config().max_requests, 20);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let err = load_config_from_str(r#"{ "circuits": { "kiwoom": { "failure_threshold": 0 } } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.starts_with("kiwoom")));

        let err = load_config_from_str(r#"{ "rate_limit": { "window_secs": 0.0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = load_config_from_str(r#"{ "circuit_defaults": { "jitter_factor": 1.5 } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_parse_errors_surface() {
        let err = load_config_from_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = load_config("/nonexistent/guard.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
