//! Request admission: rate limit first, then circuit isolation

use crate::{
    config::GuardConfig,
    errors::GuardError,
    registry::{CircuitBreakerRegistry, RateLimiterRegistry},
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Runs upstream calls on behalf of a client
///
/// A call is first admitted by the client's rate limiter and then passes
/// through the dependency's circuit breaker. Rejected requests never reach
/// the breaker, so they do not count as calls against the dependency.
///
/// ```rust
/// use market_guard::{Gate, GuardConfig, GuardError};
///
/// let gate = Gate::from_config(&GuardConfig::default());
///
/// let quote = gate.execute("10.0.0.1", "kiwoom", || Ok::<_, String>(71_200.0));
/// assert_eq!(quote.ok(), Some(71_200.0));
/// ```
#[derive(Debug, Clone)]
pub struct Gate {
    limiters: Arc<RateLimiterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl Gate {
    pub fn new(limiters: Arc<RateLimiterRegistry>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { limiters, breakers }
    }

    pub fn from_config(config: &GuardConfig) -> Self {
        Self::new(
            Arc::new(config.limiter_registry()),
            Arc::new(config.breaker_registry()),
        )
    }

    pub fn limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiters
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn execute<T, E, F>(&self, client_key: &str, dependency: &str, f: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display + 'static,
    {
        self.limiters.check(client_key)?;
        let breaker = self.breakers.get_or_create(dependency);
        breaker.call(f).map_err(GuardError::Circuit)
    }

    pub async fn execute_async<T, E, F, Fut>(
        &self,
        client_key: &str,
        dependency: &str,
        f: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display + 'static,
    {
        self.limiters.check(client_key)?;
        let breaker = self.breakers.get_or_create(dependency);
        breaker.call_async(f).await.map_err(GuardError::Circuit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Config;
    use crate::errors::CircuitError;
    use crate::limiter::RateLimitConfig;

    fn gate(max_requests: usize, failure_threshold: usize) -> Gate {
        Gate::from_config(&GuardConfig {
            circuit_defaults: Config {
                failure_threshold,
                ..Default::default()
            },
            rate_limit: RateLimitConfig {
                max_requests,
                window_secs: 60.0,
            },
            ..Default::default()
        })
    }

    #[test]
    fn test_rate_limit_applies_before_breaker() {
        let gate = gate(1, 5);

        assert!(gate.execute("10.0.0.1", "kiwoom", || Ok::<_, &str>(1)).is_ok());

        let err = gate
            .execute("10.0.0.1", "kiwoom", || Ok::<_, &str>(2))
            .unwrap_err();
        assert_eq!(err.status_code(), Some(429));

        let stats = gate.breakers().get_or_create("kiwoom").stats();
        assert_eq!(stats.total_calls, 1);
    }

    #[test]
    fn test_open_circuit_maps_to_503() {
        let gate = gate(100, 1);

        let err = gate
            .execute("10.0.0.1", "scoring", || Err::<(), _>("boom"))
            .unwrap_err();
        assert_eq!(err.status_code(), None);
        assert!(matches!(err, GuardError::Circuit(CircuitError::Execution("boom"))));

        let err = gate
            .execute("10.0.0.2", "scoring", || Ok::<_, &str>(()))
            .unwrap_err();
        assert_eq!(err.status_code(), Some(503));
    }

    #[tokio::test]
    async fn test_execute_async() {
        let gate = gate(2, 5);

        let value = gate
            .execute_async("api-key-1", "quotes", || async { Ok::<_, &str>("tick") })
            .await;
        assert_eq!(value.ok(), Some("tick"));
        assert_eq!(gate.limiters().limiter("api-key-1").remaining_requests(), 1);
    }
}
