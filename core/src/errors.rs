//! Error types for admission control and failure isolation

use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Errors returned by a circuit-protected call
#[derive(Debug)]
pub enum CircuitError<E = Box<dyn Error + Send + Sync>> {
    /// Circuit is open; the call was not attempted
    Open { circuit: String, opened_at: f64 },
    /// Half-open probe budget was exhausted; the call was not attempted and
    /// the circuit has been forced open again
    HalfOpenLimitReached { circuit: String },
    /// The wrapped operation failed; the error is passed through unchanged
    Execution(E),
}

impl<E> CircuitError<E> {
    /// True when the breaker refused the call without running it
    pub fn is_rejection(&self) -> bool {
        !matches!(self, CircuitError::Execution(_))
    }

    /// HTTP status a gateway should answer with, if the breaker rejected the call
    pub fn status_code(&self) -> Option<u16> {
        self.is_rejection().then_some(503)
    }

    /// Recover the wrapped operation's own error
    pub fn into_execution(self) -> Option<E> {
        match self {
            CircuitError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::Open { circuit, opened_at } => {
                write!(f, "Circuit '{}' is open (opened at {:.3})", circuit, opened_at)
            }
            CircuitError::HalfOpenLimitReached { circuit } => {
                write!(f, "Circuit '{}' half-open probe budget exhausted", circuit)
            }
            CircuitError::Execution(e) => write!(f, "{}", e),
        }
    }
}

impl<E: Error + 'static> Error for CircuitError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CircuitError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

/// A request was refused by a sliding-window rate limiter
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitExceeded {
    /// Client key the limiter is tracking (IP, API key, ...)
    pub key: String,
    /// Requests allowed per window
    pub limit: usize,
    /// Time until the oldest request in the window expires
    pub retry_after: Duration,
    /// Unix seconds at which a slot frees up
    pub reset_at: u64,
}

impl RateLimitExceeded {
    pub fn status_code(&self) -> u16 {
        429
    }

    /// Whole seconds a client should wait, rounded up
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    /// Response headers for a rejected request
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", "0".to_string()),
            ("X-RateLimit-Reset", self.reset_at.to_string()),
            ("Retry-After", self.retry_after_secs().to_string()),
        ]
    }
}

impl fmt::Display for RateLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rate limit of {} requests exceeded for '{}' (retry after {:.3}s)",
            self.limit,
            self.key,
            self.retry_after.as_secs_f64()
        )
    }
}

impl Error for RateLimitExceeded {}

/// Errors from a call routed through a [`Gate`](crate::gate::Gate)
#[derive(Debug)]
pub enum GuardError<E> {
    /// Admission denied by the client's rate limiter
    RateLimited(RateLimitExceeded),
    /// Rejected by, or failed behind, the dependency's circuit breaker
    Circuit(CircuitError<E>),
}

impl<E> GuardError<E> {
    /// HTTP status for gateway-level rejections; `None` when the upstream call
    /// itself failed and the caller decides how to map it
    pub fn status_code(&self) -> Option<u16> {
        match self {
            GuardError::RateLimited(e) => Some(e.status_code()),
            GuardError::Circuit(e) => e.status_code(),
        }
    }
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::RateLimited(e) => write!(f, "{}", e),
            GuardError::Circuit(e) => write!(f, "{}", e),
        }
    }
}

impl<E: Error + 'static> Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GuardError::RateLimited(e) => Some(e),
            GuardError::Circuit(e) => e.source(),
        }
    }
}

impl<E> From<RateLimitExceeded> for GuardError<E> {
    fn from(e: RateLimitExceeded) -> Self {
        GuardError::RateLimited(e)
    }
}

impl<E> From<CircuitError<E>> for GuardError<E> {
    fn from(e: CircuitError<E>) -> Self {
        GuardError::Circuit(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_map_to_503() {
        let open: CircuitError<String> = CircuitError::Open {
            circuit: "quotes".to_string(),
            opened_at: 1.0,
        };
        let limit: CircuitError<String> = CircuitError::HalfOpenLimitReached {
            circuit: "quotes".to_string(),
        };
        let failed: CircuitError<String> = CircuitError::Execution("boom".to_string());

        assert_eq!(open.status_code(), Some(503));
        assert_eq!(limit.status_code(), Some(503));
        assert_eq!(failed.status_code(), None);
        assert_eq!(failed.into_execution().as_deref(), Some("boom"));
    }

    #[test]
    fn test_execution_display_is_unchanged() {
        let err: CircuitError<&str> = CircuitError::Execution("upstream 502");
        assert_eq!(err.to_string(), "upstream 502");
    }

    #[test]
    fn test_rate_limit_headers() {
        let err = RateLimitExceeded {
            key: "10.0.0.1".to_string(),
            limit: 100,
            retry_after: Duration::from_millis(2500),
            reset_at: 1_700_000_003,
        };

        assert_eq!(err.status_code(), 429);
        assert_eq!(err.retry_after_secs(), 3);

        let headers = err.headers();
        assert_eq!(headers[0], ("X-RateLimit-Limit", "100".to_string()));
        assert_eq!(headers[1], ("X-RateLimit-Remaining", "0".to_string()));
        assert_eq!(headers[2], ("X-RateLimit-Reset", "1700000003".to_string()));
        assert_eq!(headers[3], ("Retry-After", "3".to_string()));
    }

    #[test]
    fn test_guard_error_status() {
        let limited: GuardError<String> = RateLimitExceeded {
            key: "k".to_string(),
            limit: 1,
            retry_after: Duration::from_secs(1),
            reset_at: 0,
        }
        .into();
        let open: GuardError<String> = CircuitError::Open {
            circuit: "c".to_string(),
            opened_at: 0.0,
        }
        .into();

        assert_eq!(limited.status_code(), Some(429));
        assert_eq!(open.status_code(), Some(503));
    }
}
