//! Failure classification
//!
//! Decides which errors count against a circuit. Upstream validation errors
//! (4xx-style) usually say nothing about the dependency's health and should not
//! trip the breaker; timeouts and 5xx responses should.

use std::any::Any;

/// What a classifier gets to look at
#[derive(Debug)]
pub struct FailureContext<'a> {
    pub circuit_name: &'a str,
    /// The call's error, downcastable to the caller's concrete error type
    pub error: &'a dyn Any,
    /// Duration of the failed call in seconds
    pub duration: f64,
}

/// Determines whether an error counts as a circuit failure
///
/// ```rust
/// use market_guard::{FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct UpstreamStatus(u16);
///
/// #[derive(Debug)]
/// struct ServerErrorsOnly;
///
/// impl FailureClassifier for ServerErrorsOnly {
///     fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
///         ctx.error
///             .downcast_ref::<UpstreamStatus>()
///             .map(|s| s.0 >= 500)
///             .unwrap_or(true)
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    /// `true` if the error should be recorded as a failure
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Counts every error
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn should_trip(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Classifier built from a closure
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum UpstreamError {
        BadRequest,
        Unavailable,
    }

    fn context<'a>(error: &'a dyn Any, duration: f64) -> FailureContext<'a> {
        FailureContext {
            circuit_name: "scoring",
            error,
            duration,
        }
    }

    #[test]
    fn test_default_classifier_counts_everything() {
        assert!(DefaultClassifier.should_trip(&context(&"anything", 0.0)));
    }

    #[test]
    fn test_predicate_on_error_type() {
        let classifier = PredicateClassifier::new(|ctx| {
            ctx.error
                .downcast_ref::<UpstreamError>()
                .map(|e| matches!(e, UpstreamError::Unavailable))
                .unwrap_or(true)
        });

        assert!(!classifier.should_trip(&context(&UpstreamError::BadRequest, 0.1)));
        assert!(classifier.should_trip(&context(&UpstreamError::Unavailable, 0.1)));
        assert!(classifier.should_trip(&context(&"unknown", 0.1)));
    }

    #[test]
    fn test_predicate_on_duration() {
        let slow_only = PredicateClassifier::new(|ctx| ctx.duration > 1.0);

        assert!(!slow_only.should_trip(&context(&"fast", 0.2)));
        assert!(slow_only.should_trip(&context(&"slow", 2.5)));
    }
}
