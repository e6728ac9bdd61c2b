//! Handler invocation boundary shared by the bus and the stream client
//!
//! Handlers run one after another in registration order. An error or a panic
//! in one handler is logged and counted; the remaining handlers still run.

use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, warn};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer of events or stream updates
#[async_trait]
pub trait Handler<T: Send + Sync + 'static>: Send + Sync {
    async fn handle(&self, item: &T) -> Result<(), HandlerError>;
}

/// Adapter turning a closure into a [`Handler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<T, F> Handler<T> for FnHandler<F>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, item: &T) -> Result<(), HandlerError> {
        (self.0)(item)
    }
}

/// Wrap a synchronous closure as a shareable handler
pub fn handler_fn<T, F>(f: F) -> Arc<dyn Handler<T>>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub failed: usize,
}

/// Invoke every handler with `item`, isolating failures
pub async fn dispatch_all<T>(handlers: &[Arc<dyn Handler<T>>], item: &T, scope: &str) -> DispatchOutcome
where
    T: Send + Sync + 'static,
{
    let mut outcome = DispatchOutcome::default();

    for (index, handler) in handlers.iter().enumerate() {
        match AssertUnwindSafe(handler.handle(item)).catch_unwind().await {
            Ok(Ok(())) => outcome.delivered += 1,
            Ok(Err(e)) => {
                outcome.failed += 1;
                warn!(scope, handler = index, error = %e, "handler failed");
            }
            Err(panic) => {
                outcome.failed += 1;
                error!(scope, handler = index, panic = %panic_message(panic.as_ref()), "handler panicked");
            }
        }
    }

    outcome
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
