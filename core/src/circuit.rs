//! Circuit breaker built on a typed state machine
//!
//! A breaker guards one upstream dependency. It is safe to share between
//! threads and tasks (`Arc<CircuitBreaker>`): bookkeeping happens under a
//! per-instance lock that is never held while the protected call runs.
//!
//! The OPEN -> HALF_OPEN transition is evaluated lazily, on the next call or
//! state read after the recovery timeout; there is no background timer.

use crate::{
    callbacks::{Callbacks, Transition},
    classifier::{FailureClassifier, FailureContext},
    clock::{self, unix_now},
    errors::CircuitError,
    history::CallHistory,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use state_machines::state_machine;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How a failure during the half-open probe period is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HalfOpenFailurePolicy {
    /// Any probe failure reopens the circuit immediately
    #[default]
    ReopenOnFirstFailure,
    /// A probe failure reopens the circuit only once `half_open_max_calls`
    /// probes have been attempted without closing it
    ReopenWhenBudgetExhausted,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Failures (since the circuit last closed) that open the circuit
    pub failure_threshold: usize,

    /// Seconds the circuit stays open before probing recovery
    pub recovery_timeout_secs: f64,

    /// Probe budget in half-open; this many successes close the circuit
    pub half_open_max_calls: usize,

    /// Window, in seconds, of recent history used to decay the failure count
    /// after successful calls
    pub failure_window_secs: f64,

    pub half_open_failure_policy: HalfOpenFailurePolicy,

    /// Jitter factor for the recovery timeout (0.0 = none, 1.0 = full)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60.0,
            half_open_max_calls: 3,
            failure_window_secs: 60.0,
            half_open_failure_policy: HalfOpenFailurePolicy::default(),
            jitter_factor: 0.0,
        }
    }
}

/// Externally visible circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_machine(state: &str) -> Self {
        match state {
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot served to dashboards and health checks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: usize,
    pub success_count: usize,
    pub failure_threshold: usize,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Unix seconds of the most recent failure
    pub last_failure_time: Option<f64>,
    pub last_failure_message: Option<String>,
}

/// Context provided to fallback closures when a call is rejected
#[derive(Debug, Clone)]
pub struct FallbackContext {
    pub circuit_name: String,
    /// Monotonic time at which the circuit opened (0.0 if unknown)
    pub opened_at: f64,
    pub state: CircuitState,
}

pub type FallbackFn<T, E> = Box<dyn FnOnce(&FallbackContext) -> Result<T, E> + Send>;

/// Per-call options
pub struct CallOptions<T, E> {
    /// Runs instead of returning a rejection when the circuit refuses the call
    pub fallback: Option<FallbackFn<T, E>>,
}

impl<T, E> Default for CallOptions<T, E> {
    fn default() -> Self {
        Self { fallback: None }
    }
}

impl<T, E> CallOptions<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&FallbackContext) -> Result<T, E> + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }
}

/// Counters shared between the breaker and its state-machine guards
///
/// Only mutated while the owning breaker's lock is held.
#[derive(Debug, Default)]
pub struct Tally {
    failure_count: AtomicUsize,
    success_count: AtomicUsize,
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
}

impl Tally {
    pub fn failures(&self) -> usize {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn successes(&self) -> usize {
        self.success_count.load(Ordering::Acquire)
    }

    fn zero(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.total_calls.store(0, Ordering::Release);
        self.total_successes.store(0, Ordering::Release);
        self.total_failures.store(0, Ordering::Release);
    }
}

/// Shared data visible to every state of the machine
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: Config,
    pub history: Arc<dyn CallHistory>,
    pub tally: Arc<Tally>,
    pub failure_classifier: Option<Arc<dyn FailureClassifier>>,
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self {
            name: String::new(),
            config: Config::default(),
            history: Arc::new(crate::MemoryHistory::new()),
            tally: Arc::new(Tally::default()),
            failure_classifier: None,
        }
    }
}

impl fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("tally", &self.tally)
            .field("failure_classifier", &self.failure_classifier.is_some())
            .finish_non_exhaustive()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: f64,
    /// Recovery timeout drawn when the circuit opened (jitter applied)
    pub recovery_secs: f64,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    /// Probe calls admitted since entering half-open
    pub probes: usize,
    /// Probe calls that failed
    pub failures: usize,
    /// A call arrived after the probe budget was spent
    pub budget_exhausted: bool,
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [recovery_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

impl Circuit<Closed> {
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        ctx.tally.failures() >= ctx.config.failure_threshold
    }
}

impl Circuit<HalfOpen> {
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        let Some(data) = self.state_data_half_open() else {
            return true;
        };
        if data.budget_exhausted {
            return true;
        }

        match ctx.config.half_open_failure_policy {
            HalfOpenFailurePolicy::ReopenOnFirstFailure => data.failures > 0,
            HalfOpenFailurePolicy::ReopenWhenBudgetExhausted => {
                data.failures > 0 && data.probes >= ctx.config.half_open_max_calls
            }
        }
    }

    fn should_close(&self, ctx: &CircuitContext) -> bool {
        ctx.tally.successes() >= ctx.config.half_open_max_calls
    }
}

impl Circuit<Open> {
    fn recovery_elapsed(&self, ctx: &CircuitContext) -> bool {
        self.state_data_open().is_some_and(|data| {
            ctx.history.monotonic_time() - data.opened_at >= data.recovery_secs
        })
    }
}

/// Why a call was not attempted
enum Rejection {
    Open { opened_at: f64 },
    ProbeBudget,
}

struct BreakerCore {
    machine: DynamicCircuit,
    last_failure_at: Option<f64>,
    last_failure_message: Option<String>,
}

/// Circuit breaker public API
pub struct CircuitBreaker {
    context: CircuitContext,
    callbacks: Callbacks,
    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration and a private history
    pub fn new(name: impl Into<String>, config: Config) -> Self {
        Self::builder(name).config(config).build()
    }

    pub(crate) fn with_context_and_callbacks(context: CircuitContext, callbacks: Callbacks) -> Self {
        let machine = DynamicCircuit::new(context.clone());

        Self {
            core: Mutex::new(BreakerCore {
                machine,
                last_failure_at: None,
                last_failure_message: None,
            }),
            context,
            callbacks,
        }
    }

    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn config(&self) -> &Config {
        &self.context.config
    }

    /// Run `f` under circuit protection
    ///
    /// While open the call is rejected without running `f`. Errors from `f`
    /// are recorded and handed back unchanged inside [`CircuitError::Execution`].
    pub fn call<T, E, F>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display + 'static,
    {
        self.call_with(f, CallOptions::new())
    }

    /// Like [`call`](Self::call), with a fallback for rejected calls
    pub fn call_with<T, E, F>(&self, f: F, options: CallOptions<T, E>) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display + 'static,
    {
        if let Err(rejection) = self.admit() {
            return self.reject(rejection, options);
        }

        let start = self.context.history.monotonic_time();
        let result = f();
        self.settle(result, start)
    }

    /// Run a future under circuit protection
    pub async fn call_async<T, E, F, Fut>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display + 'static,
    {
        if let Err(rejection) = self.admit() {
            return self.reject(rejection, CallOptions::new());
        }

        let start = self.context.history.monotonic_time();
        let result = f().await;
        self.settle(result, start)
    }

    /// Record a success observed outside of `call`
    pub fn record_success(&self) {
        self.update(|core, transitions| {
            self.refresh(core, transitions);
            self.register_success(core, 0.0, transitions);
        });
    }

    /// Record a failure observed outside of `call`
    pub fn record_failure(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|core, transitions| {
            self.refresh(core, transitions);
            self.register_failure(core, 0.0, &message, transitions);
        });
    }

    /// Current state, applying a pending OPEN -> HALF_OPEN transition
    pub fn state(&self) -> CircuitState {
        self.update(|core, transitions| {
            self.refresh(core, transitions);
            CircuitState::from_machine(core.machine.current_state())
        })
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    pub fn state_name(&self) -> &'static str {
        self.state().as_str()
    }

    /// Force the circuit closed and zero every counter
    pub fn reset(&self) {
        let mut core = self.core.lock();
        self.context.history.clear(&self.context.name);
        self.context.tally.zero();
        core.machine = DynamicCircuit::new(self.context.clone());
        core.last_failure_at = None;
        core.last_failure_message = None;
        info!(circuit = %self.context.name, "circuit reset");
    }

    pub fn stats(&self) -> CircuitStats {
        self.update(|core, transitions| {
            self.refresh(core, transitions);
            let tally = &self.context.tally;
            CircuitStats {
                name: self.context.name.clone(),
                state: CircuitState::from_machine(core.machine.current_state()),
                failure_count: tally.failures(),
                success_count: tally.successes(),
                failure_threshold: self.context.config.failure_threshold,
                total_calls: tally.total_calls.load(Ordering::Acquire),
                total_successes: tally.total_successes.load(Ordering::Acquire),
                total_failures: tally.total_failures.load(Ordering::Acquire),
                last_failure_time: core.last_failure_at,
                last_failure_message: core.last_failure_message.clone(),
            }
        })
    }

    /// Most recent recorded outcomes for this circuit, oldest first
    pub fn event_log(&self, limit: usize) -> Vec<crate::CallRecord> {
        self.context.history.event_log(&self.context.name, limit)
    }

    /// Run `f` under the lock, then fire transition hooks with the lock released
    fn update<R>(&self, f: impl FnOnce(&mut BreakerCore, &mut Vec<Transition>) -> R) -> R {
        let mut transitions = Vec::new();
        let result = {
            let mut core = self.core.lock();
            f(&mut core, &mut transitions)
        };
        self.callbacks.trigger_all(&transitions, &self.context.name);
        result
    }

    fn admit(&self) -> Result<(), Rejection> {
        self.update(|core, transitions| {
            self.context.tally.total_calls.fetch_add(1, Ordering::AcqRel);
            self.refresh(core, transitions);

            match core.machine.current_state() {
                "Open" => Err(Rejection::Open {
                    opened_at: core.machine.open_data().map(|d| d.opened_at).unwrap_or(0.0),
                }),
                "HalfOpen" => {
                    let budget = self.context.config.half_open_max_calls;
                    let admitted = match core.machine.half_open_data_mut() {
                        Some(data) if data.probes < budget => {
                            data.probes += 1;
                            true
                        }
                        Some(data) => {
                            data.budget_exhausted = true;
                            false
                        }
                        None => false,
                    };

                    if admitted {
                        Ok(())
                    } else {
                        self.register_failure(
                            core,
                            0.0,
                            "half-open probe budget exhausted",
                            transitions,
                        );
                        Err(Rejection::ProbeBudget)
                    }
                }
                _ => Ok(()),
            }
        })
    }

    fn reject<T, E>(&self, rejection: Rejection, options: CallOptions<T, E>) -> Result<T, CircuitError<E>> {
        let circuit = self.context.name.clone();
        let (opened_at, error) = match rejection {
            Rejection::Open { opened_at } => (
                opened_at,
                CircuitError::Open {
                    circuit: circuit.clone(),
                    opened_at,
                },
            ),
            Rejection::ProbeBudget => (
                0.0,
                CircuitError::HalfOpenLimitReached {
                    circuit: circuit.clone(),
                },
            ),
        };
        debug!(circuit = %circuit, "call rejected by open circuit");

        match options.fallback {
            Some(fallback) => {
                let ctx = FallbackContext {
                    circuit_name: circuit,
                    opened_at,
                    state: CircuitState::Open,
                };
                fallback(&ctx).map_err(CircuitError::Execution)
            }
            None => Err(error),
        }
    }

    fn settle<T, E>(&self, result: Result<T, E>, start: f64) -> Result<T, CircuitError<E>>
    where
        E: fmt::Display + 'static,
    {
        let duration = self.context.history.monotonic_time() - start;

        match result {
            Ok(value) => {
                self.update(|core, transitions| self.register_success(core, duration, transitions));
                Ok(value)
            }
            Err(error) => {
                if self.counts_as_failure(&error, duration) {
                    let message = error.to_string();
                    self.update(|core, transitions| {
                        self.register_failure(core, duration, &message, transitions)
                    });
                }
                Err(CircuitError::Execution(error))
            }
        }
    }

    fn counts_as_failure<E: 'static>(&self, error: &E, duration: f64) -> bool {
        match &self.context.failure_classifier {
            Some(classifier) => classifier.should_trip(&FailureContext {
                circuit_name: &self.context.name,
                error: error as &dyn std::any::Any,
                duration,
            }),
            None => true,
        }
    }

    /// OPEN -> HALF_OPEN once the recovery timeout has elapsed
    fn refresh(&self, core: &mut BreakerCore, transitions: &mut Vec<Transition>) {
        if core.machine.current_state() == "Open"
            && core.machine.handle(CircuitEvent::AttemptReset).is_ok()
        {
            self.context.tally.success_count.store(0, Ordering::Release);
            info!(circuit = %self.context.name, "circuit half-open, probing recovery");
            transitions.push(Transition::HalfOpened);
        }
    }

    fn register_success(&self, core: &mut BreakerCore, duration: f64, transitions: &mut Vec<Transition>) {
        let ctx = &self.context;
        ctx.history.record_success(&ctx.name, duration);
        ctx.tally.success_count.fetch_add(1, Ordering::AcqRel);
        ctx.tally.total_successes.fetch_add(1, Ordering::AcqRel);

        match core.machine.current_state() {
            "HalfOpen" => {
                if core.machine.handle(CircuitEvent::Close).is_ok() {
                    ctx.tally.failure_count.store(0, Ordering::Release);
                    ctx.tally.success_count.store(0, Ordering::Release);
                    info!(circuit = %ctx.name, "circuit closed");
                    transitions.push(Transition::Closed);
                }
            }
            "Closed" => {
                // Old failures age out of the count once they leave the window.
                let recent = ctx.history.failure_count(&ctx.name, ctx.config.failure_window_secs);
                ctx.tally.failure_count.fetch_min(recent, Ordering::AcqRel);
            }
            _ => {}
        }
    }

    fn register_failure(
        &self,
        core: &mut BreakerCore,
        duration: f64,
        message: &str,
        transitions: &mut Vec<Transition>,
    ) {
        let ctx = &self.context;
        ctx.history.record_failure(&ctx.name, duration, message);
        ctx.tally.failure_count.fetch_add(1, Ordering::AcqRel);
        ctx.tally.total_failures.fetch_add(1, Ordering::AcqRel);
        core.last_failure_at = Some(unix_now());
        core.last_failure_message = Some(message.to_string());

        match core.machine.current_state() {
            "HalfOpen" => {
                if let Some(data) = core.machine.half_open_data_mut() {
                    data.failures += 1;
                }
                self.try_trip(core, message, transitions);
            }
            "Closed" => self.try_trip(core, message, transitions),
            "Open" => {
                // Late failures push the recovery window out.
                self.restart_recovery(core);
                debug!(circuit = %ctx.name, "failure while open, recovery timer restarted");
            }
            _ => {}
        }
    }

    fn try_trip(&self, core: &mut BreakerCore, reason: &str, transitions: &mut Vec<Transition>) {
        if core.machine.handle(CircuitEvent::Trip).is_err() {
            return;
        }
        self.restart_recovery(core);

        warn!(
            circuit = %self.context.name,
            failures = self.context.tally.failures(),
            reason,
            "circuit opened"
        );
        transitions.push(Transition::Opened);
    }

    /// Start the recovery timeout from the latest failure, with fresh jitter
    fn restart_recovery(&self, core: &mut BreakerCore) {
        let config = &self.context.config;
        let recovery_secs = if config.jitter_factor > 0.0 {
            let base = Duration::try_from_secs_f64(config.recovery_timeout_secs)
                .unwrap_or(Duration::ZERO);
            clock::jittered(base, config.jitter_factor).as_secs_f64()
        } else {
            config.recovery_timeout_secs
        };

        if let Some(data) = core.machine.open_data_mut() {
            data.opened_at = self.context.history.monotonic_time();
            data.recovery_secs = recovery_secs;
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.context.name)
            .field("config", &self.context.config)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::{MemoryHistory, PredicateClassifier};
    use std::sync::atomic::AtomicBool;

    fn manual_breaker(config: Config) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::builder("quotes")
            .config(config)
            .clock(clock.clone())
            .build();
        (breaker, clock)
    }

    fn config(threshold: usize, recovery: f64, probes: usize) -> Config {
        Config {
            failure_threshold: threshold,
            recovery_timeout_secs: recovery,
            half_open_max_calls: probes,
            ..Default::default()
        }
    }

    fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| Err::<(), _>("upstream 502"));
    }

    fn succeed(breaker: &CircuitBreaker) -> Result<&'static str, CircuitError<&'static str>> {
        breaker.call(|| Ok::<_, &'static str>("ok"))
    }

    #[test]
    fn test_new_breaker_is_closed() {
        let breaker = CircuitBreaker::new("quotes", Config::default());

        assert!(breaker.is_closed());
        assert_eq!(breaker.state_name(), "closed");
        assert_eq!(breaker.stats().failure_count, 0);
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let (breaker, _) = manual_breaker(config(3, 1.0, 1));

        fail(&breaker);
        fail(&breaker);
        assert!(breaker.is_closed());
        assert_eq!(breaker.stats().failure_count, 2);
    }

    #[test]
    fn test_opens_at_threshold_and_rejects_without_invoking() {
        let (breaker, _) = manual_breaker(config(3, 30.0, 1));

        for _ in 0..3 {
            fail(&breaker);
        }
        assert!(breaker.is_open());

        let invoked = AtomicBool::new(false);
        let result = breaker.call(|| {
            invoked.store(true, Ordering::SeqCst);
            Ok::<_, &str>(())
        });

        assert!(matches!(result, Err(CircuitError::Open { .. })));
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[test]
    fn test_execution_error_is_returned_unchanged() {
        let breaker = CircuitBreaker::new("quotes", Config::default());

        let result = breaker.call(|| Err::<(), _>("upstream 502"));
        match result {
            Err(CircuitError::Execution(e)) => assert_eq!(e, "upstream 502"),
            other => panic!("expected execution error, got {:?}", other),
        }
        assert_eq!(
            breaker.stats().last_failure_message.as_deref(),
            Some("upstream 502")
        );
    }

    #[test]
    fn test_recovery_timeout_moves_to_half_open_on_state_read() {
        let (breaker, clock) = manual_breaker(config(2, 10.0, 1));

        fail(&breaker);
        fail(&breaker);
        assert!(breaker.is_open());

        clock.advance(9.9);
        assert!(breaker.is_open());

        clock.advance(0.1);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.stats().success_count, 0);
    }

    #[test]
    fn test_failure_while_open_restarts_recovery_timeout() {
        let (breaker, clock) = manual_breaker(config(2, 10.0, 1));

        breaker.record_failure("timeout");
        breaker.record_failure("timeout");
        assert!(breaker.is_open());

        // An in-flight call that started while closed lands late.
        clock.advance(9.0);
        breaker.record_failure("late");

        clock.advance(2.0);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.stats().last_failure_message.as_deref(), Some("late"));

        clock.advance(8.0);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_successes_close_and_zero_failures() {
        let (breaker, clock) = manual_breaker(config(2, 5.0, 2));

        fail(&breaker);
        fail(&breaker);
        clock.advance(5.0);

        assert!(succeed(&breaker).is_ok());
        assert!(breaker.is_half_open());
        assert_eq!(breaker.stats().success_count, 1);

        assert!(succeed(&breaker).is_ok());
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens_immediately() {
        let (breaker, clock) = manual_breaker(config(2, 5.0, 3));

        fail(&breaker);
        fail(&breaker);
        clock.advance(5.0);
        assert!(breaker.is_half_open());

        assert!(succeed(&breaker).is_ok());
        fail(&breaker);
        assert!(breaker.is_open());

        // The recovery timeout restarts from the reopening failure.
        clock.advance(4.0);
        assert!(breaker.is_open());
    }

    #[test]
    fn test_budget_policy_tolerates_failure_until_budget_spent() {
        let (breaker, clock) = manual_breaker(Config {
            half_open_failure_policy: HalfOpenFailurePolicy::ReopenWhenBudgetExhausted,
            ..config(1, 5.0, 2)
        });

        fail(&breaker);
        clock.advance(5.0);

        fail(&breaker);
        assert!(breaker.is_half_open(), "first probe failure is tolerated");

        fail(&breaker);
        assert!(breaker.is_open(), "budget spent with failures reopens");
    }

    #[test]
    fn test_probe_budget_overrun_rejects_and_reopens() {
        let (breaker, clock) = manual_breaker(config(1, 5.0, 1));

        fail(&breaker);
        clock.advance(5.0);
        assert!(breaker.is_half_open());

        // A second caller arrives while the single permitted probe is in flight.
        let outer = breaker.call(|| {
            let inner = breaker.call(|| Ok::<_, &str>("inner"));
            assert!(matches!(inner, Err(CircuitError::HalfOpenLimitReached { .. })));
            Ok::<_, &str>("outer")
        });

        assert_eq!(outer.ok(), Some("outer"));
        assert!(breaker.is_open());
        assert_eq!(
            breaker.stats().last_failure_message.as_deref(),
            Some("half-open probe budget exhausted")
        );
    }

    #[test]
    fn test_success_decays_failures_outside_window() {
        let (breaker, clock) = manual_breaker(Config {
            failure_window_secs: 10.0,
            ..config(3, 5.0, 1)
        });

        // Without an intervening success old failures still count.
        fail(&breaker);
        fail(&breaker);
        clock.advance(11.0);
        fail(&breaker);
        assert!(breaker.is_open());

        breaker.reset();
        fail(&breaker);
        fail(&breaker);
        clock.advance(11.0);
        assert!(succeed(&breaker).is_ok());
        assert_eq!(breaker.stats().failure_count, 0);

        fail(&breaker);
        fail(&breaker);
        assert!(breaker.is_closed());
    }

    #[test]
    fn test_reset_forces_closed_and_zeroes_counters() {
        let (breaker, _) = manual_breaker(config(2, 60.0, 1));

        fail(&breaker);
        fail(&breaker);
        assert!(breaker.is_open());

        breaker.reset();
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.total_calls, 0);
        assert_eq!(stats.total_failures, 0);
        assert!(stats.last_failure_time.is_none());
        assert!(breaker.event_log(10).is_empty());
    }

    #[test]
    fn test_manual_recording_drives_transitions() {
        let (breaker, clock) = manual_breaker(config(2, 1.0, 1));

        breaker.record_failure("timeout");
        assert!(breaker.is_closed());
        breaker.record_failure("timeout");
        assert!(breaker.is_open());

        clock.advance(1.0);
        breaker.record_success();
        assert!(breaker.is_closed());
    }

    #[test]
    fn test_scenario_real_clock_recovery() {
        let breaker = CircuitBreaker::new("scoring", config(2, 1.0, 1));

        fail(&breaker);
        fail(&breaker);
        assert!(breaker.is_open());

        std::thread::sleep(Duration::from_millis(1100));

        assert!(succeed(&breaker).is_ok());
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
    }

    #[test]
    fn test_fallback_when_open() {
        let (breaker, _) = manual_breaker(config(1, 60.0, 1));
        fail(&breaker);

        let result = breaker.call_with(
            || Err::<String, &str>("should not execute"),
            CallOptions::new().with_fallback(|ctx| {
                assert_eq!(ctx.circuit_name, "quotes");
                assert_eq!(ctx.state, CircuitState::Open);
                Ok("cached quote".to_string())
            }),
        );

        assert_eq!(result.ok().as_deref(), Some("cached quote"));
    }

    #[test]
    fn test_fallback_error_is_execution_error() {
        let (breaker, _) = manual_breaker(config(1, 60.0, 1));
        fail(&breaker);

        let result = breaker.call_with(
            || Ok::<String, &str>("unused".to_string()),
            CallOptions::new().with_fallback(|_| Err("no cached quote")),
        );

        match result {
            Err(CircuitError::Execution(e)) => assert_eq!(e, "no cached quote"),
            other => panic!("expected execution error, got {:?}", other),
        }
    }

    #[test]
    fn test_classifier_ignores_client_errors() {
        #[derive(Debug)]
        enum ApiError {
            Client(u16),
            Server(u16),
        }

        impl fmt::Display for ApiError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    ApiError::Client(code) | ApiError::Server(code) => write!(f, "HTTP {}", code),
                }
            }
        }

        let breaker = CircuitBreaker::builder("kiwoom")
            .failure_threshold(2)
            .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
                !matches!(ctx.error.downcast_ref::<ApiError>(), Some(ApiError::Client(_)))
            })))
            .build();

        for _ in 0..5 {
            let _ = breaker.call(|| Err::<(), _>(ApiError::Client(404)));
        }
        assert!(breaker.is_closed());
        assert_eq!(breaker.stats().total_failures, 0);

        let _ = breaker.call(|| Err::<(), _>(ApiError::Server(502)));
        let _ = breaker.call(|| Err::<(), _>(ApiError::Server(503)));
        assert!(breaker.is_open());
        assert_eq!(breaker.stats().last_failure_message.as_deref(), Some("HTTP 503"));
    }

    #[test]
    fn test_transition_callbacks_fire_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let clock = Arc::new(ManualClock::new());

        let (open_log, half_log, close_log) = (log.clone(), log.clone(), log.clone());
        let breaker = CircuitBreaker::builder("quotes")
            .config(config(1, 2.0, 1))
            .clock(clock.clone())
            .on_open(move |name| open_log.lock().push(format!("open:{name}")))
            .on_half_open(move |name| half_log.lock().push(format!("half_open:{name}")))
            .on_close(move |name| close_log.lock().push(format!("close:{name}")))
            .build();

        fail(&breaker);
        clock.advance(2.0);
        assert!(succeed(&breaker).is_ok());

        assert_eq!(
            *log.lock(),
            vec!["open:quotes", "half_open:quotes", "close:quotes"]
        );
    }

    #[test]
    fn test_callbacks_can_reenter_breaker() {
        let seen_state = Arc::new(Mutex::new(None));
        let breaker = Arc::new_cyclic(|weak: &std::sync::Weak<CircuitBreaker>| {
            let weak = weak.clone();
            let seen_state = seen_state.clone();
            CircuitBreaker::builder("quotes")
                .failure_threshold(1)
                .on_open(move |_| {
                    if let Some(breaker) = weak.upgrade() {
                        *seen_state.lock() = Some(breaker.stats().state);
                    }
                })
                .build()
        });

        fail(&breaker);
        assert_eq!(*seen_state.lock(), Some(CircuitState::Open));
    }

    #[test]
    fn test_jitter_shortens_recovery_within_bounds() {
        let (breaker, clock) = manual_breaker(Config {
            jitter_factor: 0.5,
            ..config(1, 10.0, 1)
        });

        fail(&breaker);
        clock.advance(4.9);
        assert!(breaker.is_open(), "jittered timeout never drops below half");

        clock.advance(5.2);
        assert!(breaker.is_half_open());
    }

    #[test]
    fn test_stats_surface_serializes_state_in_snake_case() {
        let (breaker, clock) = manual_breaker(config(1, 1.0, 1));
        fail(&breaker);
        clock.advance(1.0);

        let json = serde_json::to_value(breaker.stats()).expect("stats serialize");
        assert_eq!(json["state"], "half_open");
        assert_eq!(json["failure_threshold"], 1);
        assert_eq!(json["total_failures"], 1);
        assert!(json["last_failure_time"].as_f64().is_some());
    }

    #[test]
    fn test_concurrent_failures_are_all_counted() {
        let breaker = Arc::new(
            CircuitBreaker::builder("quotes")
                .failure_threshold(1000)
                .history(Arc::new(MemoryHistory::with_max_records(10_000)))
                .build(),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let _ = breaker.call(|| Err::<(), _>("boom"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }

        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 400);
        assert_eq!(stats.total_failures, 400);
        assert_eq!(stats.failure_count, 400);
        assert!(breaker.is_closed());
    }

    #[tokio::test]
    async fn test_call_async_records_outcomes() {
        let (breaker, _) = manual_breaker(config(2, 60.0, 1));

        let ok = breaker.call_async(|| async { Ok::<_, &str>(42) }).await;
        assert_eq!(ok.ok(), Some(42));

        let _ = breaker.call_async(|| async { Err::<(), _>("timeout") }).await;
        let _ = breaker.call_async(|| async { Err::<(), _>("timeout") }).await;
        assert!(breaker.is_open());

        let rejected = breaker.call_async(|| async { Ok::<_, &str>(1) }).await;
        assert!(matches!(rejected, Err(CircuitError::Open { .. })));
    }

    #[test]
    fn test_state_machine_guards_follow_tally() {
        let ctx = CircuitContext {
            name: "quotes".to_string(),
            config: config(2, 0.001, 1),
            ..Default::default()
        };
        let mut machine = DynamicCircuit::new(ctx.clone());

        assert!(machine.handle(CircuitEvent::Trip).is_err());

        ctx.tally.failure_count.store(2, Ordering::SeqCst);
        machine
            .handle(CircuitEvent::Trip)
            .expect("threshold reached");
        assert_eq!(machine.current_state(), "Open");

        if let Some(data) = machine.open_data_mut() {
            data.opened_at = ctx.history.monotonic_time();
            data.recovery_secs = 0.001;
        }
        std::thread::sleep(Duration::from_millis(5));
        machine
            .handle(CircuitEvent::AttemptReset)
            .expect("recovery elapsed");
        assert_eq!(machine.current_state(), "HalfOpen");

        assert!(machine.handle(CircuitEvent::Close).is_err());
        ctx.tally.success_count.store(1, Ordering::SeqCst);
        machine.handle(CircuitEvent::Close).expect("probe succeeded");
        assert_eq!(machine.current_state(), "Closed");
    }
}
