//! Call outcome history for circuit breakers
//!
//! Breakers record every counted outcome here so the recent-failure window can
//! be evaluated without keeping unbounded state. One history instance may be
//! shared by many breakers; records are keyed by circuit name.

use crate::clock::{Clock, MonotonicClock};
use crate::{CallRecord, Outcome};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Abstract store of call outcomes, keyed by circuit name
pub trait CallHistory: Send + Sync + std::fmt::Debug {
    /// Record a successful call that took `duration` seconds
    fn record_success(&self, circuit_name: &str, duration: f64);

    /// Record a failed call together with its failure message
    fn record_failure(&self, circuit_name: &str, duration: f64, message: &str);

    /// Count successes newer than `window_seconds`
    fn success_count(&self, circuit_name: &str, window_seconds: f64) -> usize;

    /// Count failures newer than `window_seconds`
    fn failure_count(&self, circuit_name: &str, window_seconds: f64) -> usize;

    /// Forget everything recorded for one circuit
    fn clear(&self, circuit_name: &str);

    /// Forget everything
    fn clear_all(&self);

    /// The most recent `limit` records for a circuit, oldest first
    fn event_log(&self, circuit_name: &str, limit: usize) -> Vec<CallRecord>;

    /// Current reading of the history's clock, in seconds
    fn monotonic_time(&self) -> f64;
}

/// Thread-safe in-memory history with a per-circuit cap
#[derive(Debug)]
pub struct MemoryHistory {
    records: RwLock<HashMap<String, VecDeque<CallRecord>>>,
    max_records: usize,
    clock: Arc<dyn Clock>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::with_max_records(1000)
    }

    /// Keep at most `max_records` outcomes per circuit
    pub fn with_max_records(max_records: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            max_records: max_records.max(1),
            clock: Arc::new(MonotonicClock::new()),
        }
    }

    /// Use a custom time source (tests drive a `ManualClock`)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn push(&self, circuit_name: &str, outcome: Outcome, duration: f64, message: Option<&str>) {
        let record = CallRecord {
            outcome,
            timestamp: self.clock.now(),
            duration,
            message: message.map(str::to_owned),
        };

        let mut records = self.records.write();
        let circuit = records.entry(circuit_name.to_string()).or_default();
        circuit.push_back(record);

        while circuit.len() > self.max_records {
            circuit.pop_front();
        }
    }

    fn count(&self, circuit_name: &str, outcome: Outcome, window_seconds: f64) -> usize {
        let cutoff = self.clock.now() - window_seconds;
        self.records
            .read()
            .get(circuit_name)
            .map(|records| {
                records
                    .iter()
                    .rev()
                    .take_while(|r| r.timestamp >= cutoff)
                    .filter(|r| r.outcome == outcome)
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl CallHistory for MemoryHistory {
    fn record_success(&self, circuit_name: &str, duration: f64) {
        self.push(circuit_name, Outcome::Success, duration, None);
    }

    fn record_failure(&self, circuit_name: &str, duration: f64, message: &str) {
        self.push(circuit_name, Outcome::Failure, duration, Some(message));
    }

    fn success_count(&self, circuit_name: &str, window_seconds: f64) -> usize {
        self.count(circuit_name, Outcome::Success, window_seconds)
    }

    fn failure_count(&self, circuit_name: &str, window_seconds: f64) -> usize {
        self.count(circuit_name, Outcome::Failure, window_seconds)
    }

    fn clear(&self, circuit_name: &str) {
        self.records.write().remove(circuit_name);
    }

    fn clear_all(&self) {
        self.records.write().clear();
    }

    fn event_log(&self, circuit_name: &str, limit: usize) -> Vec<CallRecord> {
        self.records
            .read()
            .get(circuit_name)
            .map(|records| {
                let skip = records.len().saturating_sub(limit);
                records.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    fn monotonic_time(&self) -> f64 {
        self.clock.now()
    }
}
