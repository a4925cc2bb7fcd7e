//! Per-node circuit breakers.
//!
//! Closed counts successes/failures; when throughput and failure rate
//! cross the policy thresholds the breaker opens for `open_duration_ms`.
//! The first admission check after that window moves it to half-open,
//! where `half_open_successes` consecutive successes close it again and
//! any failure re-opens it. Counters reset on every state change, so the
//! reported failure rate covers only the current window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{Result, WeirError};

/// Breaker thresholds attached to a node definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerPolicy {
    /// Failure percentage in `[0, 100]` at which the breaker opens.
    pub failure_threshold: f64,
    /// Minimum calls in the window before the threshold applies.
    pub minimum_throughput: u64,
    pub open_duration_ms: u64,
    /// Consecutive half-open successes required to close.
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 50.0,
            minimum_throughput: 10,
            open_duration_ms: 30_000,
            half_open_successes: 3,
        }
    }
}

impl CircuitBreakerPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.failure_threshold) {
            return Err(WeirError::Validation(format!(
                "failure_threshold must be in 0..=100, got {}",
                self.failure_threshold
            )));
        }
        if self.half_open_successes == 0 {
            return Err(WeirError::Validation(
                "half_open_successes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Breaker state, reported in events and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    policy: CircuitBreakerPolicy,
    state: CircuitState,
    total: u64,
    failures: u64,
    half_open_successes: u32,
    open_until: Option<Instant>,
}

impl BreakerEntry {
    fn new(policy: CircuitBreakerPolicy) -> Self {
        Self {
            policy,
            state: CircuitState::Closed,
            total: 0,
            failures: 0,
            half_open_successes: 0,
            open_until: None,
        }
    }

    fn reset_counters(&mut self) {
        self.total = 0;
        self.failures = 0;
        self.half_open_successes = 0;
    }

    fn trip_open(&mut self) {
        self.state = CircuitState::Open;
        self.open_until = Some(Instant::now() + Duration::from_millis(self.policy.open_duration_ms));
        self.reset_counters();
    }
}

/// Manages one breaker per registered node id.
///
/// `allow_request` fails open for unregistered ids: a node without a
/// configured breaker is always admitted.
#[derive(Debug, Default)]
pub struct CircuitBreakerManager {
    entries: Mutex<HashMap<String, BreakerEntry>>,
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: impl Into<String>, policy: CircuitBreakerPolicy) {
        let node_id = node_id.into();
        let mut entries = self.entries.lock().unwrap();
        entries.insert(node_id, BreakerEntry::new(policy));
    }

    /// Whether a request for `node_id` may proceed.
    ///
    /// An open breaker whose window has elapsed transitions to half-open
    /// here and admits the caller as the probe request.
    pub fn allow_request(&self, node_id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(node_id) else {
            return true;
        };

        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = entry
                    .open_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true);
                if elapsed {
                    debug!(node_id, "circuit breaker probing: open -> half_open");
                    entry.state = CircuitState::HalfOpen;
                    entry.open_until = None;
                    entry.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, node_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(node_id) else {
            return;
        };

        match entry.state {
            CircuitState::Closed => {
                entry.total += 1;
            }
            CircuitState::HalfOpen => {
                entry.half_open_successes += 1;
                if entry.half_open_successes >= entry.policy.half_open_successes {
                    debug!(node_id, "circuit breaker recovered: half_open -> closed");
                    entry.state = CircuitState::Closed;
                    entry.reset_counters();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, node_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(node_id) else {
            return;
        };

        match entry.state {
            CircuitState::Closed => {
                entry.total += 1;
                entry.failures += 1;
                let rate = entry.failures as f64 / entry.total as f64 * 100.0;
                if entry.total >= entry.policy.minimum_throughput
                    && rate >= entry.policy.failure_threshold
                {
                    warn!(
                        node_id,
                        failure_rate = rate,
                        "circuit breaker tripped: closed -> open"
                    );
                    entry.trip_open();
                }
            }
            CircuitState::HalfOpen => {
                warn!(node_id, "half-open probe failed: half_open -> open");
                entry.trip_open();
            }
            CircuitState::Open => {}
        }
    }

    /// Current state, if a breaker is registered for `node_id`.
    pub fn state(&self, node_id: &str) -> Option<CircuitState> {
        self.entries
            .lock()
            .unwrap()
            .get(node_id)
            .map(|e| e.state)
    }

    /// Failure rate in percent over the current window. 0 with no requests
    /// or no registered breaker.
    pub fn failure_rate(&self, node_id: &str) -> f64 {
        let entries = self.entries.lock().unwrap();
        match entries.get(node_id) {
            Some(entry) if entry.total > 0 => {
                entry.failures as f64 / entry.total as f64 * 100.0
            }
            _ => 0.0,
        }
    }

    /// Force the breaker back to closed with fresh counters.
    pub fn reset(&self, node_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(node_id) {
            entry.state = CircuitState::Closed;
            entry.open_until = None;
            entry.reset_counters();
        }
    }
}
