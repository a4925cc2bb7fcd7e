//! Retry policy: backoff strategies and failure classification.
//!
//! Total invocations of a node body = 1 + retries, capped at
//! `max_attempts` retries. Delays are jittered by a uniform factor in
//! `[0.75, 1.25]` after the `max_delay` clamp.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::{Result, WeirError};

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// No delay between attempts.
    #[default]
    None,
    /// Constant `initial_delay_ms`.
    Fixed,
    /// `initial_delay_ms * multiplier^retry_count`.
    Exponential,
    /// `initial_delay_ms * (1 + retry_count)`.
    Linear,
}

/// Retry configuration attached to a node definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    /// Maximum number of retries after the first attempt. Valid range 1..=10.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Exponential growth factor. Must be positive.
    pub multiplier: f64,
    /// Error kinds that are retryable. Empty means retry everything not
    /// denied below.
    pub retry_on: Vec<String>,
    /// Error kinds that are never retried. Takes precedence over `retry_on`.
    pub do_not_retry_on: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::None,
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            retry_on: Vec::new(),
            do_not_retry_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.max_attempts) {
            return Err(WeirError::Validation(format!(
                "max_attempts must be in 1..=10, got {}",
                self.max_attempts
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(WeirError::Validation(format!(
                "max_delay_ms ({}) must be >= initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        if self.multiplier <= 0.0 {
            return Err(WeirError::Validation(format!(
                "multiplier must be positive, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Delay before retry number `retry_count` (0-based), clamped to
    /// `max_delay_ms` and jittered by a uniform factor in `[0.75, 1.25]`.
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let base_ms = match self.strategy {
            BackoffStrategy::None => 0.0,
            BackoffStrategy::Fixed => self.initial_delay_ms as f64,
            BackoffStrategy::Exponential => {
                self.initial_delay_ms as f64 * self.multiplier.powi(retry_count as i32)
            }
            BackoffStrategy::Linear => self.initial_delay_ms as f64 * (1.0 + retry_count as f64),
        };

        let clamped = base_ms.min(self.max_delay_ms as f64);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((clamped * jitter).round() as u64)
    }

    /// Whether `err` should be retried under this policy.
    ///
    /// Deny list wins over allow list; an empty allow list retries every
    /// kind not denied. Matching is case-insensitive on the kind tag.
    pub fn should_retry(&self, err: &NodeError) -> bool {
        let kind = err.kind.to_ascii_lowercase();
        if self
            .do_not_retry_on
            .iter()
            .any(|k| k.to_ascii_lowercase() == kind)
        {
            return false;
        }
        if self.retry_on.is_empty() {
            return true;
        }
        self.retry_on.iter().any(|k| k.to_ascii_lowercase() == kind)
    }
}
