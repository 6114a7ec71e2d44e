//! Retry and backoff policy
//!
//! Exponential backoff with full jitter: every delay is drawn uniformly
//! from zero up to the capped exponential bound, so synchronized retries
//! from many executions spread out instead of stampeding.

use std::time::Duration;

use rand::Rng;

use crate::error::{RetryDecision, SyncError};

/// What the caller should do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Give up and surface the error
    Abort,
    /// Refresh credentials, then retry immediately
    RefreshAndRetry,
    /// Sleep for the given delay, then retry
    RetryAfter(Duration),
}

/// Backoff parameters, taxonomy-aware
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(300),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Full-jitter delay for the given zero-based attempt:
    /// `rand(0, min(max_backoff, initial × multiplier^attempt))`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let bound = self.backoff_bound(attempt);
        if bound.is_zero() {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        Duration::from_secs_f64(rng.random_range(0.0..=bound.as_secs_f64()))
    }

    /// Upper bound of the jitter window for an attempt
    pub fn backoff_bound(&self, attempt: u32) -> Duration {
        let raw = self.initial_interval.as_secs_f64() * self.multiplier.powi(attempt.min(63) as i32);
        Duration::from_secs_f64(raw.min(self.max_backoff.as_secs_f64()))
    }

    /// Decide the next step after a failure
    ///
    /// `attempt` counts completed attempts (0 after the first failure);
    /// `refreshed` records whether a credential refresh already happened
    /// for this operation.
    pub fn next_action(&self, err: &SyncError, attempt: u32, refreshed: bool) -> RetryAction {
        match err.retry_decision() {
            RetryDecision::No => RetryAction::Abort,
            RetryDecision::RefreshThenRetry => {
                if refreshed {
                    RetryAction::Abort
                } else {
                    RetryAction::RefreshAndRetry
                }
            }
            RetryDecision::Retry => {
                if attempt >= self.max_retries {
                    RetryAction::Abort
                } else {
                    RetryAction::RetryAfter(self.backoff_delay(attempt))
                }
            }
        }
    }
}
