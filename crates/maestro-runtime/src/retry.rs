//! Retry policy: exponential backoff with uniform jitter.
//!
//! For failing attempt `n` (1-based) the next run is delayed
//! `base * 2^(n-1) + uniform(0, jitter)` seconds. Attempts beyond
//! `max_retries` are final. Per-work-item overrides shadow the process
//! defaults field by field.

use rand::Rng;

use crate::models::{WorkItem, WorkItemPolicy};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_seconds: i64,
    pub backoff_jitter_seconds: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_seconds: 30,
            backoff_jitter_seconds: 0,
        }
    }
}

impl RetryPolicy {
    /// Resolve the effective policy for a work item.
    pub fn for_work_item(&self, work_item: &WorkItem) -> Self {
        self.with_overrides(&work_item.policy)
    }

    pub fn with_overrides(&self, overrides: &WorkItemPolicy) -> Self {
        Self {
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            backoff_base_seconds: overrides
                .backoff_base_seconds
                .unwrap_or(self.backoff_base_seconds),
            backoff_jitter_seconds: overrides
                .backoff_jitter_seconds
                .unwrap_or(self.backoff_jitter_seconds),
        }
    }

    /// Whether a run that just failed (or lost its lease) on `attempt`
    /// still has budget for another run.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Delay before the retry of failed attempt `attempt` becomes due.
    pub fn delay_seconds(&self, attempt: u32) -> f64 {
        let exponent = attempt.max(1) - 1;
        let backoff = (self.backoff_base_seconds as f64) * 2f64.powi(exponent as i32);
        let jitter = if self.backoff_jitter_seconds > 0 {
            rand::thread_rng().gen_range(0.0..self.backoff_jitter_seconds as f64)
        } else {
            0.0
        };
        backoff + jitter
    }
}
