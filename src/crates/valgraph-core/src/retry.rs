//! Retry policies with exponential backoff for transient node failures.
//!
//! A policy bounds how many times a node runs and how long the runtime
//! waits between attempts: `delay = initial_interval * backoff_factor ^
//! attempt`, capped at `max_interval`, optionally jittered by a random
//! factor in `0.5..=1.5` to avoid thundering herds against rate-limited
//! providers. `retry_on` restricts retries to the listed node error kinds;
//! an empty set retries every node error.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;

/// Configuration for retrying failed node executions
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: usize,

    /// Initial interval between retries in seconds
    pub initial_interval: f64,

    /// Multiplier for the interval after each retry
    pub backoff_factor: f64,

    /// Maximum interval between retries in seconds
    pub max_interval: f64,

    /// Whether to add random jitter to intervals
    pub jitter: bool,

    /// Node error kinds eligible for retry; empty retries all node errors
    pub retry_on: HashSet<String>,
}

impl RetryPolicy {
    /// Create a new retry policy with the given max attempts
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 128.0,
            jitter: true,
            retry_on: HashSet::new(),
        }
    }

    /// Set the initial interval between retries
    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    /// Set the backoff factor
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the maximum interval between retries
    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Restrict retries to the given error kinds
    pub fn with_retry_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry_on = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Whether an error of `kind` is retryable under this policy
    pub fn retries_kind(&self, kind: &str) -> bool {
        self.retry_on.is_empty() || self.retry_on.contains(kind)
    }

    /// Check if another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }

    /// Calculate the delay before retrying a given 0-indexed attempt
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::from_secs(0);
        }

        let base_delay = self.initial_interval * self.backoff_factor.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_interval);

        let final_delay = if self.jitter {
            let mut rng = rand::thread_rng();
            capped_delay * rng.gen_range(0.5..=1.5)
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
