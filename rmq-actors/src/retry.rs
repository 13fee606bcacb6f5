//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure connection retrying.
use std::time;

use rand::Rng;

#[derive(Clone, Debug)]
/// A retry policy to determine backoff between connection attempts.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// The maximum number of attempts, retry forever when `None`.
    pub maximum_attempts: Option<u32>,
    /// Pick a random interval between `initial_interval` and the computed backoff.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine the upper bound of the interval to wait before a given attempt number (1-based).
    /// Saturates at `maximum_interval`, or at `Duration::MAX` if none is set.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Interval to actually sleep before an attempt, with jitter applied if enabled.
    pub fn backoff(&self, attempt: u32) -> time::Duration {
        let interval = self.retry_interval(attempt);
        if !self.jitter || interval <= self.initial_interval {
            return interval;
        }
        let low = self.initial_interval.as_millis() as u64;
        let high = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        time::Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }

    /// Whether the 1-based `attempt` is still within the budget.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        match self.maximum_attempts {
            Some(max) => attempt <= max,
            None => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// The maximum number of attempts.
    pub maximum_attempts: Option<u32>,
    pub jitter: bool,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
            maximum_attempts: None,
            jitter: false,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn maximum_attempts(mut self, attempts: u32) -> RetryPolicyBuilder {
        self.maximum_attempts = Some(attempts);
        self
    }

    pub fn jitter(mut self, jitter: bool) -> RetryPolicyBuilder {
        self.jitter = jitter;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            maximum_attempts: self.maximum_attempts,
            jitter: self.jitter,
        }
    }
}
