//! Retry policy with exponential backoff

use std::time::Duration;

use crate::config::RequestConfig;

/// How many times a request is tried and how long to wait in between
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (at least one is always made)
    pub max_attempts: u32,
    /// Timeout of a single attempt
    pub timeout: Duration,
    /// Delay after the first failed attempt
    pub backoff_base: Duration,
    /// Upper bound for any delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RequestConfig::default())
    }
}

impl RetryPolicy {
    /// Create a policy with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy described by the `[requests]` config section
    #[must_use]
    pub fn from_config(config: &RequestConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            timeout: Duration::from_millis(config.timeout_ms),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// One attempt, no backoff
    #[must_use]
    pub fn single_attempt(timeout: Duration) -> Self {
        Self::new().with_max_attempts(1).with_timeout(timeout)
    }

    /// Set maximum attempts
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set backoff base
    #[must_use]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set backoff ceiling
    #[must_use]
    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Attempts actually made, never zero
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Wait after the failed attempt with the given zero-based index:
    /// `base * 2^attempt`, capped at `max_backoff`
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.timeout, Duration::from_secs(30));
        assert_eq!(policy.backoff_base, Duration::from_millis(500));
    }

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new().with_backoff_base(Duration::from_millis(500));

        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_delay_respects_max() {
        let policy = RetryPolicy::new()
            .with_backoff_base(Duration::from_secs(1))
            .with_max_backoff(Duration::from_secs(5));

        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::new().with_max_attempts(0).attempts(), 1);
        assert_eq!(
            RetryPolicy::single_attempt(Duration::from_secs(1)).attempts(),
            1
        );
    }
}
