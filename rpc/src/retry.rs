//! Exponential backoff for transport failures.
//!
//! The policy only decides how many attempts a call gets and how long to
//! wait between them. Which failures are worth retrying is decided by the
//! client: transport errors and timeouts are, application responses never
//! are.
//!
//! # Example
//!
//! ```
//! use listings_rpc::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .initial_backoff(Duration::from_millis(100))
//!     .build();
//!
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
//! assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
//! ```

use std::time::Duration;

/// Attempt ceiling and backoff schedule for one RPC call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Start building a policy from the defaults.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            initial_backoff: None,
            max_backoff: None,
            multiplier: None,
        }
    }

    /// Total attempts, including the first. Never less than 1.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait after the first failed attempt.
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Wait after failed attempt number `attempt` (1-based).
    ///
    /// `initial_backoff * multiplier^(attempt - 1)`, capped at the maximum.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }

        Duration::from_millis(delay_ms as u64)
    }

    /// Whether another attempt is allowed after `attempt` failed.
    #[must_use]
    pub const fn has_attempts_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Total attempts per call. Zero is treated as one.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Wait after the first failure.
    #[must_use]
    pub const fn initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = Some(delay);
        self
    }

    /// Cap for the growing backoff.
    #[must_use]
    pub const fn max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = Some(delay);
        self
    }

    /// Growth factor applied after every failure.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            initial_backoff: self.initial_backoff.unwrap_or(defaults.initial_backoff),
            max_backoff: self.max_backoff.unwrap_or(defaults.max_backoff),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
        }
    }
}
