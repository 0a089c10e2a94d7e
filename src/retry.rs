//! Exponential backoff with jitter for re-queued work.
//!
//! The work queue asks this policy how long a key must wait before it is
//! delivered again, and whether a key has failed often enough to be dropped.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use volume_upload::retry::RetryConfig;
//!
//! let config = RetryConfig::with_max_attempts(5);
//! assert!(config.base_delay(3) > config.base_delay(1));
//! assert!(config.is_exhausted(5));
//! assert!(config.base_delay(50) <= Duration::from_secs(30));
//! ```

use std::time::Duration;

use rand::Rng;

/// Backoff policy for keys that failed to sync.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of failed attempts before a key is dropped (0 = infinite)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Delay before redelivery after `failures` consecutive failures, without jitter.
    ///
    /// Zero failures means the key has never failed and is delivered at once.
    pub fn base_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before redelivery, with 0.5x to 1.5x jitter, capped at `max_delay`
    pub fn delay(&self, failures: u32) -> Duration {
        let base = self.base_delay(failures);
        if base.is_zero() {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64((base.as_secs_f64() * jitter).min(self.max_delay.as_secs_f64()))
    }

    /// Whether a key with this many failures should be dropped
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_attempts > 0 && failures >= self.max_attempts
    }
}
