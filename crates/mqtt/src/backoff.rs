//! Exponential backoff for reconnection attempts.
//!
//! The delay doubles after every failed attempt and saturates at a cap:
//!
//! ```text
//! delay[n] = min(initial * 2^n, max)      n = 0, 1, 2, ...
//! ```
//!
//! With `initial = 1s` and `max = 60s`:
//! - Attempt 0: wait 1s
//! - Attempt 1: wait 2s
//! - Attempt 2: wait 4s
//! - ...
//! - Attempt 6+: wait 60s (capped)
//!
//! The unbounded form drives the connection manager's reconnect loop. The
//! bounded form (`with_max_attempts`) is used by the diagnostic runner when it
//! tries to bring a stopped client up.
//!
//! # Examples
//!
//! ```ignore
//! use std::time::Duration;
//! use birdnet_mqtt_client::Backoff;
//!
//! let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(1));
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(2));
//!
//! backoff.reset();
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(1));
//! ```

use std::time::Duration;

use thiserror::Error;

/// Default cap applied when the configuration does not provide one.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Error type for backoff exhaustion.
#[derive(Debug, Error)]
pub enum BackoffError {
    /// Maximum retry attempts exceeded with the given limit.
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// Doubling backoff controller.
///
/// Not shared between tasks: each reconnect loop owns its own instance and
/// resets it after a successful reconnect.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,

    /// Number of delays handed out since the last reset.
    attempt: u32,

    /// Optional hard limit. `None` means retry forever.
    max_attempts: Option<u32>,
}

impl Backoff {
    /// Creates an unbounded backoff.
    ///
    /// A `max` smaller than `initial` is raised to `initial` so the sequence
    /// never decreases.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max.max(initial),
            attempt: 0,
            max_attempts: None,
        }
    }

    /// Limits the number of delays `next_sleep` hands out before failing.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Delay for attempt `n` without touching any state.
    ///
    /// Saturates at `max_delay` instead of overflowing for large `n`.
    pub fn delay_for_attempt(&self, n: u32) -> Duration {
        2u32.checked_pow(n)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Starts the sequence over from the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns the next sleep duration and advances the counter.
    ///
    /// # Errors
    /// `BackoffError::MaxAttemptLimitError` once a configured attempt limit is
    /// exhausted.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return Err(BackoffError::MaxAttemptLimitError(max));
            }
        }

        let sleep = self.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Ok(sleep)
    }

    /// Delay the next call to `next_sleep` will return.
    pub fn current_delay(&self) -> Duration {
        self.delay_for_attempt(self.attempt)
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    /// 1 second initial delay, 60 second cap, unbounded.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), DEFAULT_MAX_DELAY)
    }
}
