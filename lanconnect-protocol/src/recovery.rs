//! Backoff for listener recovery
//!
//! Used by the LAN service when accepting fails or when the discovery socket
//! cannot be bound: wait, double the delay, give up only if a limit is set.

use std::time::Duration;

/// Initial delay
const INITIAL_DELAY: Duration = Duration::from_secs(2);

/// Maximum delay
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff
#[derive(Debug, Clone)]
pub struct BackoffStrategy {
    /// Current attempt number
    pub attempt: u32,
    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Delay returned by the next call
    pub current_delay: Duration,
    /// First delay after a reset
    pub initial_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            attempt: 0,
            max_attempts: None,
            current_delay: INITIAL_DELAY,
            initial_delay: INITIAL_DELAY,
            max_delay: MAX_DELAY,
        }
    }
}

impl BackoffStrategy {
    /// Unlimited backoff with the default delays
    pub fn new() -> Self {
        Self::default()
    }

    /// Backoff with custom delays
    pub fn with_delays(initial: Duration, max: Duration) -> Self {
        Self {
            current_delay: initial,
            initial_delay: initial,
            max_delay: max,
            ..Self::default()
        }
    }

    /// Limit the number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Reset after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.initial_delay;
    }

    /// Check if more attempts are available
    pub fn has_attempts_remaining(&self) -> bool {
        self.max_attempts.map_or(true, |max| self.attempt < max)
    }

    /// Get next delay, doubling each time up to the cap
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.has_attempts_remaining() {
            return None;
        }

        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = std::cmp::min(self.current_delay * 2, self.max_delay);

        Some(delay)
    }
}
