//! Backoff between tunnel connection attempts

use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Exponential backoff schedule for reconnecting the tunnel
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Consecutive failures tolerated before giving up (None = retry forever)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(5),
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(scaled)
    }
}

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Gave up after {0} reconnection attempts")]
    MaxAttemptsReached(usize),
}

/// Counts consecutive failed attempts and sleeps out the backoff
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    failures: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failure and sleep before the next attempt
    ///
    /// Returns the delay slept, or an error once the failure count passes
    /// `max_attempts`.
    pub async fn wait(&mut self) -> Result<Duration, ReconnectError> {
        self.failures += 1;

        if let Some(limit) = self.config.max_attempts {
            if self.failures > limit {
                return Err(ReconnectError::MaxAttemptsReached(limit));
            }
        }

        let delay = self.config.delay_for(self.failures);
        debug!(attempt = self.failures, "Retrying tunnel in {:?}", delay);
        tokio::time::sleep(delay).await;
        Ok(delay)
    }

    /// Start the schedule over; called once registration succeeds
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn attempt(&self) -> usize {
        self.failures
    }

    /// Delay the next call to [`wait`](Self::wait) would sleep
    pub fn current_backoff(&self) -> Duration {
        self.config.delay_for(self.failures + 1)
    }
}
