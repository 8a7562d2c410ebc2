use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RetryError {
    #[error("Invalid retry configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    #[default]
    ExponentialBackoff,
    LinearBackoff,
    FixedDelay,
}

/// Redelivery policy for events the store asked us to retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Publish attempts per batch before it is abandoned upstream. 0 = never give up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategy::ExponentialBackoff,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), RetryError> {
        if self.base_delay.is_zero() {
            return Err(RetryError::InvalidConfig("base delay must be positive".into()));
        }
        if self.max_delay < self.base_delay {
            return Err(RetryError::InvalidConfig(format!(
                "max delay {:?} is below base delay {:?}",
                self.max_delay, self.base_delay
            )));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based), capped and optionally jittered.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let step = attempt.saturating_sub(1);
        let delay = match self.strategy {
            RetryStrategy::ExponentialBackoff => self
                .base_delay
                .saturating_mul(2_u32.saturating_pow(step.min(31))),
            RetryStrategy::LinearBackoff => self.base_delay.saturating_mul(attempt.max(1)),
            RetryStrategy::FixedDelay => self.base_delay,
        };

        let capped = delay.min(self.max_delay);
        if self.jitter {
            apply_jitter(capped)
        } else {
            capped
        }
    }

    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            config: self,
            attempts: 0,
        }
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let mut rng = rand::rng();
    let factor = rng.random_range(0.5..1.5); // ±50%
    delay.mul_f64(factor)
}

/// Attempt counter for one batch.
#[derive(Debug)]
pub struct Backoff<'a> {
    config: &'a RetryConfig,
    attempts: u32,
}

impl Backoff<'_> {
    /// Record a failed attempt. Returns the wait before the next one, or
    /// `None` when the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.config.max_attempts != 0 && self.attempts >= self.config.max_attempts {
            return None;
        }
        Some(self.config.calculate_delay(self.attempts))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
