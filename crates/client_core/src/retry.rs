use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use rand::Rng;
use serde::Deserialize;

/// Backoff policy shared by reconnects, token refreshes and mutation replay.
pub trait RetryStrategy: Send + Sync {
    /// Delay for the next attempt; advances the internal attempt counter.
    fn next_delay(&self) -> Duration;
    /// Delay for an explicit attempt number, without touching the counter.
    fn delay_for_attempt(&self, attempt: u32) -> Duration;
    fn attempts(&self) -> u32;
    fn reset(&self);
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(rename = "initial_delay_ms", with = "crate::config::duration_ms")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of each delay that may be randomised away, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryConfig {
    /// Un-jittered ceiling for `attempt`, saturating at `max_delay`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        if self.initial_delay >= self.max_delay {
            return self.max_delay;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let scaled = self.initial_delay.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

/// Exponential backoff with bounded jitter.
///
/// The sample for attempt `n` is drawn from
/// `[max(ceiling(n - 1), ceiling(n) * (1 - jitter)), ceiling(n)]`, so successive
/// delays never shrink even though each one is randomised.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: RetryConfig,
    attempt: AtomicU32,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempt: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self) -> Duration {
        let attempt = self
            .attempt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_add(1))
            })
            .unwrap_or_else(|current| current);
        self.delay_for_attempt(attempt)
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let upper = self.config.ceiling(attempt);
        let previous = match attempt.checked_sub(1) {
            Some(previous) => self.config.ceiling(previous),
            None => Duration::ZERO,
        };
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let lower = previous.max(upper.mul_f64(1.0 - jitter)).min(upper);
        if lower >= upper {
            return upper;
        }

        let secs = rand::thread_rng().gen_range(lower.as_secs_f64()..=upper.as_secs_f64());
        Duration::from_secs_f64(secs).clamp(lower, upper)
    }

    fn attempts(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.attempt.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[path = "tests/retry_tests.rs"]
mod tests;
