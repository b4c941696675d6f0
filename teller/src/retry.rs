//! Bounded retry policies.
//!
//! Every loop that waits on the external application (launch attempts,
//! password submissions, toolbar scans) takes a [`RetryPolicy`] instead of
//! sleeping on its own, so tests can run the same code with zero delays.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "millis", rename = "interval_ms")]
    pub interval: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub backoff: f64,
    /// Upper bound for the grown delay
    #[serde(with = "millis", rename = "max_interval_ms")]
    pub max_interval: Duration,
    /// Random extra delay in `[0, jitter]` added to every wait
    #[serde(with = "millis", rename = "jitter_ms")]
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            backoff: 1.0,
            max_interval: interval,
            jitter: Duration::ZERO,
        }
    }

    /// A policy that never sleeps.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    pub fn with_backoff(mut self, factor: f64, max_interval: Duration) -> Self {
        self.backoff = factor.max(1.0);
        self.max_interval = max_interval.max(self.interval);
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Number of attempts actually made; a zero budget still runs once.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to apply after the failed attempt with the given zero-based index.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap = self.max_interval.max(self.interval);
        let base = if attempt == 0 || self.backoff <= 1.0 {
            self.interval
        } else {
            let grown = self.interval.as_secs_f64() * self.backoff.powi(attempt.min(64) as i32);
            if !grown.is_finite() || grown >= cap.as_secs_f64() {
                cap
            } else {
                Duration::from_secs_f64(grown)
            }
        };

        if self.jitter.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(extra)
    }

    pub async fn wait(&self, attempt: u32) {
        let delay = self.delay_for(attempt);
        if !delay.is_zero() {
            debug!(?delay, attempt, "Waiting before next attempt");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Serializes a [`Duration`] as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
