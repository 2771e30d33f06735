//! Aggregate store configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::retry::Backoff;
use crate::upgrade::DEFAULT_MAX_ITERATIONS;

/// Delay schedule for concurrency retries, as read from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Constant delay.
    Fixed {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// Doubling delay with a cap.
    Exponential {
        /// First delay in milliseconds.
        initial_ms: u64,
        /// Largest delay in milliseconds.
        max_ms: u64,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: 10,
            max_ms: 500,
        }
    }
}

impl From<BackoffConfig> for Backoff {
    fn from(config: BackoffConfig) -> Self {
        match config {
            BackoffConfig::Fixed { delay_ms } => Self::Fixed(Duration::from_millis(delay_ms)),
            BackoffConfig::Exponential { initial_ms, max_ms } => Self::Exponential {
                initial: Duration::from_millis(initial_ms),
                max: Duration::from_millis(max_ms),
            },
        }
    }
}

/// Tunables for [`AggregateStore`](crate::aggregate_store::AggregateStore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AggregateStoreConfig {
    /// Retries after the first attempt when a commit hits a concurrency
    /// conflict.
    pub max_concurrency_retries: u32,
    /// Delay schedule between concurrency retries.
    pub backoff: BackoffConfig,
    /// Bound on upgrader passes per stored event.
    pub max_upgrade_iterations: usize,
    /// How long a cached event stream stays valid, in seconds.
    pub cache_ttl_secs: u64,
}

impl Default for AggregateStoreConfig {
    fn default() -> Self {
        Self {
            max_concurrency_retries: 5,
            backoff: BackoffConfig::default(),
            max_upgrade_iterations: DEFAULT_MAX_ITERATIONS,
            cache_ttl_secs: 60,
        }
    }
}

impl AggregateStoreConfig {
    /// Returns the cache TTL as a `Duration`.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
