//! Transient-failure classification for the `PostgreSQL` backends.

use std::time::Duration;

use serde::Deserialize;

use chronicle_core::config::BackoffConfig;
use chronicle_core::retry::{Backoff, RetryDecision, RetryStrategy};

use crate::error::PgError;

/// SQLSTATE codes worth another attempt: serialization failure, deadlock
/// detected, lock not available.
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03"];

/// Retry settings for the `PostgreSQL` backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PgRetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    pub backoff: BackoffConfig,
}

impl Default for PgRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffConfig::Exponential {
                initial_ms: 20,
                max_ms: 1_000,
            },
        }
    }
}

/// Retries serialization failures, deadlocks, lock timeouts, pool timeouts
/// and I/O errors. Everything else, including unique violations, is final.
#[derive(Debug, Clone, Copy)]
pub struct PgRetryStrategy {
    max_attempts: u32,
    backoff: Backoff,
}

impl PgRetryStrategy {
    /// Creates a strategy allowing `max_attempts` attempts in total.
    #[must_use]
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }
}

impl Default for PgRetryStrategy {
    fn default() -> Self {
        PgRetryConfig::default().into()
    }
}

impl From<PgRetryConfig> for PgRetryStrategy {
    fn from(config: PgRetryConfig) -> Self {
        Self::new(config.max_attempts, config.backoff.into())
    }
}

/// Returns `true` if `error` is likely to succeed on a later attempt.
#[must_use]
pub fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&&*code)),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        _ => false,
    }
}

impl RetryStrategy<PgError> for PgRetryStrategy {
    fn should_retry(&self, error: &PgError, _elapsed: Duration, attempt: u32) -> RetryDecision {
        match error {
            PgError::Database(e) if attempt < self.max_attempts && is_transient(e) => {
                RetryDecision::RetryAfter(self.backoff.delay(attempt))
            }
            _ => RetryDecision::NoRetry,
        }
    }
}
