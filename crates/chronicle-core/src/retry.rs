//! Retry policies.
//!
//! Two independent retry loops exist. Backends retry *transient* storage
//! failures through a [`RetryStrategy`] chosen per storage technology. The
//! aggregate store retries *concurrency conflicts* using a [`Backoff`]. A
//! concurrency conflict is never retried by a backend.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Outcome of consulting a retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up and surface the error.
    NoRetry,
    /// Try again after the given delay.
    RetryAfter(Duration),
}

/// Classifies backend errors as transient or fatal.
pub trait RetryStrategy<E>: Send + Sync {
    /// Decides whether the failed attempt number `attempt` (1-based) should
    /// be retried, given the time spent so far.
    fn should_retry(&self, error: &E, elapsed: Duration, attempt: u32) -> RetryDecision;
}

/// Strategy that never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl<E> RetryStrategy<E> for NoRetry {
    fn should_retry(&self, _error: &E, _elapsed: Duration, _attempt: u32) -> RetryDecision {
        RetryDecision::NoRetry
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed(Duration),
    /// `initial * 2^(attempt - 1)`, capped at `max`.
    Exponential {
        /// Delay before the first retry.
        initial: Duration,
        /// Upper bound on any single delay.
        max: Duration,
    },
}

impl Backoff {
    /// Returns the delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => {
                let exponent = attempt.saturating_sub(1).min(31);
                initial.saturating_mul(1_u32 << exponent).min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(500),
        }
    }
}

/// Runs `operation`, retrying while `strategy` classifies the failure as
/// transient.
///
/// With a `cancel` token, cancellation is checked before every attempt and
/// interrupts the delay between attempts. Without one the loop runs until
/// the strategy gives up; backends use that for commits, which must not be
/// abandoned half way.
///
/// # Errors
///
/// Returns the last error once the strategy declines to retry, or
/// `Error::Cancelled` converted into `E` once `cancel` fires.
pub async fn retry_transient<T, E, F, Fut, S>(
    strategy: &S,
    cancel: Option<&CancellationToken>,
    mut operation: F,
) -> Result<T, E>
where
    S: RetryStrategy<E> + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + From<Error>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Cancelled.into());
        }
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => match strategy.should_retry(&error, started.elapsed(), attempt) {
                RetryDecision::NoRetry => return Err(error),
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "transient storage error, retrying"
                    );
                    match cancel {
                        Some(cancel) => sleep_or_cancel(delay, cancel).await?,
                        None => tokio::time::sleep(delay).await,
                    }
                }
            },
        }
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
///
/// # Errors
///
/// Returns `Error::Cancelled` if the token is cancelled before the delay
/// elapses.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), Error> {
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}
