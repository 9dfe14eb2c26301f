//! Bounded retry with exponential backoff.
//!
//! The reconcile unit of work is retried on storage outages, store timeouts
//! and version conflicts; invoice delivery is retried on any notifier error.
//! Everything else fails on the first attempt.

use std::time::Duration;

use crate::error::ReconcileError;

/// How many times to try and how long to wait in between.
///
/// The wait after failed attempt `n` (0-based) is
/// `initial_delay * backoff_multiplier^n`, never more than `max_delay`.
///
/// ```
/// use std::time::Duration;
///
/// use plan_reconciler::reliability::RetryPolicy;
///
/// let policy = RetryPolicy {
///     max_attempts: 4,
///     initial_delay: Duration::from_millis(50),
///     max_delay: Duration::from_millis(150),
///     backoff_multiplier: 2.0,
/// };
/// let waits: Vec<_> = policy.backoff().collect();
/// assert_eq!(
///     waits,
///     [Duration::from_millis(50), Duration::from_millis(100), Duration::from_millis(150)]
/// );
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first; `0` is treated as `1`.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_delay: Duration,
    /// Ceiling for any single wait.
    pub max_delay: Duration,
    /// Growth factor between consecutive waits.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Default delays with a different attempt budget.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self { max_attempts, ..Self::default() }
    }

    /// Single attempt, no waiting.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::with_max_attempts(1)
    }

    /// The waits between attempts, one fewer than the attempt budget.
    pub fn backoff(&self) -> Backoff<'_> {
        Backoff { policy: self, step: 0 }
    }

    fn wait_after(&self, step: u32) -> Duration {
        let exponent = i32::try_from(step).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss, reason = "delays are far below 2^52 ms")]
        let wait_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        if !wait_ms.is_finite() {
            return self.max_delay;
        }
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "float to int casts saturate and the result is capped"
        )]
        let wait = Duration::from_millis(wait_ms as u64);
        wait.min(self.max_delay)
    }
}

/// Iterator over the waits of a [`RetryPolicy`].
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    step: u32,
}

impl Iterator for Backoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.step + 1 >= self.policy.max_attempts.max(1) {
            return None;
        }
        let wait = self.policy.wait_after(self.step);
        self.step += 1;
        Some(wait)
    }
}

/// Runs `operation` until it succeeds, `should_retry` rejects its error, or
/// the attempt budget is spent.
///
/// ```
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// use plan_reconciler::reliability::{RetryPolicy, retry_with_backoff};
///
/// # async fn example() -> Result<(), String> {
/// let calls = AtomicU32::new(0);
/// let value = retry_with_backoff(&RetryPolicy::default(), |_| true, || async {
///     match calls.fetch_add(1, Ordering::Relaxed) {
///         0 => Err("store busy".to_owned()),
///         _ => Ok("committed"),
///     }
/// })
/// .await?;
/// assert_eq!(value, "committed");
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// The error of the last attempt made.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut waits = policy.backoff();
    let mut attempt: u32 = 1;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Succeeded on retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !should_retry(&error) {
            return Err(error);
        }
        let Some(wait) = waits.next() else {
            tracing::warn!(attempt, error = %error, "Retry budget exhausted");
            return Err(error);
        };

        tracing::warn!(
            attempt,
            error = %error,
            wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            "Attempt failed, backing off"
        );
        tokio::time::sleep(wait).await;
        attempt += 1;
    }
}

/// Whether repeating the reconcile unit of work could change the result.
///
/// Only storage errors the store marks transient qualify.
///
/// ```
/// use plan_reconciler::{
///     entitlement::StoreError, error::ReconcileError, reliability::is_retryable,
/// };
///
/// assert!(is_retryable(&ReconcileError::StorageUnavailable(StoreError::Timeout)));
/// assert!(!is_retryable(&ReconcileError::InvalidPlan("Gold".to_owned())));
/// ```
#[must_use]
pub fn is_retryable(error: &ReconcileError) -> bool {
    matches!(error, ReconcileError::StorageUnavailable(e) if e.is_transient())
}
