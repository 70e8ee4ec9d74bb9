//! Bounded retry with backoff for broker calls.
//!
//! Only errors for which `ExecError::is_retryable` holds are retried; any
//! other error is returned immediately. An optional overall deadline caps
//! the time spent across all attempts, including the backoff sleeps.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::error::{ExecError, ExecResult};

/// Delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time
    Fixed(Duration),
    /// `initial * 2^(attempt-1)`, capped at `max`
    Exponential {
        /// Delay after the first failure
        initial: Duration,
        /// Upper bound
        max: Duration,
    },
}

/// How often and how long to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Overall budget across all attempts
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    /// Exponential backoff starting at `initial`, capped at `max`
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential { initial, max },
            deadline: None,
        }
    }

    /// Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), backoff: Backoff::Fixed(delay), deadline: None }
    }

    /// Single attempt, no retry
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Cap the total time spent
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sleep after the given (1-based) failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                initial.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(4, Duration::from_millis(250), Duration::from_secs(4))
            .with_deadline(Duration::from_secs(15))
    }
}

/// Run `f` until it succeeds, fails permanently, or the policy is exhausted.
///
/// `f` receives the 1-based attempt number. The last error is returned when
/// attempts run out; `ExecError::Timeout` when the deadline passes first.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut f: F) -> ExecResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ExecResult<T>>,
{
    let deadline = policy.deadline.map(|d| Instant::now() + d);
    let mut attempt = 1;

    loop {
        let outcome = match deadline {
            Some(at) => match tokio::time::timeout_at(at, f(attempt)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(ExecError::Timeout(format!(
                        "{} exceeded its deadline on attempt {}",
                        operation, attempt
                    )))
                }
            },
            None => f(attempt).await,
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => err,
            Err(err) => return Err(err),
        };

        let delay = policy.delay_after(attempt);
        if let Some(at) = deadline {
            if Instant::now() + delay >= at {
                return Err(err);
            }
        }

        warn!(
            operation,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retryable broker error, backing off"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
