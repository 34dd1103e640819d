//! Exponential backoff for operations racing an external publisher, such as
//! pulling an image whose tag was pushed moments before the image itself.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 5 attempts with waits of 30s, 60s, 120s, 240s between them, capped
    /// at 5 minutes.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(5 * 60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Wait after failed attempt `attempt` (1-based):
    /// `min(initial * multiplier^(attempt-1), max)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let nanos = (self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exp)).round();
        let capped = nanos.min(self.max_delay.as_nanos() as f64);
        if !capped.is_finite() || capped <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(capped as u64)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("retry cancelled after {attempts} attempt(s): {last}")]
    Cancelled { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn last(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Cancelled { last, .. } => last,
        }
    }

    pub fn into_last(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Cancelled { last, .. } => last,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is reached. `cancel`
/// resolving during a wait aborts immediately with [`RetryError::Cancelled`].
/// `op` receives the 1-based attempt number.
pub async fn with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    cancel: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Future<Output = ()>,
    E: std::fmt::Display,
{
    tokio::pin!(cancel);
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, max_attempts, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.delay_after(attempt);
        tracing::warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "attempt failed, retrying"
        );
        tokio::select! {
            _ = &mut cancel => {
                return Err(RetryError::Cancelled { attempts: attempt, last: err });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
