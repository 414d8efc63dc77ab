use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::remote::RemoteError;

/// Bounded retry for optimistic transactions that lose a precondition race.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 50,
            max_backoff_ms: 2000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max_backoff_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(10);
        let ms = self.base_backoff_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

/// Outcome of a transaction whose every attempt lost to a concurrent writer.
#[derive(Debug)]
pub struct Exhausted {
    pub attempts: u32,
    pub last: RemoteError,
}

/// Run `attempt` until it stops failing with [`RemoteError::Conflict`].
///
/// Each call must re-read everything it writes; the closure receives the
/// 1-based attempt number. Errors other than conflicts are returned as-is.
pub async fn retry_on_conflict<T, E, F, Fut>(
    policy: &RetryPolicy,
    op: &'static str,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<Exhausted> + AsConflict,
{
    let mut n = 1;
    loop {
        match attempt(n).await {
            Ok(v) => return Ok(v),
            Err(err) => {
                let Some(conflict) = err.as_conflict() else {
                    return Err(err);
                };
                if n >= policy.max_attempts {
                    warn!(op, attempts = n, "transaction retries exhausted");
                    return Err(E::from(Exhausted {
                        attempts: n,
                        last: conflict,
                    }));
                }
                let delay = policy.delay_for_attempt(n);
                debug!(op, attempt = n, ?delay, "transaction conflict; retrying");
                tokio::time::sleep(delay).await;
                n += 1;
            }
        }
    }
}

/// Errors that can carry a remote precondition conflict.
pub trait AsConflict {
    fn as_conflict(&self) -> Option<RemoteError>;
}
