//! Typed retry policy for transient venue failures.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Terminal outcome of a retried operation.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::fmt::Display + std::fmt::Debug> {
    /// Every attempt failed with a retryable error.
    #[error("operation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    /// A non-retryable error ended the loop immediately.
    #[error("operation failed fatally: {0}")]
    Fatal(E),
}

/// Run `op` up to `max_attempts` times, sleeping `settle` between attempts.
///
/// `is_retryable` classifies each error: retryable errors consume an attempt,
/// anything else is returned as `Fatal` without another try.
pub async fn retry<T, E, F, Fut>(
    max_attempts: u32,
    settle: Duration,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display + std::fmt::Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last: Option<E> = None;

    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) => {
                warn!(attempt, max_attempts, error = %e, "Retryable failure");
                last = Some(e);
                if attempt < max_attempts {
                    tokio::time::sleep(settle).await;
                }
            }
            Err(e) => return Err(RetryError::Fatal(e)),
        }
    }

    Err(RetryError::Exhausted {
        attempts: max_attempts,
        last: last.expect("at least one attempt must have run"),
    })
}
