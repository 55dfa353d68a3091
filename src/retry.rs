//! Poll-until-done driver shared by every migration step.
//!
//! A step function is called repeatedly with the state it handed back on
//! the previous call. It answers with a [`Step`]: run again (optionally
//! after a delay), finish with a value, or fail. Delays are tokio timers
//! and zero-delay re-runs yield to the scheduler first, so a long loop
//! never starves other tasks on a single-threaded runtime.

use std::future::Future;
use std::time::Duration;

use crate::error::{StepError, StoreError};

/// Outcome of one iteration of a [`drive`] loop.
#[derive(Debug)]
pub enum Step<S, T, E> {
    Continue { state: S, delay: Option<Duration> },
    Done(T),
    Failed(E),
}

impl<S, T, E> Step<S, T, E> {
    /// Run again immediately.
    pub fn again(state: S) -> Self {
        Step::Continue { state, delay: None }
    }

    /// Run again once `delay` has elapsed.
    pub fn after(state: S, delay: Duration) -> Self {
        Step::Continue {
            state,
            delay: Some(delay),
        }
    }
}

/// Drive `step` until it reports `Done` or `Failed`.
pub async fn drive<S, T, E, F, Fut>(initial: S, mut step: F) -> Result<T, E>
where
    F: FnMut(S) -> Fut,
    Fut: Future<Output = Step<S, T, E>>,
{
    let mut state = initial;
    loop {
        match step(state).await {
            Step::Done(value) => return Ok(value),
            Step::Failed(err) => return Err(err),
            Step::Continue { state: next, delay } => {
                match delay {
                    Some(d) if !d.is_zero() => tokio::time::sleep(d).await,
                    _ => tokio::task::yield_now().await,
                }
                state = next;
            }
        }
    }
}

/// Default number of re-tries for bucket metadata calls.
pub const DEFAULT_UPGRADE_RETRIES: u32 = 5;

/// Default spacing between bucket metadata re-tries.
pub const DEFAULT_UPGRADE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Fixed-delay, bounded retry budget for a single store call.
///
/// The call is made once and re-made up to `retries` more times, each
/// `delay` apart. Every failure is treated as transient; callers map
/// expected answers (such as "bucket not found") to `Ok` inside `op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_UPGRADE_RETRIES,
            delay: DEFAULT_UPGRADE_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    pub async fn run<T, F, Fut>(&self, op: &'static str, bucket: &str, mut call: F) -> Result<T, StepError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let policy = *self;
        drive(1u32, |attempt| {
            let fut = call();
            async move {
                match fut.await {
                    Ok(value) => Step::Done(value),
                    Err(err) if attempt >= policy.max_attempts() => {
                        tracing::error!(
                            bucket = %bucket,
                            op,
                            attempts = attempt,
                            "Giving up: {}", err
                        );
                        Step::Failed(StepError::RetriesExhausted {
                            op,
                            attempts: attempt,
                            last: err,
                        })
                    }
                    Err(err) => {
                        tracing::warn!(
                            bucket = %bucket,
                            op,
                            attempt,
                            max_attempts = policy.max_attempts(),
                            retry_in_ms = policy.delay.as_millis() as u64,
                            "Store call failed, retrying: {}", err
                        );
                        Step::after(attempt + 1, policy.delay)
                    }
                }
            }
        })
        .await
    }
}
