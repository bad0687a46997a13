//! Retry engine with exponential backoff.
//!
//! [`run_with_backoff`] drives a single attempt future at a time: on a
//! transient failure it sleeps (10 ms doubling up to 5 s) and tries
//! again; a terminal failure or a fired cancellation token ends the loop
//! immediately. An optional attempt cap turns exhaustion into
//! [`InitError::MaxAttemptsReached`].

use std::cmp;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{InitError, Phase};

/// Delay before the first retry.
pub const INITIAL_DELAY: Duration = Duration::from_millis(10);

/// Upper bound on the delay between retries.
pub const MAX_DELAY: Duration = Duration::from_secs(5);

/// Retry policy for one phase.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts allowed; `None` retries indefinitely.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: INITIAL_DELAY,
            max_delay: MAX_DELAY,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Run `attempt` until it succeeds, fails terminally, is cancelled, or
/// exhausts the attempt cap.
///
/// `is_transient` classifies each failure; `on_retry` observes every
/// failure that will be retried (the status model feeds `latest_error`
/// from it). The loop never overlaps attempts, and the inter-attempt
/// sleep is raced against `cancel` so cancellation is prompt.
pub async fn run_with_backoff<T, F, Fut>(
    phase: Phase,
    policy: BackoffPolicy,
    cancel: &CancellationToken,
    is_transient: impl Fn(&anyhow::Error) -> bool,
    mut on_retry: impl FnMut(&anyhow::Error),
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.initial_delay;
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(InitError::Cancelled { phase }.into());
        }

        match attempt().await {
            Ok(value) => {
                debug!(phase = %phase, attempts = attempts + 1, "attempt succeeded");
                return Ok(value);
            }
            Err(err) => {
                if !is_transient(&err) {
                    debug!(phase = %phase, error = %format!("{err:#}"), "terminal error");
                    return Err(err);
                }
                attempts += 1;
                if let Some(max) = policy.max_attempts {
                    if attempts >= max {
                        return Err(
                            anyhow::Error::new(InitError::MaxAttemptsReached { phase }).context(
                                format!("giving up after {attempts} attempts; last error: {err:#}"),
                            ),
                        );
                    }
                }
                warn!(
                    phase = %phase,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %format!("{err:#}"),
                    "transient error; scheduling retry"
                );
                on_retry(&err);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(InitError::Cancelled { phase }.into());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = cmp::min(delay * 2, policy.max_delay);
            }
        }
    }
}
