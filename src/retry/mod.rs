//! Retry machinery for spawn+drain attempts
//!
//! [`RetryController::run`] drives an attempt closure until it succeeds, is
//! aborted by the user, fails with a non-retryable kind, or exhausts the
//! attempt budget. Aborts are recognised before classification and never
//! retried.

mod classify;

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{ClaudeError, Result};

pub use classify::{ErrorClassification, ErrorKind, classify_error, classify_message};

// ============================================================================
// Policy
// ============================================================================

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Upper bound on computed (not server-specified) delays
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(16),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    ///
    /// A retry-after value carried by the failure is authoritative and
    /// replaces the computed backoff.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, classification: &ErrorClassification) -> Duration {
        if let Some(secs) = classification.retry_after_secs {
            return Duration::from_secs(secs);
        }
        self.backoff(attempt)
    }

    /// `initial_delay × multiplier^(attempt-1)`, capped at `max_delay`
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = self.multiplier.powi(i32::try_from(exponent).unwrap_or(32));
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Emitted before waiting for a retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryNotice {
    /// Attempt about to run
    pub attempt: u32,
    /// Attempt budget
    pub max_attempts: u32,
    /// Wait before the attempt
    pub delay: Duration,
    /// Why the previous attempt failed
    pub classification: ErrorClassification,
}

/// Terminal outcome of a failed run
#[derive(Debug)]
pub enum RetryError {
    /// User-triggered abort; not a failure
    Aborted(ClaudeError),
    /// Non-retryable failure, or the budget ran out
    Failed {
        /// Classification of the last failure
        classification: ErrorClassification,
        /// Attempts made
        attempts: u32,
        /// Last error
        source: ClaudeError,
    },
}

/// Wraps spawn+drain attempts with classification and backoff
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    /// Create a controller with the given policy
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The active policy
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt` until it succeeds or a terminal condition is reached
    ///
    /// `on_retry` is called before every backoff wait. Cancelling `cancel`
    /// during a wait ends the run as [`RetryError::Aborted`].
    ///
    /// # Errors
    /// Returns [`RetryError`] describing why no attempt succeeded
    pub async fn run<T, F, Fut, N>(
        &self,
        attempt: F,
        on_retry: N,
        cancel: &CancellationToken,
    ) -> std::result::Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        N: FnMut(&RetryNotice),
    {
        self.run_with_progress(attempt, || false, on_retry, cancel)
            .await
    }

    /// Like [`run`](Self::run), for attempts that serve many units of work
    ///
    /// After every failure `made_progress` is asked whether the failed attempt
    /// completed anything first. If it did, the attempt count and the backoff
    /// exponent start over, so only failures since the last success count
    /// against the budget.
    ///
    /// # Errors
    /// Returns [`RetryError`] describing why no attempt succeeded
    pub async fn run_with_progress<T, F, Fut, P, N>(
        &self,
        mut attempt: F,
        mut made_progress: P,
        mut on_retry: N,
        cancel: &CancellationToken,
    ) -> std::result::Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: FnMut() -> bool,
        N: FnMut(&RetryNotice),
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut number = 1;

        loop {
            let error = match attempt(number).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if error.is_abort() || cancel.is_cancelled() {
                return Err(RetryError::Aborted(error));
            }

            if made_progress() && number > 1 {
                log::debug!("Attempt {number} made progress before failing; retry budget reset");
                number = 1;
            }

            let classification = classify_error(&error);
            if !classification.retryable || number >= max_attempts {
                log::warn!(
                    "Attempt {number}/{max_attempts} failed ({}), giving up: {}",
                    classification.kind,
                    classification.message
                );
                return Err(RetryError::Failed {
                    classification,
                    attempts: number,
                    source: error,
                });
            }

            let delay = self.policy.delay_for(number, &classification);
            log::info!(
                "Attempt {number}/{max_attempts} failed ({}), retrying in {}ms",
                classification.kind,
                delay.as_millis()
            );
            number += 1;
            on_retry(&RetryNotice {
                attempt: number,
                max_attempts,
                delay,
                classification,
            });

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(RetryError::Aborted(ClaudeError::aborted("cancelled during retry backoff")));
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
