//! Per-turn inactivity watchdog
//!
//! A [`TimeoutController`] arms two deadlines when constructed: a warning
//! deadline that invokes a callback, and a hard deadline after which the turn
//! is considered dead. Meaningful progress calls [`TimeoutController::reset`];
//! a completed turn calls [`TimeoutController::cancel`] so idle time between
//! turns is not counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ClaudeError, Result};

type WarningCallback = Box<dyn Fn(Duration) + Send + Sync>;

struct TimeoutInner {
    warning_after: Duration,
    hard_after: Duration,
    on_warning: WarningCallback,
    fired: AtomicBool,
    expired: CancellationToken,
}

/// Resettable warning + hard-timeout watchdog bound to one turn
pub struct TimeoutController {
    inner: Arc<TimeoutInner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutController {
    /// Create and arm a watchdog
    ///
    /// `on_warning` receives the silence duration when the warning deadline
    /// passes. No warning is issued when `warning_after >= hard_after`.
    pub fn new(
        warning_after: Duration,
        hard_after: Duration,
        on_warning: impl Fn(Duration) + Send + Sync + 'static,
    ) -> Self {
        let controller = Self {
            inner: Arc::new(TimeoutInner {
                warning_after,
                hard_after,
                on_warning: Box::new(on_warning),
                fired: AtomicBool::new(false),
                expired: CancellationToken::new(),
            }),
            timer: Mutex::new(None),
        };
        controller.arm();
        controller
    }

    /// Restart both deadlines from now
    ///
    /// Has no effect once the hard deadline fired.
    pub fn reset(&self) {
        if self.has_fired() {
            return;
        }
        self.arm();
    }

    /// Stop both deadlines until the next [`reset`](Self::reset)
    pub fn cancel(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    /// Fail if the hard deadline already passed
    ///
    /// # Errors
    /// Returns `ClaudeError::Timeout` after the hard deadline fired
    pub fn check_timeout(&self) -> Result<()> {
        if self.has_fired() {
            return Err(ClaudeError::timeout(format!(
                "no progress from the agent for {}s",
                self.inner.hard_after.as_secs()
            )));
        }
        Ok(())
    }

    /// Whether the hard deadline passed
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Token cancelled when the hard deadline passes
    #[must_use]
    pub fn expired(&self) -> CancellationToken {
        self.inner.expired.clone()
    }

    fn arm(&self) {
        let inner = Arc::clone(&self.inner);

        let timer = tokio::spawn(async move {
            let mut waited = Duration::ZERO;
            if inner.warning_after < inner.hard_after {
                tokio::time::sleep(inner.warning_after).await;
                waited = inner.warning_after;
                (inner.on_warning)(waited);
            }
            tokio::time::sleep(inner.hard_after.saturating_sub(waited)).await;
            inner.fired.store(true, Ordering::SeqCst);
            inner.expired.cancel();
        });

        if let Some(previous) = self.timer.lock().replace(timer) {
            previous.abort();
        }
    }
}

impl Drop for TimeoutController {
    fn drop(&mut self) {
        self.cancel();
    }
}
