//! Cooperative cancellation.
//!
//! An [`AbortToken`] is created for every arm-occupying command and stored in
//! the arm's slot so that an ABORT arriving on another connection can signal
//! it. Handlers poll the token at checkpoints; waits inside the lamp arbiter
//! also select on [`AbortToken::aborted`].

use crate::error::{CommandError, HandlerResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct AbortInner {
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

/// Shared "canceled" flag with an optional reason.
#[derive(Clone, Debug, Default)]
pub struct AbortToken {
    inner: Arc<AbortInner>,
}

impl AbortToken {
    /// Create a token in the not-aborted state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the token aborted and wake everything waiting on it. The first
    /// reason supplied is kept.
    pub fn abort(&self, reason: impl Into<String>) {
        {
            let mut slot = self.inner.reason.lock();
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether [`abort`](Self::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Reason given to the first [`abort`](Self::abort) call.
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Checkpoint: `Err(Aborted)` once the token has been aborted.
    pub fn check(&self) -> HandlerResult<()> {
        if self.is_aborted() {
            Err(CommandError::Aborted {
                reason: self.reason(),
            })
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is aborted.
    pub async fn aborted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration`, returning early with `Err(Aborted)` if the token
    /// is aborted first.
    pub async fn sleep(&self, duration: Duration) -> HandlerResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.check(),
            _ = self.aborted() => self.check(),
        }
    }
}
