//! Per-request call context threaded through dispatcher → router → adapter.
//!
//! Generalizes the single cancellation `AtomicBool` this crate's adapter
//! layer used before into a deadline-aware context: a call can be stopped
//! either by explicit cancellation or by deadline expiry, and both collapse
//! to the same check at the adapter boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Carries a deadline and a cooperative-cancellation signal through one
/// `optimize` call.
#[derive(Clone)]
pub struct CallCtx {
    deadline: Option<Instant>,
    notify: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
}

impl CallCtx {
    pub fn new() -> Self {
        Self {
            deadline: None,
            notify: Arc::new(Notify::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            notify: Arc::new(Notify::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A fresh context scoped to one backend attempt, inheriting the
    /// overall deadline but with its own per-attempt timeout applied —
    /// whichever is sooner wins. Shares the parent's cancellation signal, so
    /// cancelling the parent cancels every attempt narrowed from it.
    pub fn narrowed_to(&self, attempt_timeout: Duration) -> Self {
        let attempt_deadline = Instant::now() + attempt_timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < attempt_deadline => Some(existing),
            _ => Some(attempt_deadline),
        };
        Self {
            deadline,
            notify: self.notify.clone(),
            cancelled: self.cancelled.clone(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancelled: self.cancelled.clone(),
            notify: self.notify.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn elapsed_since(&self, start: Instant) -> Duration {
        Instant::now().saturating_duration_since(start)
    }

    /// Resolves once [`CancelHandle::cancel`] has been called. Races the
    /// registration against the flag on both sides so a `cancel()` that
    /// happens between the two checks is never missed (`Notify::notify_waiters`
    /// wakes every `Notified` future registered before the call, even if it
    /// hasn't been polled yet).
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CallCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle a caller can use to cancel an in-flight [`CallCtx`].
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }
}
