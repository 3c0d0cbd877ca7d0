//! Per-backend circuit breaker state machine (`spec.md` §4.2.2).
//!
//! Process-local, never persisted. One instance per configured backend,
//! owned by the [`Router`](super::Router) alongside the rest of that
//! backend's runtime state.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    threshold: u32,
    reset_after: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            threshold,
            reset_after,
        }
    }

    /// Current state, after first applying an open→half-open transition if
    /// `resetAfter` has elapsed. Candidate selection always calls this
    /// before reading state, per §4.2.2 ("on the next candidate-selection
    /// performed after resetAfter elapsed").
    pub fn poll_state(&mut self) -> BreakerState {
        if self.state == BreakerState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= self.reset_after {
                    self.state = BreakerState::HalfOpen;
                }
            }
        }
        self.state
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Record a successful call.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
        self.opened_at = None;
    }

    /// Record a failure that counts against the breaker
    /// (`AdapterError::counts_as_breaker_failure`).
    pub fn record_failure(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(Instant::now());
                self.consecutive_failures = self.threshold;
            }
            BreakerState::Closed | BreakerState::Open => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
