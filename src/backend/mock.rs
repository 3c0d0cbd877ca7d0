//! Deterministic backend for tests — no network access, canned responses or
//! canned failures in order, cycling once exhausted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{AdapterCompletion, Backend};
use crate::config::BackendDescriptor;
use crate::ctx::CallCtx;
use crate::error::{AdapterError, AdapterResult};
use crate::request::Request;

/// One scripted outcome for [`MockBackend`].
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Success {
        content: String,
        tokens_input: u64,
        tokens_output: u64,
    },
    Fail(AdapterError),
}

impl MockOutcome {
    pub fn success(content: impl Into<String>, tokens_input: u64, tokens_output: u64) -> Self {
        Self::Success {
            content: content.into(),
            tokens_input,
            tokens_output,
        }
    }
}

/// A test backend that plays back a scripted sequence of outcomes.
///
/// Cycles back to the start once exhausted, so a single-element script
/// behaves like a fixed always-succeed/always-fail backend.
#[derive(Debug)]
pub struct MockBackend {
    descriptor: BackendDescriptor,
    outcomes: Vec<MockOutcome>,
    index: AtomicUsize,
    pings: Mutex<bool>,
}

impl MockBackend {
    pub fn new(descriptor: BackendDescriptor, outcomes: Vec<MockOutcome>) -> Self {
        assert!(!outcomes.is_empty(), "MockBackend requires at least one outcome");
        Self {
            descriptor,
            outcomes,
            index: AtomicUsize::new(0),
            pings: Mutex::new(true),
        }
    }

    /// A mock that always returns the same successful completion.
    pub fn fixed(descriptor: BackendDescriptor, content: impl Into<String>, tokens_input: u64, tokens_output: u64) -> Self {
        Self::new(descriptor, vec![MockOutcome::success(content, tokens_input, tokens_output)])
    }

    /// A mock that always fails with the given error.
    pub fn always_failing(descriptor: BackendDescriptor, error: AdapterError) -> Self {
        Self::new(descriptor, vec![MockOutcome::Fail(error)])
    }

    pub fn set_ping_result(&self, reachable: bool) {
        *self.pings.lock().unwrap() = reachable;
    }

    fn next_outcome(&self) -> MockOutcome {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.outcomes.len();
        self.outcomes[idx].clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn send(
        &self,
        _request: &Request,
        _api_key: Option<&str>,
        _ctx: &CallCtx,
    ) -> AdapterResult<AdapterCompletion> {
        match self.next_outcome() {
            MockOutcome::Success {
                content,
                tokens_input,
                tokens_output,
            } => Ok(AdapterCompletion {
                content,
                tokens_input,
                tokens_output,
                metadata: None,
            }),
            MockOutcome::Fail(err) => Err(err),
        }
    }

    async fn ping(&self, _api_key: Option<&str>, _ctx: &CallCtx) -> bool {
        *self.pings.lock().unwrap()
    }

    fn estimate_cost(&self, _request: &Request) -> f64 {
        self.descriptor.cost_per_token * 30.0
    }

    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }
}
