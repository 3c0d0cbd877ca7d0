//! Backend trait and the shared per-call wrapper every adapter goes through.
//!
//! Every concrete adapter translates between [`Request`] and a concrete
//! wire protocol. The shared behaviour described in `spec.md` §4.3 — API
//! key resolution at call time, timing, timeout enforcement, error
//! translation — lives in [`call_backend`], so adapters only need to know
//! how to build and parse one HTTP exchange.

pub mod anthropic;
pub mod generic;
pub mod mock;
pub mod openai;
pub mod self_hosted;

pub use anthropic::AnthropicBackend;
pub use generic::GenericSelfHostedBackend;
pub use mock::MockBackend;
pub use openai::OpenAiBackend;
pub use self_hosted::SelfHostedOpenAiBackend;

use crate::config::BackendDescriptor;
use crate::credentials::CredentialResolver;
use crate::ctx::CallCtx;
use crate::error::{AdapterError, AdapterResult};
use crate::request::Request;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Construct the concrete adapter for a backend descriptor's `kind`.
pub fn build_backend(descriptor: BackendDescriptor) -> Arc<dyn Backend> {
    match descriptor.kind {
        crate::config::BackendKind::OpenaiCompatibleCloud => Arc::new(OpenAiBackend::new(descriptor)),
        crate::config::BackendKind::AnthropicCompatibleCloud => {
            Arc::new(AnthropicBackend::new(descriptor))
        }
        crate::config::BackendKind::OpenaiCompatibleSelfHosted => {
            Arc::new(SelfHostedOpenAiBackend::new(descriptor))
        }
        crate::config::BackendKind::GenericSelfHosted => Arc::new(GenericSelfHostedBackend::new(
            descriptor,
            generic::GenericWireShape::default(),
        )),
    }
}

/// What an adapter hands back on a successful call. Cost, the backend name,
/// wall-clock latency, and the cache-hit flag are dispatcher/router
/// concerns layered on top of this, not the adapter's.
#[derive(Debug, Clone)]
pub struct AdapterCompletion {
    pub content: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub metadata: Option<Value>,
}

/// Uniform contract every provider adapter implements (`spec.md` §4.3).
///
/// Object-safe; adapters are held as `Arc<dyn Backend>` by the router.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute one completion call. `api_key` is the already-resolved
    /// secret for this single call (or `None`); adapters must not cache it.
    async fn send(
        &self,
        request: &Request,
        api_key: Option<&str>,
        ctx: &CallCtx,
    ) -> AdapterResult<AdapterCompletion>;

    /// A minimal reachability probe. `true` means the backend answered in a
    /// way that indicates it is up, even if the response itself is an error
    /// (e.g. self-hosted gateways that 400 on a bare `/v1/models` probe).
    async fn ping(&self, api_key: Option<&str>, ctx: &CallCtx) -> bool;

    /// Estimated cost in EUR for this request, given the backend's configured rate.
    fn estimate_cost(&self, request: &Request) -> f64;

    /// Static descriptor snapshot.
    fn descriptor(&self) -> &BackendDescriptor;
}

/// Run one backend call through the shared base behaviour: resolve the
/// credential fresh, enforce `ctx`'s deadline, race the call against
/// cancellation, time the attempt regardless of outcome, and translate a
/// timeout into [`AdapterError::Timeout`].
///
/// `ctx.cancelled()` is raced against the call itself (not just checked
/// up front): if the caller cancels via [`crate::ctx::CallCtx::cancel_handle`]
/// while the backend's `send` future is in flight, that future is dropped —
/// aborting the in-flight HTTP call — and this returns `Cancelled`
/// immediately, per `spec.md`'s cancellation contract.
///
/// Returns the adapter's result alongside the measured wall-clock latency —
/// callers (the router) use the latency to feed the backend's EWMA whether
/// or not the call succeeded.
pub async fn call_backend(
    backend: &dyn Backend,
    credentials: &dyn CredentialResolver,
    request: &Request,
    ctx: &CallCtx,
) -> (AdapterResult<AdapterCompletion>, Duration) {
    let api_key = backend
        .descriptor()
        .api_key_ref
        .as_deref()
        .and_then(|reference| credentials.resolve(reference));

    let started = Instant::now();

    if ctx.is_cancelled() {
        return (Err(AdapterError::Cancelled), ctx.elapsed_since(started));
    }

    let call = backend.send(request, api_key.as_deref(), ctx);
    let timed_call = async {
        match ctx.remaining() {
            Some(remaining) => match tokio::time::timeout(remaining, call).await {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout {
                    elapsed_ms: ctx.elapsed_since(started).as_millis() as u64,
                }),
            },
            None => call.await,
        }
    };

    let result = tokio::select! {
        result = timed_call => result,
        _ = ctx.cancelled() => Err(AdapterError::Cancelled),
    };

    (result, ctx.elapsed_since(started))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct SlowBackend {
        descriptor: BackendDescriptor,
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Backend for SlowBackend {
        async fn send(
            &self,
            _request: &Request,
            _api_key: Option<&str>,
            _ctx: &CallCtx,
        ) -> AdapterResult<AdapterCompletion> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(self.delay).await;
            Ok(AdapterCompletion {
                content: "done".into(),
                tokens_input: 1,
                tokens_output: 1,
                metadata: None,
            })
        }

        async fn ping(&self, _api_key: Option<&str>, _ctx: &CallCtx) -> bool {
            true
        }

        fn estimate_cost(&self, _request: &Request) -> f64 {
            0.0
        }

        fn descriptor(&self) -> &BackendDescriptor {
            &self.descriptor
        }
    }

    fn descriptor(name: &str) -> BackendDescriptor {
        BackendDescriptor {
            name: name.into(),
            kind: BackendKind::GenericSelfHosted,
            enabled: true,
            priority: 0,
            cost_per_token: 0.0,
            base_url: "http://localhost:9999".into(),
            model: "test".into(),
            api_key_ref: None,
            timeout_ms: 30_000,
            supports_streaming: false,
        }
    }

    struct NoopResolver;
    impl CredentialResolver for NoopResolver {
        fn resolve(&self, _reference: &str) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn call_backend_times_out_past_the_deadline() {
        let backend = SlowBackend {
            descriptor: descriptor("slow"),
            delay: Duration::from_millis(50),
            calls: AtomicU32::new(0),
        };
        let ctx = CallCtx::with_timeout(Duration::from_millis(5));
        let request = Request::new("hi");
        let (result, _elapsed) = call_backend(&backend, &NoopResolver, &request, &ctx).await;
        assert!(matches!(result, Err(AdapterError::Timeout { .. })));
    }

    #[tokio::test]
    async fn call_backend_succeeds_within_deadline() {
        let backend = Arc::new(SlowBackend {
            descriptor: descriptor("fast"),
            delay: Duration::from_millis(1),
            calls: AtomicU32::new(0),
        });
        let ctx = CallCtx::with_timeout(Duration::from_secs(5));
        let request = Request::new("hi");
        let (result, _elapsed) = call_backend(backend.as_ref(), &NoopResolver, &request, &ctx).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn call_backend_short_circuits_when_already_cancelled() {
        let backend = SlowBackend {
            descriptor: descriptor("fast"),
            delay: Duration::from_millis(1),
            calls: AtomicU32::new(0),
        };
        let ctx = CallCtx::new();
        ctx.cancel_handle().cancel();
        let request = Request::new("hi");
        let (result, _elapsed) = call_backend(&backend, &NoopResolver, &request, &ctx).await;
        assert!(matches!(result, Err(AdapterError::Cancelled)));
        assert_eq!(backend.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn call_backend_aborts_a_call_cancelled_mid_flight() {
        let backend = SlowBackend {
            descriptor: descriptor("slow"),
            delay: Duration::from_secs(30),
            calls: AtomicU32::new(0),
        };
        let ctx = CallCtx::new();
        let handle = ctx.cancel_handle();
        let request = Request::new("hi");

        let call = call_backend(&backend, &NoopResolver, &request, &ctx);
        tokio::pin!(call);

        // Cancel shortly after the 30s `send` is in flight; without racing
        // `ctx.cancelled()` against the call this would hang for 30s.
        tokio::select! {
            _ = &mut call => panic!("call_backend returned before cancellation was sent"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        handle.cancel();

        let (result, _elapsed) = tokio::time::timeout(Duration::from_millis(200), call)
            .await
            .expect("call_backend must return promptly once cancelled, not wait for send()");
        assert!(matches!(result, Err(AdapterError::Cancelled)));
    }
}
