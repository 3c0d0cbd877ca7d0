//! The Dispatcher (C1): the crate's single public entry point. Ties the
//! cache, router, and ledger together into the `optimize()` request
//! lifecycle (`spec.md` §4.1).

use crate::backend::{build_backend, call_backend, Backend};
use crate::cache::{Cache, CacheStats};
use crate::config::RouterConfig;
use crate::credentials::{CredentialResolver, EnvCredentialResolver};
use crate::ctx::CallCtx;
use crate::error::{RouterError, Result};
use crate::fingerprint::fingerprint;
use crate::ledger::{CacheEntryRow, NewLedgerRow, SqliteLedger, StoreHealth};
use crate::request::{Request, RequestOptions, Response};
use crate::router::{BackendStatus, Router};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `spec.md` §6 `core.status()` shape.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub backends: Vec<BackendStatus>,
    pub cache: CacheStats,
    pub store: StoreHealth,
}

/// C1. Owns the router, cache, and ledger for the lifetime of one core
/// instance (`spec.md` §3 "Ownership & lifecycle"). Constructed once from a
/// [`RouterConfig`]; every `optimize` call is independently safe to run
/// concurrently from multiple threads (`spec.md` §5).
pub struct Dispatcher {
    router: Arc<Router>,
    cache: Arc<Cache>,
    store: Arc<SqliteLedger>,
    config: RouterConfig,
}

impl Dispatcher {
    /// Construct a dispatcher: validate the config, build one adapter per
    /// configured backend, and open the store. Health probes are
    /// best-effort and non-blocking — if called from within a Tokio
    /// runtime, one warm-up pass is fired in the background; otherwise
    /// every backend is simply probed lazily on its first real use.
    pub fn new(config: RouterConfig) -> Result<Self> {
        config.validate()?;

        let backends: HashMap<String, Arc<dyn Backend>> = config
            .backends
            .values()
            .map(|descriptor| (descriptor.name.clone(), build_backend(descriptor.clone())))
            .collect();

        let credentials: Arc<dyn CredentialResolver> = Arc::new(EnvCredentialResolver);
        let router = Arc::new(Router::new(backends, credentials, config.routing.clone()));
        let cache = Arc::new(Cache::new(
            config.thresholds.max_cache_entries,
            config.thresholds.max_cache_bytes,
            Duration::from_secs(config.thresholds.cache_ttl_seconds),
        ));
        let store = Arc::new(SqliteLedger::open(&config.store_path)?);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let warm_router = router.clone();
            handle.spawn(async move {
                warm_router.warm_up(&CallCtx::new()).await;
            });
        }

        Ok(Self {
            router,
            cache,
            store,
            config,
        })
    }

    /// `spec.md` §6 `core.optimize(prompt, files?, options?)`.
    pub async fn optimize(
        &self,
        prompt: impl Into<String>,
        files: Vec<String>,
        options: RequestOptions,
    ) -> Result<Response> {
        let ctx = match options.timeout_ms {
            Some(ms) => CallCtx::with_timeout(Duration::from_millis(ms)),
            None => CallCtx::new(),
        };
        self.optimize_with_ctx(prompt, files, options, ctx).await
    }

    /// Same as [`Self::optimize`] but with an explicit [`CallCtx`], for
    /// callers that need to cancel an in-flight request from another task
    /// via [`CallCtx::cancel_handle`].
    pub async fn optimize_with_ctx(
        &self,
        prompt: impl Into<String>,
        files: Vec<String>,
        options: RequestOptions,
        ctx: CallCtx,
    ) -> Result<Response> {
        let request = Request {
            prompt: prompt.into(),
            files,
            options,
        };
        tracing::debug!(prompt_len = request.prompt.len(), files = request.files.len(), "optimize: received request");

        // Validation is pure CPU over the struct already in hand; it must
        // never touch a backend, the cache, or the store (`spec.md` §4.1).
        request.validate()?;

        let file_contents = read_files(&request.files).await?;
        let fp = fingerprint(
            &request.prompt,
            &file_contents,
            &request.options.fingerprint_relevant(),
        );

        if !request.options.bypass_cache {
            let lookup_started = Instant::now();
            if let Some(cached) = self.lookup_cache(&fp).await {
                let response = cached.as_cache_hit(lookup_started.elapsed().as_millis() as u64);
                self.append_ledger_row(&fp, &response).await;
                return Ok(response);
            }
        }

        let dispatch_request = Request {
            prompt: augment_prompt(&request.prompt, &request.files, &file_contents),
            files: Vec::new(),
            options: request.options.clone(),
        };

        let response = self.dispatch_with_fallback(&dispatch_request, &ctx).await?;

        if !request.options.bypass_cache {
            self.store_in_cache(&fp, &response).await;
        }
        self.append_ledger_row(&fp, &response).await;

        Ok(response)
    }

    async fn lookup_cache(&self, fingerprint: &str) -> Option<Response> {
        if let Some(hit) = self.cache.get(fingerprint).await {
            return Some(hit);
        }
        // Lazily rehydrate from the store on first lookup after a restart
        // (`spec.md` §4.4 "Persistence"); the in-memory map stays
        // authoritative once warm.
        match self.store.get_cache_entry(fingerprint).await {
            Ok(Some(row)) => {
                let now = unix_now();
                if row.expires_at <= now {
                    return None;
                }
                let response: Response = serde_json::from_str(&row.response).ok()?;
                let ttl = Duration::from_secs((row.expires_at - now).max(0) as u64);
                self.cache.put(fingerprint.to_string(), response.clone(), Some(ttl)).await;
                Some(response.as_cache_hit(0))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "store unavailable during cache rehydration");
                None
            }
        }
    }

    /// `spec.md` §4.1 steps 3–4: ask the router for candidates, try each up
    /// to `maxRetries`, falling back to the next on a retryable failure.
    async fn dispatch_with_fallback(&self, request: &Request, ctx: &CallCtx) -> Result<Response> {
        let candidates = self.router.select_candidates(request, ctx).await?;
        let max_retries = request.effective_max_retries(self.config.routing.max_retries) as usize;

        let mut errors: Vec<(String, String)> = Vec::new();
        for name in candidates.iter().take(max_retries.max(1)) {
            let backend = match self.router.backend(name) {
                Some(b) => b.clone(),
                None => continue,
            };
            let attempt_ctx = ctx.narrowed_to(Duration::from_millis(backend.descriptor().timeout_ms));
            let (result, elapsed) =
                call_backend(backend.as_ref(), self.router.credentials().as_ref(), request, &attempt_ctx)
                    .await;
            let elapsed_ms = elapsed.as_millis() as u64;

            match result {
                Ok(completion) => {
                    self.router.record_outcome(name, true, elapsed_ms, false);
                    let cost_eur = backend.descriptor().cost_per_token
                        * (completion.tokens_input + completion.tokens_output) as f64;
                    return Ok(Response {
                        content: completion.content,
                        backend_used: name.clone(),
                        tokens_input: completion.tokens_input,
                        tokens_output: completion.tokens_output,
                        cost_eur,
                        latency_ms: elapsed_ms,
                        cache_hit: false,
                        metadata: completion.metadata,
                    });
                }
                Err(crate::error::AdapterError::Cancelled) => {
                    return Err(RouterError::Cancelled);
                }
                Err(adapter_err) => {
                    let counts = adapter_err.counts_as_breaker_failure();
                    self.router.record_outcome(name, false, elapsed_ms, counts);
                    let router_err = adapter_err.into_router_error(name);
                    errors.push((name.clone(), router_err.to_string()));
                }
            }
        }

        Err(RouterError::AllBackendsFailed(errors))
    }

    async fn store_in_cache(&self, fingerprint: &str, response: &Response) {
        let ttl = self.cache.default_ttl();
        self.cache.put(fingerprint.to_string(), response.clone(), None).await;

        let Ok(serialized) = serde_json::to_string(response) else {
            return;
        };
        let now = unix_now();
        let row = CacheEntryRow {
            cache_key: fingerprint.to_string(),
            prompt_hash: fingerprint.to_string(),
            response: serialized.clone(),
            created_at: now,
            expires_at: now + ttl.as_secs() as i64,
            access_count: 0,
            last_accessed: now,
            size_bytes: serialized.len() as u64,
        };
        if let Err(e) = self.store.put_cache_entry(row).await {
            tracing::warn!(error = %e, "failed to persist cache entry");
        }
    }

    async fn append_ledger_row(&self, fingerprint: &str, response: &Response) {
        let row = NewLedgerRow {
            backend: response.backend_used.clone(),
            fingerprint: fingerprint.to_string(),
            tokens_input: response.tokens_input,
            tokens_output: response.tokens_output,
            cost_eur: response.cost_eur,
            cache_hit: response.cache_hit,
            latency_ms: response.latency_ms,
            metadata: response
                .metadata
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_default(),
        };
        if let Err(e) = self.store.append(row).await {
            tracing::warn!(error = %e, "failed to append ledger row");
        }
    }

    /// `spec.md` §6 `core.status()`.
    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            backends: self.router.health_snapshot(),
            cache: self.cache.stats().await,
            store: self.store.health_check().await,
        }
    }

    /// Prune expired cache rows and old ledger history beyond the
    /// configured retention window (`spec.md` §5 "Resource bounds").
    pub async fn cleanup(&self, retention_hours: i64) -> Result<()> {
        self.store.cleanup(retention_hours).await
    }

    /// Flush pending writes and close the store. Callers must ensure no
    /// `optimize` call is in flight before calling this (`spec.md` §3
    /// "Ownership & lifecycle").
    pub async fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.store) {
            Ok(store) => store.close().await,
            Err(_) => {
                tracing::warn!("store still has outstanding references at close");
                Ok(())
            }
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Read every referenced file in order. A missing or unreadable file is
/// treated as an input error, not a backend/storage failure — the files
/// list is part of the caller's request.
async fn read_files(paths: &[String]) -> Result<Vec<String>> {
    let mut contents = Vec::with_capacity(paths.len());
    for path in paths {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RouterError::InvalidInput(format!("failed to read file '{path}': {e}")))?;
        contents.push(content);
    }
    Ok(contents)
}

/// Prepend file contents to the prompt with a small structural header.
/// Adapters only ever see the single resulting string (`spec.md` §4.3
/// "File-context handling").
fn augment_prompt(prompt: &str, paths: &[String], contents: &[String]) -> String {
    if contents.is_empty() {
        return prompt.to_string();
    }
    let mut augmented = String::from(prompt);
    for (path, content) in paths.iter().zip(contents) {
        augmented.push_str(&format!("\n\n--- file: {path} ---\n{content}"));
    }
    augmented
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockOutcome};
    use crate::config::{BackendDescriptor, BackendKind, Features, RoutingConfig, Thresholds};
    use crate::error::AdapterError;
    use std::collections::HashMap as StdHashMap;

    fn descriptor(name: &str, enabled: bool, cost_per_token: f64) -> BackendDescriptor {
        BackendDescriptor {
            name: name.into(),
            kind: BackendKind::GenericSelfHosted,
            enabled,
            priority: 0,
            cost_per_token,
            base_url: "http://localhost:1".into(),
            model: "mock".into(),
            api_key_ref: None,
            timeout_ms: 5_000,
            supports_streaming: false,
        }
    }

    fn config_with(backends: StdHashMap<String, BackendDescriptor>) -> RouterConfig {
        RouterConfig {
            backends,
            features: Features::default(),
            thresholds: Thresholds::default(),
            routing: RoutingConfig::default(),
            store_path: ":memory:".to_string(),
        }
    }

    async fn dispatcher_with_backend(name: &str, backend: Arc<dyn Backend>) -> Dispatcher {
        let mut descriptors = StdHashMap::new();
        descriptors.insert(name.to_string(), backend.descriptor().clone());
        let dispatcher = Dispatcher::new(config_with(descriptors)).unwrap();
        // Swap in the caller's concrete (possibly scripted) backend instance.
        let router = Arc::new(Router::new(
            [(name.to_string(), backend)].into_iter().collect(),
            Arc::new(EnvCredentialResolver),
            dispatcher.config.routing.clone(),
        ));
        Dispatcher {
            router,
            cache: dispatcher.cache,
            store: dispatcher.store,
            config: dispatcher.config,
        }
    }

    #[tokio::test]
    async fn e1_cache_miss_then_hit() {
        let mock: Arc<dyn Backend> =
            Arc::new(MockBackend::fixed(descriptor("mock", true, 0.0001), "OK", 10, 20));
        let dispatcher = dispatcher_with_backend("mock", mock).await;

        let r1 = dispatcher
            .optimize("hello", vec![], RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(r1.content, "OK");
        assert_eq!(r1.backend_used, "mock");
        assert!(!r1.cache_hit);
        assert!((r1.cost_eur - 0.003).abs() < 1e-9);

        let r2 = dispatcher
            .optimize("hello", vec![], RequestOptions::default())
            .await
            .unwrap();
        assert!(r2.cache_hit);
        assert_eq!(r2.cost_eur, 0.0);
        assert_eq!(r2.content, "OK");
    }

    #[tokio::test]
    async fn e2_fallback_on_first_backend_failure() {
        let mut descriptors = StdHashMap::new();
        descriptors.insert("a".to_string(), descriptor("a", true, 0.0));
        descriptors.insert("b".to_string(), descriptor("b", true, 0.0));
        let dispatcher = Dispatcher::new(config_with(descriptors)).unwrap();

        let a: Arc<dyn Backend> = Arc::new(MockBackend::always_failing(
            descriptor("a", true, 0.0),
            AdapterError::TransientBackendError("boom".into()),
        ));
        let b: Arc<dyn Backend> = Arc::new(MockBackend::fixed(descriptor("b", true, 0.0), "B", 1, 1));
        let router = Arc::new(Router::new(
            [("a".to_string(), a), ("b".to_string(), b)].into_iter().collect(),
            Arc::new(EnvCredentialResolver),
            dispatcher.config.routing.clone(),
        ));
        let dispatcher = Dispatcher {
            router,
            cache: dispatcher.cache,
            store: dispatcher.store,
            config: dispatcher.config,
        };

        let response = dispatcher
            .optimize("x", vec![], RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(response.backend_used, "b");
        assert!(!response.cache_hit);

        let rows = dispatcher.store.recent_entries(24).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].backend, "b");
    }

    #[tokio::test]
    async fn e4_forced_backend_unavailable_makes_no_backend_call() {
        let mut descriptors = StdHashMap::new();
        descriptors.insert("a".to_string(), descriptor("a", false, 0.0));
        descriptors.insert("b".to_string(), descriptor("b", true, 0.0));
        let dispatcher = Dispatcher::new(config_with(descriptors)).unwrap();

        let mut options = RequestOptions::default();
        options.backend = Some("a".to_string());
        let err = dispatcher.optimize("x", vec![], options).await.unwrap_err();
        assert!(matches!(err, RouterError::BackendUnavailable(_)));

        let rows = dispatcher.store.recent_entries(24).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn e5_bypass_cache_forces_a_fresh_call() {
        let mock: Arc<dyn Backend> =
            Arc::new(MockBackend::fixed(descriptor("mock", true, 0.0), "OK", 1, 1));
        let dispatcher = dispatcher_with_backend("mock", mock).await;

        dispatcher
            .optimize("p", vec![], RequestOptions::default())
            .await
            .unwrap();

        let mut options = RequestOptions::default();
        options.bypass_cache = true;
        let response = dispatcher.optimize("p", vec![], options).await.unwrap();
        assert!(!response.cache_hit);

        // The original entry is untouched and still servable.
        let mut normal = RequestOptions::default();
        normal.bypass_cache = false;
        let cached = dispatcher.optimize("p", vec![], normal).await.unwrap();
        assert!(cached.cache_hit);
    }

    #[tokio::test]
    async fn e6_invalid_input_performs_no_io() {
        let mut descriptors = StdHashMap::new();
        descriptors.insert("a".to_string(), descriptor("a", true, 0.0));
        let dispatcher = Dispatcher::new(config_with(descriptors)).unwrap();
        let err = dispatcher
            .optimize("   ", vec![], RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidInput(_)));
        let rows = dispatcher.store.recent_entries(24).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn all_backends_failed_carries_per_backend_errors() {
        let mut descriptors = StdHashMap::new();
        descriptors.insert("a".to_string(), descriptor("a", true, 0.0));
        let dispatcher = Dispatcher::new(config_with(descriptors)).unwrap();
        let failing: Arc<dyn Backend> = Arc::new(MockBackend::always_failing(
            descriptor("a", true, 0.0),
            AdapterError::TransientBackendError("down".into()),
        ));
        let router = Arc::new(Router::new(
            [("a".to_string(), failing)].into_iter().collect(),
            Arc::new(EnvCredentialResolver),
            dispatcher.config.routing.clone(),
        ));
        let dispatcher = Dispatcher {
            router,
            cache: dispatcher.cache,
            store: dispatcher.store,
            config: dispatcher.config,
        };
        let err = dispatcher
            .optimize("x", vec![], RequestOptions::default())
            .await
            .unwrap_err();
        match err {
            RouterError::AllBackendsFailed(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].0, "a");
            }
            other => panic!("expected AllBackendsFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_reports_backend_and_cache_and_store_health() {
        let mock: Arc<dyn Backend> =
            Arc::new(MockBackend::fixed(descriptor("mock", true, 0.0), "OK", 1, 1));
        let dispatcher = dispatcher_with_backend("mock", mock).await;
        let snapshot = dispatcher.status().await;
        assert_eq!(snapshot.backends.len(), 1);
        assert!(snapshot.store.healthy);
        assert_eq!(snapshot.cache.entries, 0);
    }

    #[test]
    fn augment_prompt_appends_file_headers() {
        let result = augment_prompt("base", &["a.txt".to_string()], &["file body".to_string()]);
        assert!(result.starts_with("base"));
        assert!(result.contains("--- file: a.txt ---"));
        assert!(result.contains("file body"));
    }

    #[test]
    fn augment_prompt_is_identity_with_no_files() {
        assert_eq!(augment_prompt("base", &[], &[]), "base");
    }
}
