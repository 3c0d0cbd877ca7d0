//! The Router (C2): picks a backend per request and owns the weighted
//! scoring, per-backend circuit breakers, and health-probe cache
//! (`spec.md` §4.2).

pub mod breaker;

pub use breaker::{BreakerState, CircuitBreaker};

use crate::backend::Backend;
use crate::config::RoutingConfig;
use crate::credentials::CredentialResolver;
use crate::ctx::CallCtx;
use crate::error::{RouterError, Result};
use crate::request::Request;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Seed EWMA latency for a backend with no samples yet (`spec.md` §4.2.1).
const SEED_LATENCY_MS: f64 = 1000.0;
/// Weight given to a health-probe latency sample, so probes alone cannot
/// dominate the EWMA (`spec.md` §4.2.4).
const PROBE_EWMA_WEIGHT: f64 = 0.1;

struct RuntimeState {
    healthy: bool,
    last_probe: Option<Instant>,
    latency_ewma_ms: f64,
    breaker: CircuitBreaker,
}

impl RuntimeState {
    fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            healthy: true,
            last_probe: None,
            latency_ewma_ms: SEED_LATENCY_MS,
            breaker: CircuitBreaker::new(threshold, reset_after),
        }
    }

    fn is_stale(&self, health_ttl: Duration) -> bool {
        match self.last_probe {
            Some(at) => at.elapsed() >= health_ttl,
            None => true,
        }
    }

    fn record_latency(&mut self, latency_ms: f64, weight: f64) {
        self.latency_ewma_ms = weight * latency_ms + (1.0 - weight) * self.latency_ewma_ms;
    }
}

/// Snapshot of one backend's runtime status, returned by [`Router::health_snapshot`].
#[derive(Debug, Clone)]
pub struct BackendStatus {
    pub name: String,
    pub enabled: bool,
    pub healthy: bool,
    pub breaker_state: BreakerState,
    pub latency_ewma_ms: f64,
    pub consecutive_failures: u32,
}

pub struct Router {
    backends: HashMap<String, Arc<dyn Backend>>,
    runtime: HashMap<String, Mutex<RuntimeState>>,
    pub(crate) credentials: Arc<dyn CredentialResolver>,
    config: RoutingConfig,
}

impl Router {
    pub fn new(
        backends: HashMap<String, Arc<dyn Backend>>,
        credentials: Arc<dyn CredentialResolver>,
        config: RoutingConfig,
    ) -> Self {
        let threshold = config.breaker_threshold;
        let reset_after = Duration::from_secs(config.breaker_reset_seconds);
        let runtime = backends
            .keys()
            .map(|name| (name.clone(), Mutex::new(RuntimeState::new(threshold, reset_after))))
            .collect();
        Self {
            backends,
            runtime,
            credentials,
            config,
        }
    }

    pub fn backend(&self, name: &str) -> Option<&Arc<dyn Backend>> {
        self.backends.get(name)
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialResolver> {
        &self.credentials
    }

    /// `spec.md` §4.2.3 "Forced-backend selection" + §4.2.1 scoring.
    /// Probes any enabled backend whose cached health is stale before scoring.
    pub async fn select_candidates(&self, request: &Request, ctx: &CallCtx) -> Result<Vec<String>> {
        if let Some(forced) = &request.options.backend {
            return self.select_forced(forced);
        }
        self.refresh_stale_health(ctx).await;
        self.select_by_score(request)
    }

    /// Best-effort initial health probe of every enabled backend, run once
    /// at dispatcher construction (`spec.md` §3 "Ownership & lifecycle").
    /// Failures just leave a backend's cached health unchanged; they never
    /// propagate.
    pub async fn warm_up(&self, ctx: &CallCtx) {
        self.refresh_stale_health(ctx).await;
    }

    fn select_forced(&self, name: &str) -> Result<Vec<String>> {
        let descriptor = self
            .backends
            .get(name)
            .ok_or_else(|| RouterError::BackendUnavailable(name.to_string()))?
            .descriptor();
        if !descriptor.enabled {
            return Err(RouterError::BackendUnavailable(name.to_string()));
        }
        let mut runtime = self.runtime[name].lock().unwrap();
        if runtime.breaker.poll_state() == BreakerState::Open {
            return Err(RouterError::BackendUnavailable(name.to_string()));
        }
        Ok(vec![name.to_string()])
    }

    async fn refresh_stale_health(&self, ctx: &CallCtx) {
        let health_ttl = Duration::from_secs(self.config.health_ttl_seconds);
        let due: Vec<&String> = self
            .backends
            .iter()
            .filter(|(name, backend)| {
                backend.descriptor().enabled
                    && self.runtime[*name].lock().unwrap().is_stale(health_ttl)
            })
            .map(|(name, _)| name)
            .collect();

        for name in due {
            let backend = &self.backends[name];
            let api_key = backend
                .descriptor()
                .api_key_ref
                .as_deref()
                .and_then(|r| self.credentials.resolve(r));
            let started = Instant::now();
            let reachable = backend.ping(api_key.as_deref(), ctx).await;
            let elapsed_ms = started.elapsed().as_millis() as f64;
            tracing::debug!(backend = name.as_str(), reachable, elapsed_ms, "health probe");

            let mut runtime = self.runtime[name].lock().unwrap();
            runtime.healthy = reachable;
            runtime.last_probe = Some(Instant::now());
            runtime.record_latency(elapsed_ms, PROBE_EWMA_WEIGHT);
        }
    }

    fn select_by_score(&self, request: &Request) -> Result<Vec<String>> {
        let costs: HashMap<&str, f64> = self
            .backends
            .iter()
            .filter(|(_, b)| b.descriptor().enabled)
            .map(|(name, b)| (name.as_str(), b.estimate_cost(request).max(0.0)))
            .collect();
        let max_cost = costs.values().cloned().fold(0.0_f64, f64::max);

        let health_ttl = Duration::from_secs(self.config.health_ttl_seconds);

        // First pass: admit eligible backends and snapshot their runtime state.
        struct Eligible {
            name: String,
            priority: i32,
            latency_ewma_ms: f64,
            norm_unavailability: f64,
        }
        let mut eligible = Vec::new();
        for (name, backend) in &self.backends {
            let descriptor = backend.descriptor();
            if !descriptor.enabled {
                continue;
            }
            let mut runtime = self.runtime[name].lock().unwrap();
            let breaker_state = runtime.breaker.poll_state();
            if breaker_state == BreakerState::Open {
                continue;
            }
            if runtime.is_stale(health_ttl) && !runtime.healthy {
                continue;
            }
            let norm_unavailability = match breaker_state {
                BreakerState::Closed if runtime.healthy => 0.0,
                BreakerState::HalfOpen => 0.5,
                _ => 1.0,
            };
            eligible.push(Eligible {
                name: name.clone(),
                priority: descriptor.priority,
                latency_ewma_ms: runtime.latency_ewma_ms,
                norm_unavailability,
            });
        }

        let max_latency = eligible
            .iter()
            .map(|e| e.latency_ewma_ms)
            .fold(0.0_f64, f64::max);

        let mut scored: Vec<(String, f64, i32)> = eligible
            .into_iter()
            .map(|e| {
                let cost = *costs.get(e.name.as_str()).unwrap_or(&0.0);
                let norm_cost = if max_cost > 0.0 { cost / max_cost } else { 0.0 };
                let norm_latency = if max_latency > 0.0 {
                    e.latency_ewma_ms / max_latency
                } else {
                    0.0
                };
                let score = self.config.cost_weight * norm_cost
                    + self.config.latency_weight * norm_latency
                    + self.config.availability_weight * e.norm_unavailability;
                (e.name, score, e.priority)
            })
            .collect();

        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.cmp(&b.2))
                .then(a.0.cmp(&b.0))
        });

        Ok(scored.into_iter().map(|(name, _, _)| name).collect())
    }

    /// `spec.md` §4.2 `recordOutcome`. `counts_as_breaker_failure` should
    /// come from `AdapterError::counts_as_breaker_failure` on the caller side.
    pub fn record_outcome(
        &self,
        name: &str,
        success: bool,
        latency_ms: u64,
        counts_as_breaker_failure: bool,
    ) {
        let Some(runtime) = self.runtime.get(name) else {
            return;
        };
        let mut runtime = runtime.lock().unwrap();
        runtime.record_latency(latency_ms as f64, 1.0);
        if success {
            runtime.breaker.record_success();
            runtime.healthy = true;
        } else if counts_as_breaker_failure {
            runtime.breaker.record_failure();
        }
        tracing::debug!(
            backend = name,
            success,
            latency_ms,
            breaker_state = ?runtime.breaker.state(),
            "recorded backend outcome"
        );
    }

    pub fn health_snapshot(&self) -> Vec<BackendStatus> {
        let mut statuses: Vec<BackendStatus> = self
            .backends
            .iter()
            .map(|(name, backend)| {
                let runtime = self.runtime[name].lock().unwrap();
                BackendStatus {
                    name: name.clone(),
                    enabled: backend.descriptor().enabled,
                    healthy: runtime.healthy,
                    breaker_state: runtime.breaker.state(),
                    latency_ewma_ms: runtime.latency_ewma_ms,
                    consecutive_failures: runtime.breaker.consecutive_failures(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}
