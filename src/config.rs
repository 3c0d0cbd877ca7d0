//! Typed configuration record consumed by [`Dispatcher::new`](crate::Dispatcher::new).
//!
//! Parsing happens once, at construction; unknown top-level keys are
//! rejected rather than silently ignored (`#[serde(deny_unknown_fields)]`),
//! and every field the source treats as optional has a documented default.
//! Loading the bytes themselves (path resolution, hot reload, env overlay)
//! is a collaborator's job, not this crate's.

use crate::error::{RouterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The wire kind of a configured backend. Determines which adapter the
/// router constructs for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    OpenaiCompatibleCloud,
    AnthropicCompatibleCloud,
    OpenaiCompatibleSelfHosted,
    GenericSelfHosted,
}

/// Static per-provider configuration (`spec.md` §3 "Backend descriptor").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct BackendDescriptor {
    pub name: String,
    pub kind: BackendKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub cost_per_token: f64,
    pub base_url: String,
    pub model: String,
    /// Symbolic credential reference (e.g. `ENV:OPENAI_API_KEY`), never a raw secret.
    #[serde(default)]
    pub api_key_ref: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub supports_streaming: bool,
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl BackendDescriptor {
    /// A loopback base URL (`localhost`/`127.0.0.1`/`::1`) may omit an API key
    /// even when enabled, per `spec.md` §3's self-hosted carve-out.
    pub fn points_at_loopback(&self) -> bool {
        let url = self.base_url.to_ascii_lowercase();
        url.contains("localhost") || url.contains("127.0.0.1") || url.contains("[::1]")
    }

    pub fn is_self_hosted(&self) -> bool {
        matches!(
            self.kind,
            BackendKind::OpenaiCompatibleSelfHosted | BackendKind::GenericSelfHosted
        )
    }

    /// Validate the invariants `spec.md` §3 attaches to a backend descriptor.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RouterError::InvalidInput(
                "backend name must not be empty".into(),
            ));
        }
        if self.cost_per_token < 0.0 {
            return Err(RouterError::InvalidInput(format!(
                "backend '{}': costPerToken must be non-negative",
                self.name
            )));
        }
        let needs_key = self.enabled && !(self.is_self_hosted() && self.points_at_loopback());
        if needs_key && self.api_key_ref.as_deref().unwrap_or("").trim().is_empty() {
            return Err(RouterError::InvalidInput(format!(
                "backend '{}': enabled non-loopback backends require apiKeyRef",
                self.name
            )));
        }
        Ok(())
    }
}

/// Boolean feature toggles (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Features {
    #[serde(default = "default_true")]
    pub caching: bool,
    #[serde(default = "default_true")]
    pub cost_optimization: bool,
    #[serde(default = "default_true")]
    pub smart_routing: bool,
    #[serde(default = "default_true")]
    pub performance_monitoring: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            caching: true,
            cost_optimization: true,
            smart_routing: true,
            performance_monitoring: true,
        }
    }
}

/// Cache/ledger sizing and warning thresholds (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Thresholds {
    /// Default cache entry TTL. Fixed at 900s per `SPEC_FULL.md` §9's
    /// resolution of the source's 5min/1h discrepancy.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,
    /// Zero disables the byte bound.
    #[serde(default)]
    pub max_cache_bytes: u64,
    #[serde(default = "default_cost_warning_eur")]
    pub cost_warning_eur: f64,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,
}

fn default_cache_ttl_seconds() -> u64 {
    900
}
fn default_max_cache_entries() -> usize {
    1000
}
fn default_cost_warning_eur() -> f64 {
    1.0
}
fn default_max_context_tokens() -> u32 {
    128_000
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_cache_ttl_seconds(),
            max_cache_entries: default_max_cache_entries(),
            max_cache_bytes: 0,
            cost_warning_eur: default_cost_warning_eur(),
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

/// Scoring weights and breaker tunables (`spec.md` §4.2, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,
    #[serde(default = "default_availability_weight")]
    pub availability_weight: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_health_ttl_seconds")]
    pub health_ttl_seconds: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_reset_seconds")]
    pub breaker_reset_seconds: u64,
}

fn default_cost_weight() -> f64 {
    0.4
}
fn default_latency_weight() -> f64 {
    0.4
}
fn default_availability_weight() -> f64 {
    0.2
}
fn default_max_retries() -> u32 {
    3
}
fn default_health_ttl_seconds() -> u64 {
    60
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_reset_seconds() -> u64 {
    300
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            cost_weight: default_cost_weight(),
            latency_weight: default_latency_weight(),
            availability_weight: default_availability_weight(),
            max_retries: default_max_retries(),
            health_ttl_seconds: default_health_ttl_seconds(),
            breaker_threshold: default_breaker_threshold(),
            breaker_reset_seconds: default_breaker_reset_seconds(),
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> Result<()> {
        let sum = self.cost_weight + self.latency_weight + self.availability_weight;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(RouterError::InvalidInput(format!(
                "routing weights must sum to 1.0, got {sum}"
            )));
        }
        if self.max_retries == 0 {
            return Err(RouterError::InvalidInput(
                "routing.maxRetries must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Where the dispatcher keeps the embedded store. `":memory:"` is accepted
/// for tests.
///
/// Not one of `spec.md` §6's four recognized top-level keys — added because
/// `Dispatcher::new` takes a single `RouterConfig` argument and the store
/// otherwise has nowhere to learn its path from (see `SPEC_FULL.md` §6).
fn default_store_path() -> String {
    "llm-router.sqlite3".to_string()
}

/// Top-level configuration record (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RouterConfig {
    pub backends: HashMap<String, BackendDescriptor>,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default = "default_store_path")]
    pub store_path: String,
}

impl RouterConfig {
    /// Parse a configuration record from a JSON string, rejecting unknown keys.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| RouterError::InvalidInput(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration record from a `serde_json::Value`.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| RouterError::InvalidInput(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration record from a YAML string. Only available with
    /// the `yaml` feature, for parity with sibling crates that accept either format.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| RouterError::InvalidInput(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants: unique backend names matching their
    /// map keys, per-backend descriptor invariants, and routing weights.
    /// Called automatically by every `from_*` constructor; exposed so
    /// `Dispatcher::new` can re-validate a config built programmatically.
    pub fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for (key, descriptor) in &self.backends {
            if key != &descriptor.name {
                return Err(RouterError::InvalidInput(format!(
                    "backend map key '{key}' does not match descriptor name '{}'",
                    descriptor.name
                )));
            }
            if !names.insert(descriptor.name.clone()) {
                return Err(RouterError::InvalidInput(format!(
                    "duplicate backend name '{}'",
                    descriptor.name
                )));
            }
            descriptor.validate()?;
        }
        self.routing.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "backends": {
                "mock": {
                    "name": "mock",
                    "kind": "openai-compatible-self-hosted",
                    "baseUrl": "http://localhost:11434",
                    "model": "llama3.2:3b"
                }
            }
        }"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = RouterConfig::from_json_str(sample_json()).expect("valid config");
        assert_eq!(config.routing.max_retries, 3);
        assert_eq!(config.thresholds.cache_ttl_seconds, 900);
        let backend = &config.backends["mock"];
        assert!(backend.enabled);
        assert!(backend.points_at_loopback());
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let raw = r#"{"backends": {}, "bogus": true}"#;
        let err = RouterConfig::from_json_str(raw).unwrap_err();
        assert!(matches!(err, RouterError::InvalidInput(_)));
    }

    #[test]
    fn rejects_non_loopback_backend_without_key_ref() {
        let raw = r#"{
            "backends": {
                "cloud": {
                    "name": "cloud",
                    "kind": "openai-compatible-cloud",
                    "baseUrl": "https://api.openai.com",
                    "model": "gpt-4o"
                }
            }
        }"#;
        let err = RouterConfig::from_json_str(raw).unwrap_err();
        assert!(matches!(err, RouterError::InvalidInput(_)));
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let raw = r#"{
            "backends": {},
            "routing": {"costWeight": 0.2, "latencyWeight": 0.8, "availabilityWeight": 0.2}
        }"#;
        let err = RouterConfig::from_json_str(raw).unwrap_err();
        assert!(matches!(err, RouterError::InvalidInput(_)));
    }
}
