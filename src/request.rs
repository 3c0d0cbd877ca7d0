//! Request/response data model (`spec.md` §3).
//!
//! `options` is a closed struct rather than an open map: unrecognized keys
//! are rejected by `serde` when a caller builds a request from JSON, and are
//! structurally impossible on the programmatic builder path.

use crate::error::{RouterError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recognized request options (`spec.md` §3 "Request").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RequestOptions {
    /// Force a specific backend by name.
    #[serde(default)]
    pub backend: Option<String>,
    /// Override the configured model identifier.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature, 0.0–2.0.
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub bypass_cache: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RequestOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(max_tokens) = self.max_tokens {
            if max_tokens == 0 {
                return Err(RouterError::InvalidInput(
                    "options.maxTokens must be positive".into(),
                ));
            }
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(RouterError::InvalidInput(
                    "options.temperature must be within 0.0..=2.0".into(),
                ));
            }
        }
        if let Some(max_retries) = self.max_retries {
            if max_retries == 0 {
                return Err(RouterError::InvalidInput(
                    "options.maxRetries must be positive".into(),
                ));
            }
        }
        if let Some(timeout_ms) = self.timeout_ms {
            if timeout_ms == 0 {
                return Err(RouterError::InvalidInput(
                    "options.timeoutMs must be positive".into(),
                ));
            }
        }
        Ok(())
    }

    /// The subset of options that participate in the cache fingerprint.
    /// `bypassCache` (and anything else that doesn't affect output) is excluded.
    pub fn fingerprint_relevant(&self) -> Value {
        serde_json::json!({
            "backend": self.backend,
            "model": self.model,
            "maxTokens": self.max_tokens,
            "temperature": self.temperature,
        })
    }
}

/// Immutable input to [`Dispatcher::optimize`](crate::Dispatcher::optimize).
#[derive(Debug, Clone)]
pub struct Request {
    pub prompt: String,
    pub files: Vec<String>,
    pub options: RequestOptions,
}

impl Request {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            files: Vec::new(),
            options: RequestOptions::default(),
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Validation must complete in well under 1ms and must never touch a
    /// backend, the cache, or the store — it is pure CPU over the struct
    /// already in hand.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(RouterError::InvalidInput(
                "prompt must be a non-empty string after trimming".into(),
            ));
        }
        self.options.validate()
    }

    /// `options.maxRetries` if the caller set it; otherwise the router's
    /// configured default (`spec.md` §3, §6).
    pub fn effective_max_retries(&self, configured_default: u32) -> u32 {
        self.options.max_retries.unwrap_or(configured_default)
    }
}

/// Result shape returned by [`Dispatcher::optimize`](crate::Dispatcher::optimize).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub content: String,
    pub backend_used: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub cost_eur: f64,
    pub latency_ms: u64,
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Response {
    /// A shallow copy reshaped into a cache-hit response: zeroed cost/tokens,
    /// `latencyMs` overwritten with the cache-lookup time, per `spec.md` §3's
    /// invariant.
    pub fn as_cache_hit(&self, lookup_latency_ms: u64) -> Self {
        Self {
            content: self.content.clone(),
            backend_used: self.backend_used.clone(),
            tokens_input: 0,
            tokens_output: 0,
            cost_eur: 0.0,
            latency_ms: lookup_latency_ms,
            cache_hit: true,
            metadata: self.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prompt_fails_validation() {
        let req = Request::new("   ");
        let err = req.validate().unwrap_err();
        assert!(matches!(err, RouterError::InvalidInput(_)));
    }

    #[test]
    fn single_char_prompt_passes() {
        let req = Request::new("a");
        assert!(req.validate().is_ok());
    }

    #[test]
    fn temperature_out_of_range_fails() {
        let mut req = Request::new("hello");
        req.options.temperature = Some(2.5);
        assert!(req.validate().is_err());
    }

    #[test]
    fn zero_max_retries_fails() {
        let mut req = Request::new("hello");
        req.options.max_retries = Some(0);
        assert!(req.validate().is_err());
    }

    #[test]
    fn unrecognized_option_key_rejected_at_deserialize() {
        let raw = r#"{"bogus": true}"#;
        let result: std::result::Result<RequestOptions, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn bypass_cache_excluded_from_fingerprint_relevant_options() {
        let mut a = RequestOptions::default();
        a.bypass_cache = false;
        let mut b = RequestOptions::default();
        b.bypass_cache = true;
        assert_eq!(a.fingerprint_relevant(), b.fingerprint_relevant());
    }

    #[test]
    fn cache_hit_response_zeroes_cost_and_tokens() {
        let original = Response {
            content: "hi".into(),
            backend_used: "mock".into(),
            tokens_input: 10,
            tokens_output: 20,
            cost_eur: 0.003,
            latency_ms: 50,
            cache_hit: false,
            metadata: None,
        };
        let hit = original.as_cache_hit(2);
        assert!(hit.cache_hit);
        assert_eq!(hit.tokens_input, 0);
        assert_eq!(hit.tokens_output, 0);
        assert_eq!(hit.cost_eur, 0.0);
        assert_eq!(hit.latency_ms, 2);
        assert_eq!(hit.content, "hi");
    }
}
