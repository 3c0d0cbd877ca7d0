//! Adapter for `anthropic-compatible-cloud` backends (`spec.md` §4.3.2).

use super::openai::{classify_http_status, classify_transport_error, estimate_tokens};
use super::{AdapterCompletion, Backend};
use crate::config::BackendDescriptor;
use crate::ctx::CallCtx;
use crate::error::{AdapterError, AdapterResult};
use crate::request::Request;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicBackend {
    descriptor: BackendDescriptor,
    client: Client,
}

impl std::fmt::Debug for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicBackend")
            .field("name", &self.descriptor.name)
            .field("base_url", &self.descriptor.base_url)
            .field("model", &self.descriptor.model)
            .finish()
    }
}

impl AnthropicBackend {
    pub fn new(descriptor: BackendDescriptor) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(descriptor.timeout_ms))
            .build()
            .expect("failed to build HTTP client");
        Self { descriptor, client }
    }

    fn build_body(&self, request: &Request) -> Value {
        let model = request
            .options
            .model
            .clone()
            .unwrap_or_else(|| self.descriptor.model.clone());
        json!({
            "model": model,
            "max_tokens": request.options.max_tokens.unwrap_or(1024),
            "messages": [{"role": "user", "content": request.prompt}],
        })
    }

    fn parse_response(json_resp: &Value) -> AdapterResult<AdapterCompletion> {
        let content = json_resp
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|blocks| blocks.iter().find_map(|b| b.get("text")).and_then(|v| v.as_str()))
            .ok_or_else(|| {
                AdapterError::BackendError("response missing content[].text".into())
            })?
            .to_string();

        let usage = json_resp.get("usage");
        let tokens_input = usage
            .and_then(|u| u.get("input_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let tokens_output = usage
            .and_then(|u| u.get("output_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        Ok(AdapterCompletion {
            content,
            tokens_input,
            tokens_output,
            metadata: usage.cloned(),
        })
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    async fn send(
        &self,
        request: &Request,
        api_key: Option<&str>,
        _ctx: &CallCtx,
    ) -> AdapterResult<AdapterCompletion> {
        let url = format!("{}/v1/messages", self.descriptor.base_url.trim_end_matches('/'));
        let body = self.build_body(request);

        let mut req = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(key) = api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp = req.send().await.map_err(classify_transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_http_status(status.as_u16(), resp.text().await.ok()));
        }

        let json_resp: Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::BackendError(format!("invalid JSON response: {e}")))?;
        Self::parse_response(&json_resp)
    }

    async fn ping(&self, api_key: Option<&str>, _ctx: &CallCtx) -> bool {
        let url = format!("{}/v1/messages", self.descriptor.base_url.trim_end_matches('/'));
        let mut req = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({"model": self.descriptor.model, "max_tokens": 1, "messages": []}));
        if let Some(key) = api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        // Anthropic has no cheap /models probe on every deployment; a 4xx
        // here still proves the endpoint and TLS/auth stack are reachable.
        matches!(req.send().await, Ok(resp) if resp.status().as_u16() < 500)
    }

    fn estimate_cost(&self, request: &Request) -> f64 {
        estimate_tokens(&request.prompt, request.options.max_tokens) * self.descriptor.cost_per_token
    }

    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }
}
