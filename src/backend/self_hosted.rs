//! Adapter for `openai-compatible-self-hosted` backends (`spec.md` §4.3.3):
//! Ollama, vLLM, llama.cpp server, LM Studio, or a bespoke Qwen/Flexcon
//! deployment sitting behind an OpenAI-compatible gateway.
//!
//! Identical wire shape to [`OpenAiBackend`](super::OpenAiBackend); the only
//! behavioural differences are that `costPerToken` is typically 0 and the
//! API key may be absent for a loopback deployment, and `ping` treats a
//! `400` response from `/v1/models` as "reachable" rather than a failure —
//! several self-hosted gateways answer a bare probe with a 400 rather than
//! a clean 200.

use super::openai::{classify_http_status, classify_transport_error, estimate_tokens};
use super::{AdapterCompletion, Backend};
use crate::config::BackendDescriptor;
use crate::ctx::CallCtx;
use crate::error::AdapterResult;
use crate::request::Request;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

pub struct SelfHostedOpenAiBackend {
    descriptor: BackendDescriptor,
    client: Client,
}

impl std::fmt::Debug for SelfHostedOpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfHostedOpenAiBackend")
            .field("name", &self.descriptor.name)
            .field("base_url", &self.descriptor.base_url)
            .field("model", &self.descriptor.model)
            .finish()
    }
}

impl SelfHostedOpenAiBackend {
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
            "messages": [{"role": "user", "content": request.prompt}],
            "max_tokens": request.options.max_tokens,
            "temperature": request.options.temperature,
        })
    }
}

#[async_trait]
impl Backend for SelfHostedOpenAiBackend {
    async fn send(
        &self,
        request: &Request,
        api_key: Option<&str>,
        _ctx: &CallCtx,
    ) -> AdapterResult<AdapterCompletion> {
        let url = format!(
            "{}/v1/chat/completions",
            self.descriptor.base_url.trim_end_matches('/')
        );
        let body = self.build_body(request);

        let mut req = self.client.post(&url).json(&body);
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
            .map_err(|e| crate::error::AdapterError::BackendError(format!("invalid JSON response: {e}")))?;
        super::openai::parse_response(&json_resp)
    }

    async fn ping(&self, api_key: Option<&str>, _ctx: &CallCtx) -> bool {
        let url = format!(
            "{}/v1/models",
            self.descriptor.base_url.trim_end_matches('/')
        );
        let mut req = self.client.get(&url);
        if let Some(key) = api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        match req.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                resp.status().is_success() || status == 400
            }
            Err(_) => false,
        }
    }

    fn estimate_cost(&self, request: &Request) -> f64 {
        estimate_tokens(&request.prompt, request.options.max_tokens) * self.descriptor.cost_per_token
    }

    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    fn descriptor() -> BackendDescriptor {
        BackendDescriptor {
            name: "ollama".into(),
            kind: BackendKind::OpenaiCompatibleSelfHosted,
            enabled: true,
            priority: 0,
            cost_per_token: 0.0,
            base_url: "http://localhost:11434".into(),
            model: "llama3.2:3b".into(),
            api_key_ref: None,
            timeout_ms: 30_000,
            supports_streaming: true,
        }
    }

    #[test]
    fn cost_is_zero_for_a_free_self_hosted_backend() {
        let backend = SelfHostedOpenAiBackend::new(descriptor());
        let request = Request::new("hi");
        assert_eq!(backend.estimate_cost(&request), 0.0);
    }

    #[test]
    fn build_body_matches_openai_shape() {
        let backend = SelfHostedOpenAiBackend::new(descriptor());
        let request = Request::new("hi");
        let body = backend.build_body(&request);
        assert_eq!(body["model"], "llama3.2:3b");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[tokio::test]
    async fn ping_treats_a_400_from_models_as_reachable() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let mut d = descriptor();
        d.base_url = server.uri();
        let backend = SelfHostedOpenAiBackend::new(d);
        let ctx = CallCtx::new();
        assert!(backend.ping(None, &ctx).await);
    }

    #[tokio::test]
    async fn ping_fails_against_an_unreachable_server() {
        let mut d = descriptor();
        d.base_url = "http://127.0.0.1:1".into();
        let backend = SelfHostedOpenAiBackend::new(d);
        let ctx = CallCtx::new();
        assert!(!backend.ping(None, &ctx).await);
    }
}
