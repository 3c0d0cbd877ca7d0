//! Adapter for `openai-compatible-cloud` backends (`spec.md` §4.3.1).
//!
//! Covers OpenAI itself and any provider that mirrors its
//! `/v1/chat/completions` wire shape (Groq, Mistral, Fireworks, Together AI,
//! and similar).

use super::{AdapterCompletion, Backend};
use crate::config::BackendDescriptor;
use crate::ctx::CallCtx;
use crate::error::{AdapterError, AdapterResult};
use crate::request::Request;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Backend for the OpenAI chat-completions wire protocol.
pub struct OpenAiBackend {
    descriptor: BackendDescriptor,
    client: Client,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("name", &self.descriptor.name)
            .field("base_url", &self.descriptor.base_url)
            .field("model", &self.descriptor.model)
            .field(
                "api_key_ref",
                &self.descriptor.api_key_ref.as_ref().map(|r| redact(r)),
            )
            .finish()
    }
}

fn redact(value: &str) -> String {
    if value.len() > 6 {
        format!("{}***", &value[..6])
    } else {
        "***".to_string()
    }
}

impl OpenAiBackend {
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

/// Parse an OpenAI-shaped chat-completions response body. Shared with
/// [`SelfHostedOpenAiBackend`](super::SelfHostedOpenAiBackend), which speaks
/// the identical wire protocol.
pub(crate) fn parse_response(json_resp: &Value) -> AdapterResult<AdapterCompletion> {
    let content = json_resp
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            AdapterError::BackendError("response missing choices[0].message.content".into())
        })?
        .to_string();

    let usage = json_resp.get("usage");
    let tokens_input = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let tokens_output = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    Ok(AdapterCompletion {
        content,
        tokens_input,
        tokens_output,
        metadata: usage.cloned(),
    })
}

#[async_trait]
impl Backend for OpenAiBackend {
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
            .map_err(|e| AdapterError::BackendError(format!("invalid JSON response: {e}")))?;
        parse_response(&json_resp)
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
        matches!(req.send().await, Ok(resp) if resp.status().is_success())
    }

    fn estimate_cost(&self, request: &Request) -> f64 {
        estimate_tokens(&request.prompt, request.options.max_tokens) * self.descriptor.cost_per_token
    }

    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }
}

/// Crude token estimate used only for pre-call cost scoring, not accounting
/// (actual token counts come from the provider's `usage` block post-call).
pub(crate) fn estimate_tokens(prompt: &str, max_tokens: Option<u32>) -> f64 {
    let prompt_tokens = (prompt.len() as f64 / 4.0).ceil();
    prompt_tokens + max_tokens.unwrap_or(256) as f64
}

pub(crate) fn classify_transport_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout { elapsed_ms: 0 }
    } else {
        AdapterError::TransientBackendError(err.to_string())
    }
}

pub(crate) fn classify_http_status(status: u16, body: Option<String>) -> AdapterError {
    let body = body.unwrap_or_default();
    match status {
        401 | 403 | 400 | 404 | 422 => AdapterError::BackendError(format!("HTTP {status}: {body}")),
        429 | 500..=599 => AdapterError::TransientBackendError(format!("HTTP {status}: {body}")),
        _ => AdapterError::BackendError(format!("HTTP {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    fn descriptor() -> BackendDescriptor {
        BackendDescriptor {
            name: "openai".into(),
            kind: BackendKind::OpenaiCompatibleCloud,
            enabled: true,
            priority: 0,
            cost_per_token: 0.0001,
            base_url: "https://api.openai.com".into(),
            model: "gpt-4o".into(),
            api_key_ref: Some("ENV:OPENAI_API_KEY".into()),
            timeout_ms: 30_000,
            supports_streaming: true,
        }
    }

    #[test]
    fn build_body_uses_descriptor_model_by_default() {
        let backend = OpenAiBackend::new(descriptor());
        let request = Request::new("why is the sky blue?");
        let body = backend.build_body(&request);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn build_body_honors_model_override() {
        let backend = OpenAiBackend::new(descriptor());
        let mut request = Request::new("hi");
        request.options.model = Some("gpt-4o-mini".into());
        let body = backend.build_body(&request);
        assert_eq!(body["model"], "gpt-4o-mini");
    }

    #[test]
    fn parse_response_extracts_content_and_usage() {
        let raw = json!({
            "choices": [{"message": {"content": "hello there"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 20}
        });
        let completion = parse_response(&raw).expect("parses");
        assert_eq!(completion.content, "hello there");
        assert_eq!(completion.tokens_input, 10);
        assert_eq!(completion.tokens_output, 20);
    }

    #[test]
    fn parse_response_missing_content_is_backend_error() {
        let raw = json!({"choices": []});
        let err = parse_response(&raw).unwrap_err();
        assert!(matches!(err, AdapterError::BackendError(_)));
    }

    #[test]
    fn classify_http_status_maps_auth_errors_as_non_retryable() {
        assert!(matches!(
            classify_http_status(401, None),
            AdapterError::BackendError(_)
        ));
    }

    #[test]
    fn classify_http_status_maps_5xx_as_transient() {
        assert!(matches!(
            classify_http_status(503, None),
            AdapterError::TransientBackendError(_)
        ));
    }

    #[test]
    fn classify_http_status_maps_429_as_transient() {
        assert!(matches!(
            classify_http_status(429, None),
            AdapterError::TransientBackendError(_)
        ));
    }

    #[test]
    fn debug_redacts_api_key_reference() {
        let backend = OpenAiBackend::new(descriptor());
        let debug_output = format!("{:?}", backend);
        assert!(debug_output.contains("ENV:OP***"));
        assert!(!debug_output.contains("OPENAI_API_KEY\""));
    }

    #[tokio::test]
    async fn send_posts_the_documented_chat_completions_shape() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "hi there"}}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut d = descriptor();
        d.base_url = server.uri();
        let backend = OpenAiBackend::new(d);
        let request = Request::new("hello");
        let ctx = CallCtx::new();
        let completion = backend.send(&request, Some("sk-test"), &ctx).await.unwrap();
        assert_eq!(completion.content, "hi there");
        assert_eq!(completion.tokens_input, 3);
        assert_eq!(completion.tokens_output, 2);
    }

    #[tokio::test]
    async fn send_maps_a_5xx_response_to_a_transient_error() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut d = descriptor();
        d.base_url = server.uri();
        let backend = OpenAiBackend::new(d);
        let request = Request::new("hello");
        let ctx = CallCtx::new();
        let err = backend.send(&request, None, &ctx).await.unwrap_err();
        assert!(matches!(err, AdapterError::TransientBackendError(_)));
    }

    #[tokio::test]
    async fn ping_succeeds_against_a_reachable_models_endpoint() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        let mut d = descriptor();
        d.base_url = server.uri();
        let backend = OpenAiBackend::new(d);
        let ctx = CallCtx::new();
        assert!(backend.ping(None, &ctx).await);
    }
}
