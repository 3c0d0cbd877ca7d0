//! `generic-self-hosted` adapter (`spec.md` §4.3.4): a configurable JSON
//! shape for bespoke providers that speak neither the OpenAI nor Anthropic
//! wire protocol. Timing, error, and cost semantics are identical to the
//! other kinds; only the request/response JSON field names differ.

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

/// Field-name mapping for a bespoke JSON wire shape. Defaults mirror the
/// common `{prompt, completion}` shape several internal gateways use.
#[derive(Debug, Clone)]
pub struct GenericWireShape {
    pub request_path: String,
    pub prompt_field: String,
    pub response_text_field: String,
    pub tokens_input_field: Option<String>,
    pub tokens_output_field: Option<String>,
}

impl Default for GenericWireShape {
    fn default() -> Self {
        Self {
            request_path: "/completions".into(),
            prompt_field: "prompt".into(),
            response_text_field: "completion".into(),
            tokens_input_field: Some("tokens_input".into()),
            tokens_output_field: Some("tokens_output".into()),
        }
    }
}

pub struct GenericSelfHostedBackend {
    descriptor: BackendDescriptor,
    shape: GenericWireShape,
    client: Client,
}

impl std::fmt::Debug for GenericSelfHostedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericSelfHostedBackend")
            .field("name", &self.descriptor.name)
            .field("base_url", &self.descriptor.base_url)
            .finish()
    }
}

impl GenericSelfHostedBackend {
    pub fn new(descriptor: BackendDescriptor, shape: GenericWireShape) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(descriptor.timeout_ms))
            .build()
            .expect("failed to build HTTP client");
        Self {
            descriptor,
            shape,
            client,
        }
    }

    fn build_body(&self, request: &Request) -> Value {
        let mut body = serde_json::Map::new();
        body.insert(self.shape.prompt_field.clone(), json!(request.prompt));
        Value::Object(body)
    }

    fn parse_response(&self, json_resp: &Value) -> AdapterResult<AdapterCompletion> {
        let content = json_resp
            .get(&self.shape.response_text_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AdapterError::BackendError(format!(
                    "response missing configured field '{}'",
                    self.shape.response_text_field
                ))
            })?
            .to_string();

        let tokens_input = self
            .shape
            .tokens_input_field
            .as_ref()
            .and_then(|f| json_resp.get(f))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let tokens_output = self
            .shape
            .tokens_output_field
            .as_ref()
            .and_then(|f| json_resp.get(f))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        Ok(AdapterCompletion {
            content,
            tokens_input,
            tokens_output,
            metadata: None,
        })
    }
}

#[async_trait]
impl Backend for GenericSelfHostedBackend {
    async fn send(
        &self,
        request: &Request,
        api_key: Option<&str>,
        _ctx: &CallCtx,
    ) -> AdapterResult<AdapterCompletion> {
        let url = format!(
            "{}{}",
            self.descriptor.base_url.trim_end_matches('/'),
            self.shape.request_path
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
        self.parse_response(&json_resp)
    }

    async fn ping(&self, api_key: Option<&str>, _ctx: &CallCtx) -> bool {
        let url = self.descriptor.base_url.trim_end_matches('/').to_string();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use serde_json::json;

    fn descriptor() -> BackendDescriptor {
        BackendDescriptor {
            name: "bespoke".into(),
            kind: BackendKind::GenericSelfHosted,
            enabled: true,
            priority: 0,
            cost_per_token: 0.0,
            base_url: "http://localhost:8080".into(),
            model: "bespoke-model".into(),
            api_key_ref: None,
            timeout_ms: 30_000,
            supports_streaming: false,
        }
    }

    #[test]
    fn build_body_uses_configured_prompt_field() {
        let backend = GenericSelfHostedBackend::new(descriptor(), GenericWireShape::default());
        let request = Request::new("hi");
        let body = backend.build_body(&request);
        assert_eq!(body["prompt"], "hi");
    }

    #[test]
    fn parse_response_uses_configured_field_names() {
        let backend = GenericSelfHostedBackend::new(
            descriptor(),
            GenericWireShape {
                response_text_field: "text".into(),
                ..GenericWireShape::default()
            },
        );
        let raw = json!({"text": "bespoke output"});
        let completion = backend.parse_response(&raw).expect("parses");
        assert_eq!(completion.content, "bespoke output");
    }

    #[test]
    fn parse_response_missing_field_is_backend_error() {
        let backend = GenericSelfHostedBackend::new(descriptor(), GenericWireShape::default());
        let raw = json!({"unrelated": "value"});
        assert!(backend.parse_response(&raw).is_err());
    }

    #[tokio::test]
    async fn send_posts_to_the_configured_path_and_field() {
        use crate::ctx::CallCtx;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "completion": "bespoke output",
                "tokens_input": 4,
                "tokens_output": 2
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut d = descriptor();
        d.base_url = server.uri();
        let backend = GenericSelfHostedBackend::new(d, GenericWireShape::default());
        let request = Request::new("hi");
        let ctx = CallCtx::new();
        let completion = backend.send(&request, None, &ctx).await.unwrap();
        assert_eq!(completion.content, "bespoke output");
        assert_eq!(completion.tokens_input, 4);
    }
}
