use crate::config::toml_config::{LlmProviderKind, ServiceConfig, API_KEY_ENV};
use crate::core::prompt::split_image_blocks;
use crate::domain::model::LlmCallResult;
use crate::domain::ports::LlmGateway;
use crate::utils::error::{AnalysisError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// --- chat-completion request and response structures ---

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct UsageEnvelope {
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

fn extract_total_tokens(body: &str) -> Option<u64> {
    serde_json::from_str::<UsageEnvelope>(body)
        .ok()?
        .usage?
        .total_tokens
}

fn extract_assistant_text(body: &str) -> Option<String> {
    serde_json::from_str::<ChatResponse>(body)
        .ok()?
        .choices
        .into_iter()
        .next()?
        .message
        .content
}

/// 依 base64 開頭判斷圖片格式，無法判斷時當作 JPEG
fn image_data_url(base64_payload: &str) -> String {
    let mime = if base64_payload.starts_with("iVBOR") {
        "image/png"
    } else if base64_payload.starts_with("R0lGOD") {
        "image/gif"
    } else if base64_payload.starts_with("UklGR") {
        "image/webp"
    } else {
        "image/jpeg"
    };
    format!("data:{};base64,{}", mime, base64_payload)
}

/// OpenAI 相容的 chat-completion 端點
#[derive(Clone, Debug)]
pub struct OpenAiGateway {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    system_prompt: String,
    default_timeout: Duration,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiGateway {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            system_prompt: crate::config::toml_config::DEFAULT_SYSTEM_PROMPT.to_string(),
            default_timeout: Duration::from_secs(120),
            temperature: 0.0,
            max_tokens: 1000,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.llm_endpoint(), config.llm_model(), config.api_key())
            .with_system_prompt(config.system_prompt())
            .with_default_timeout(config.llm_timeout())
            .with_temperature(config.llm.temperature.unwrap_or(0.0))
            .with_max_tokens(config.llm.max_tokens.unwrap_or(1000))
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn build_request<'a>(&'a self, prompt: &str) -> ChatRequest<'a> {
        let (body, images) = split_image_blocks(prompt);

        let mut messages = vec![
            ChatMessage {
                role: "system",
                content: MessageContent::Text(self.system_prompt.clone()),
            },
            ChatMessage {
                role: "user",
                content: MessageContent::Text(body),
            },
        ];

        if !images.is_empty() {
            let parts = images
                .iter()
                .map(|payload| ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_data_url(payload),
                    },
                })
                .collect();
            messages.push(ChatMessage {
                role: "user",
                content: MessageContent::Parts(parts),
            });
        }

        ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[async_trait]
impl LlmGateway for OpenAiGateway {
    async fn call(&self, prompt: &str, timeout: Option<Duration>) -> Result<LlmCallResult> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| AnalysisError::ConfigError {
                message: format!("{} not configured", API_KEY_ENV),
            })?;

        let timeout = timeout.unwrap_or(self.default_timeout);
        let request_body = self.build_request(prompt);

        tracing::debug!("📡 Calling LLM {} (model={}, timeout={:?})", self.endpoint, self.model, timeout);

        let response = match self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .timeout(timeout)
            .json(&request_body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("❌ LLM HTTP call failed: {}", e);
                return Ok(LlmCallResult::failure(describe_transport_error(&e, timeout)));
            }
        };

        let status = response.status();
        let raw_body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("❌ Failed to read LLM response body: {}", e);
                return Ok(LlmCallResult::failure(describe_transport_error(&e, timeout)));
            }
        };

        let total_tokens = extract_total_tokens(&raw_body);

        if !status.is_success() {
            tracing::warn!("⚠️ LLM returned {}", status.as_u16());
            return Ok(LlmCallResult::failure_with_body(
                raw_body,
                total_tokens,
                format!("LLM returned {}", status.as_u16()),
            ));
        }

        match extract_assistant_text(&raw_body) {
            Some(text) => Ok(LlmCallResult::success(raw_body, text, total_tokens)),
            None => {
                tracing::error!("❌ Unexpected LLM response envelope");
                Ok(LlmCallResult::failure_with_body(
                    raw_body,
                    total_tokens,
                    "Failed to parse assistant message",
                ))
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn describe_transport_error(error: &reqwest::Error, timeout: Duration) -> String {
    if error.is_timeout() {
        format!("LLM request timed out after {:?}", timeout)
    } else {
        error.to_string()
    }
}

const CANNED_ANALYSIS: &str = r#"{
  "imageId": "sample",
  "dishName": "Sample dish",
  "ingredients": [
    {"name": "rice", "grams": 150, "cal": 200, "p": 4.0, "f": 1.0, "c": 45.0, "confidence": 0.9}
  ],
  "totals": {"cal": 200, "p": 4.0, "f": 1.0, "c": 45.0, "confidence": 0.9},
  "overallConfidence": 0.9
}"#;

/// 本機開發用：不連網，固定回傳一份範例分析
#[derive(Clone, Debug, Default)]
pub struct CannedGateway;

#[async_trait]
impl LlmGateway for CannedGateway {
    async fn call(&self, prompt: &str, _timeout: Option<Duration>) -> Result<LlmCallResult> {
        tracing::info!("Canned gateway called (prompt length={})", prompt.len());
        Ok(LlmCallResult::success(
            CANNED_ANALYSIS.to_string(),
            CANNED_ANALYSIS.to_string(),
            Some(10),
        ))
    }

    fn model_name(&self) -> &str {
        "canned"
    }
}

pub fn create_gateway(config: &ServiceConfig) -> Arc<dyn LlmGateway> {
    match config.llm.provider {
        LlmProviderKind::OpenAi => Arc::new(OpenAiGateway::from_config(config)),
        LlmProviderKind::Canned => Arc::new(CannedGateway),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::prompt::PromptRenderer;
    use crate::domain::model::{PromptContext, Template, TemplateSourceKind};
    use httpmock::prelude::*;

    fn chat_body(content: &str, total_tokens: u64) -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-1",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": content}}
            ],
            "usage": {"prompt_tokens": 30, "completion_tokens": 12, "total_tokens": total_tokens}
        })
    }

    #[tokio::test]
    async fn test_missing_credential_fails_before_network() {
        let server = MockServer::start();
        let api_mock = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(chat_body("{}", 1));
        });

        let gateway = OpenAiGateway::new(server.url("/v1/chat/completions"), "gpt-test", None);
        let err = gateway.call("hello", None).await.unwrap_err();

        assert!(matches!(err, AnalysisError::ConfigError { .. }));
        assert_eq!(api_mock.hits(), 0);
    }

    #[tokio::test]
    async fn test_successful_call_extracts_text_and_tokens() {
        let server = MockServer::start();
        let api_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("Authorization", "Bearer sk-test")
                .body_contains("gpt-test")
                .body_contains("professional nutrition analyst");
            then.status(200)
                .header("Content-Type", "application/json")
                .json_body(chat_body(r#"{"dishName":"rice"}"#, 42));
        });

        let gateway = OpenAiGateway::new(
            server.url("/v1/chat/completions"),
            "gpt-test",
            Some("sk-test".to_string()),
        );
        let result = gateway.call("Analyze this plate", None).await.unwrap();

        api_mock.assert();
        assert!(result.succeeded);
        assert_eq!(result.assistant_text.as_deref(), Some(r#"{"dishName":"rice"}"#));
        assert_eq!(result.total_tokens, Some(42));
        assert!(result.raw_content.contains("chatcmpl-1"));
        assert!(result.error_message.is_none());
    }

    #[tokio::test]
    async fn test_images_are_sent_as_content_parts() {
        let server = MockServer::start();
        let api_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body_contains("image_url")
                .body_contains("data:image/png;base64,iVBORw0KGgo");
            then.status(200).json_body(chat_body("ok", 5));
        });

        let template = Template::new("analyze", "Describe {{hint}}".to_string(), TemplateSourceKind::Local);
        let context = PromptContext::new()
            .with_variable("hint", "lunch")
            .with_image(b"\x89PNG\r\n\x1a\n0000".to_vec());
        let prompt = PromptRenderer::render(&template, &context);

        let gateway = OpenAiGateway::new(
            server.url("/v1/chat/completions"),
            "gpt-test",
            Some("sk-test".to_string()),
        );
        let result = gateway.call(&prompt, None).await.unwrap();

        api_mock.assert();
        assert!(result.succeeded);
    }

    #[tokio::test]
    async fn test_error_status_preserves_body() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(429)
                .json_body(serde_json::json!({"error": {"message": "rate limited"}}));
        });

        let gateway = OpenAiGateway::new(
            server.url("/v1/chat/completions"),
            "gpt-test",
            Some("sk-test".to_string()),
        );
        let result = gateway.call("hello", None).await.unwrap();

        assert!(!result.succeeded);
        assert_eq!(result.error_message.as_deref(), Some("LLM returned 429"));
        assert!(result.raw_content.contains("rate limited"));
        assert_eq!(result.total_tokens, None);
    }

    #[tokio::test]
    async fn test_unexpected_envelope_is_distinct_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .json_body(serde_json::json!({"choices": [], "usage": {"total_tokens": 9}}));
        });

        let gateway = OpenAiGateway::new(
            server.url("/v1/chat/completions"),
            "gpt-test",
            Some("sk-test".to_string()),
        );
        let result = gateway.call("hello", None).await.unwrap();

        assert!(!result.succeeded);
        assert_eq!(
            result.error_message.as_deref(),
            Some("Failed to parse assistant message")
        );
        assert_eq!(result.total_tokens, Some(9));
        assert!(result.raw_content.contains("choices"));
    }

    #[tokio::test]
    async fn test_timeout_is_reported_not_raised() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .delay(Duration::from_millis(500))
                .json_body(chat_body("late", 1));
        });

        let gateway = OpenAiGateway::new(
            server.url("/v1/chat/completions"),
            "gpt-test",
            Some("sk-test".to_string()),
        );
        let result = gateway
            .call("hello", Some(Duration::from_millis(50)))
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert!(result.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_connection_failure_is_reported_not_raised() {
        let gateway = OpenAiGateway::new(
            "http://127.0.0.1:9/v1/chat/completions",
            "gpt-test",
            Some("sk-test".to_string()),
        );
        let result = gateway
            .call("hello", Some(Duration::from_secs(2)))
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert!(result.error_message.is_some());
        assert!(result.raw_content.is_empty());
    }

    #[tokio::test]
    async fn test_canned_gateway_returns_json() {
        let result = CannedGateway.call("anything", None).await.unwrap();
        assert!(result.succeeded);
        let parsed: serde_json::Value =
            serde_json::from_str(result.assistant_text.as_deref().unwrap()).unwrap();
        assert_eq!(parsed["dishName"], "Sample dish");
    }

    #[test]
    fn test_image_data_url_sniffs_format() {
        assert!(image_data_url("iVBORw0KGgo").starts_with("data:image/png"));
        assert!(image_data_url("/9j/4AAQ").starts_with("data:image/jpeg"));
        assert!(image_data_url("UklGRiQ").starts_with("data:image/webp"));
    }
}
