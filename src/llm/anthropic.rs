//! Anthropic messages API client.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::client::{CodeGenClient, Message, DEFAULT_SYSTEM_PROMPT};
use super::litellm::{api_error, REQUEST_TIMEOUT};
use super::usage::{TokenAccumulator, TokenUsage};
use crate::error::LlmError;
use crate::metrics::MetricsCollector;

pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-5-20250929";

pub struct AnthropicClient {
    api_base: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    http_client: Client,
    tokens: TokenAccumulator,
    metrics: MetricsCollector,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_base: ANTHROPIC_API_BASE.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 4096,
            http_client,
            tokens: TokenAccumulator::new(),
            metrics: MetricsCollector::new(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    async fn send(&self, request: &MessagesRequest<'_>) -> Result<MessagesResponse, LlmError> {
        let url = format!("{}/v1/messages", self.api_base);

        let http_response = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = http_response.status();
        if !status.is_success() {
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(api_error(status.as_u16(), &error_text));
        }

        http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u64,
    output_tokens: u64,
}

impl MessagesResponse {
    /// Concatenated text blocks.
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[async_trait]
impl CodeGenClient for AnthropicClient {
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f64,
    ) -> Result<String, LlmError> {
        let request = MessagesRequest {
            model: &self.model,
            system: system.unwrap_or(DEFAULT_SYSTEM_PROMPT),
            messages: vec![Message::user(prompt)],
            max_tokens: self.max_tokens,
            temperature,
        };

        let started = Instant::now();
        let result = self.send(&request).await;
        let latency = started.elapsed().as_secs_f64();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.metrics
                    .record_llm_request(&self.model, false, latency, 0, 0);
                return Err(e);
            }
        };

        let (input, output) = response
            .usage
            .as_ref()
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or((0, 0));
        self.tokens.record(input, output);
        self.metrics
            .record_llm_request(&self.model, true, latency, input, output);

        tracing::debug!(
            model = %self.model,
            input_tokens = input,
            output_tokens = output,
            latency_secs = latency,
            "Message received"
        );

        let text = response.text();
        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text)
    }

    fn usage(&self) -> TokenUsage {
        self.tokens.snapshot()
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = MessagesRequest {
            model: DEFAULT_ANTHROPIC_MODEL,
            system: DEFAULT_SYSTEM_PROMPT,
            messages: vec![Message::user("profile this")],
            max_tokens: 4096,
            temperature: 0.2,
        };
        let json: serde_json::Value = serde_json::to_value(&request).unwrap();
        assert_eq!(json["system"], DEFAULT_SYSTEM_PROMPT);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["max_tokens"], 4096);
    }

    #[test]
    fn test_response_text_joins_text_blocks() {
        let body = r#"{
            "content": [
                {"type": "text", "text": "import pandas"},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": " as pd"}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 5}
        }"#;
        let response: MessagesResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.text(), "import pandas as pd");
        assert_eq!(response.usage.unwrap().output_tokens, 5);
    }

    #[test]
    fn test_with_api_base() {
        let client = AnthropicClient::new("key", DEFAULT_ANTHROPIC_MODEL)
            .unwrap()
            .with_api_base("http://localhost:9999/");
        assert_eq!(client.api_base, "http://localhost:9999");
        assert_eq!(client.model_name(), DEFAULT_ANTHROPIC_MODEL);
    }

    #[tokio::test]
    async fn test_generate_connection_error() {
        let client = AnthropicClient::new("key", DEFAULT_ANTHROPIC_MODEL)
            .unwrap()
            .with_api_base("http://localhost:65535");
        let err = client.generate("hi", None, 0.0).await.unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed(_)));
    }
}
