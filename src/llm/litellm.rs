//! OpenAI-compatible chat-completions client.
//!
//! Works against OpenAI itself and any LiteLLM-style proxy that exposes
//! `POST {api_base}/chat/completions`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::client::{CodeGenClient, Message, DEFAULT_SYSTEM_PROMPT};
use super::usage::{TokenAccumulator, TokenUsage};
use crate::error::LlmError;
use crate::metrics::MetricsCollector;

/// Request timeout for a single completion.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const LITELLM_API_BASE: &str = "http://localhost:4000";

/// Client for OpenAI-compatible APIs.
pub struct LiteLlmClient {
    api_base: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    http_client: Client,
    tokens: TokenAccumulator,
    metrics: MetricsCollector,
}

impl LiteLlmClient {
    /// Creates a client for `model` at `api_base`.
    ///
    /// A trailing slash on `api_base` is ignored.
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            max_tokens: 4096,
            http_client,
            tokens: TokenAccumulator::new(),
            metrics: MetricsCollector::new(),
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    async fn send(&self, request: &ApiRequest<'_>) -> Result<ApiResponse, LlmError> {
        let url = format!("{}/chat/completions", self.api_base);

        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let http_response = http_request
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
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Error body returned by both OpenAI-style and Anthropic APIs.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Maps a non-success HTTP response to an [`LlmError`].
pub(crate) fn api_error(status_code: u16, body: &str) -> LlmError {
    let message = serde_json::from_str::<ApiErrorResponse>(body)
        .map(|r| r.error.message)
        .unwrap_or_else(|_| body.to_string());

    if status_code == 429 {
        return LlmError::RateLimited(message);
    }
    LlmError::ApiError {
        code: status_code,
        message,
    }
}

#[async_trait]
impl CodeGenClient for LiteLlmClient {
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f64,
    ) -> Result<String, LlmError> {
        let request = ApiRequest {
            model: &self.model,
            messages: vec![
                Message::system(system.unwrap_or(DEFAULT_SYSTEM_PROMPT)),
                Message::user(prompt),
            ],
            temperature,
            max_tokens: self.max_tokens,
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
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));
        self.tokens.record(input, output);
        self.metrics
            .record_llm_request(&self.model, true, latency, input, output);

        tracing::debug!(
            model = %self.model,
            input_tokens = input,
            output_tokens = output,
            latency_secs = latency,
            "Completion received"
        );

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }

    fn usage(&self) -> TokenUsage {
        self.tokens.snapshot()
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
