//! The code-generation client seam used by every phase.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::usage::TokenUsage;
use crate::error::LlmError;
use crate::utils::json_extraction::extract_json_object;

/// System prompt used when a caller does not supply one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a precise ML engineering assistant.";

/// A message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Text and structured generation against one configured model.
///
/// Implementations must be shareable across concurrent runs and keep a
/// running token total readable through [`CodeGenClient::usage`].
#[async_trait]
pub trait CodeGenClient: Send + Sync {
    /// Generates free text for `prompt`.
    ///
    /// `system` falls back to [`DEFAULT_SYSTEM_PROMPT`] when `None`.
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f64,
    ) -> Result<String, LlmError>;

    /// Generates a JSON object shaped by `schema`.
    ///
    /// The schema is embedded in the prompt and the object is pulled out of
    /// the response, tolerating code fences and surrounding prose.
    async fn generate_structured(
        &self,
        prompt: &str,
        system: Option<&str>,
        schema: &Value,
        temperature: f64,
    ) -> Result<Value, LlmError> {
        let prompt = structured_prompt(prompt, schema)?;
        let system = structured_system(system);
        let text = self.generate(&prompt, Some(&system), temperature).await?;
        extract_json_object(&text).ok_or_else(|| {
            LlmError::ParseError(format!(
                "no JSON object in structured response: {}",
                crate::utils::truncate_chars(&text, 200)
            ))
        })
    }

    /// Tokens consumed so far by this client.
    fn usage(&self) -> TokenUsage;

    fn model_name(&self) -> &str;
}

/// Appends the schema instruction to a structured-output prompt.
pub fn structured_prompt(prompt: &str, schema: &Value) -> Result<String, LlmError> {
    let schema = serde_json::to_string_pretty(schema)
        .map_err(|e| LlmError::ParseError(format!("invalid schema: {}", e)))?;
    Ok(format!(
        "{prompt}\n\nRespond with valid JSON matching this schema:\n```json\n{schema}\n```\nReturn ONLY the JSON object, no other text."
    ))
}

/// System prompt for structured calls.
pub fn structured_system(system: Option<&str>) -> String {
    format!(
        "{} Respond with valid JSON only.",
        system.unwrap_or(DEFAULT_SYSTEM_PROMPT)
    )
}
