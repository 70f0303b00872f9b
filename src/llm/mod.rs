//! Language-model clients.
//!
//! Phases talk to a [`CodeGenClient`]; which concrete client backs it is
//! decided once per process by [`build_client`].
//!
//! ```ignore
//! use ml_forge::config::Settings;
//! use ml_forge::llm::build_client;
//!
//! let settings = Settings::from_env()?;
//! let client = build_client(&settings)?;
//! let code = client.generate("Load the CSV and print its shape", None, 0.2).await?;
//! println!("{} tokens so far", client.usage().total_tokens);
//! ```

pub mod anthropic;
pub mod client;
pub mod litellm;
pub mod usage;

use std::sync::Arc;

pub use anthropic::AnthropicClient;
pub use client::{CodeGenClient, Message, DEFAULT_SYSTEM_PROMPT};
pub use litellm::LiteLlmClient;
pub use usage::{TokenAccumulator, TokenUsage};

use crate::config::{LlmProviderKind, Settings};
use crate::error::LlmError;

/// Builds the client selected by `settings`.
///
/// # Errors
///
/// Returns `LlmError::MissingApiKey` when the provider requires a key and
/// none is configured.
pub fn build_client(settings: &Settings) -> Result<Arc<dyn CodeGenClient>, LlmError> {
    let client: Arc<dyn CodeGenClient> = match settings.llm_provider {
        LlmProviderKind::Anthropic => {
            let api_key = settings
                .llm_api_key
                .clone()
                .ok_or_else(|| LlmError::MissingApiKey("anthropic".to_string()))?;
            let mut client = AnthropicClient::new(api_key, &settings.llm_model)?;
            if let Some(ref base) = settings.llm_api_base {
                client = client.with_api_base(base);
            }
            Arc::new(client)
        }
        LlmProviderKind::OpenAi => {
            let api_key = settings
                .llm_api_key
                .clone()
                .ok_or_else(|| LlmError::MissingApiKey("openai".to_string()))?;
            let base = settings
                .llm_api_base
                .as_deref()
                .unwrap_or(litellm::OPENAI_API_BASE);
            Arc::new(LiteLlmClient::new(base, Some(api_key), &settings.llm_model)?)
        }
        LlmProviderKind::LiteLlm => {
            let base = settings
                .llm_api_base
                .as_deref()
                .unwrap_or(litellm::LITELLM_API_BASE);
            Arc::new(LiteLlmClient::new(
                base,
                settings.llm_api_key.clone(),
                &settings.llm_model,
            )?)
        }
    };

    tracing::info!(
        provider = %settings.llm_provider,
        model = client.model_name(),
        "LLM client ready"
    );
    Ok(client)
}
