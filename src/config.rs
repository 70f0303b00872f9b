//! Environment-driven settings for ml-forge.
//!
//! Every value has a default and can be overridden through an environment
//! variable; [`Settings::from_env`] validates the result before returning.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::llm::anthropic::DEFAULT_ANTHROPIC_MODEL;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which API the code-generation client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProviderKind {
    Anthropic,
    OpenAi,
    /// Any OpenAI-compatible proxy.
    LiteLlm,
}

impl LlmProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProviderKind::Anthropic => "anthropic",
            LlmProviderKind::OpenAi => "openai",
            LlmProviderKind::LiteLlm => "litellm",
        }
    }

    /// Model used when `LLM_MODEL` is not set.
    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProviderKind::Anthropic => DEFAULT_ANTHROPIC_MODEL,
            LlmProviderKind::OpenAi | LlmProviderKind::LiteLlm => "gpt-4o",
        }
    }
}

impl fmt::Display for LlmProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" => Ok(LlmProviderKind::Anthropic),
            "openai" => Ok(LlmProviderKind::OpenAi),
            "litellm" => Ok(LlmProviderKind::LiteLlm),
            other => Err(format!(
                "unknown provider '{}', expected anthropic, openai or litellm",
                other
            )),
        }
    }
}

/// Where run checkpoints are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointBackend {
    Memory,
    Sqlite,
}

impl FromStr for CheckpointBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(CheckpointBackend::Memory),
            "sqlite" => Ok(CheckpointBackend::Sqlite),
            other => Err(format!("unknown backend '{}', expected memory or sqlite", other)),
        }
    }
}

/// Settings for one ml-forge process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_level: String,

    // LLM settings
    pub llm_provider: LlmProviderKind,
    pub llm_model: String,
    /// Overrides the provider's default endpoint.
    pub llm_api_base: Option<String>,
    pub llm_api_key: Option<String>,

    // Sandbox settings
    pub sandbox_timeout: Duration,
    pub sandbox_memory_limit_mb: u64,
    pub sandbox_python: String,

    // Pipeline settings
    pub max_loops: u32,
    pub checkpoint_enabled: bool,
    pub checkpoint_backend: CheckpointBackend,
    pub checkpoint_path: PathBuf,
    pub artifact_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),

            llm_provider: LlmProviderKind::Anthropic,
            llm_model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            llm_api_base: None,
            llm_api_key: None,

            sandbox_timeout: Duration::from_secs(60),
            sandbox_memory_limit_mb: 512,
            sandbox_python: "python3".to_string(),

            max_loops: 3,
            checkpoint_enabled: true,
            checkpoint_backend: CheckpointBackend::Memory,
            checkpoint_path: PathBuf::from("/tmp/ml-pipeline/checkpoints"),
            artifact_path: PathBuf::from("/tmp/ml-pipeline/artifacts"),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates settings from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LOG_LEVEL`: tracing filter when `RUST_LOG` is unset (default: info)
    /// - `LLM_PROVIDER`: anthropic, openai or litellm (default: anthropic)
    /// - `LLM_MODEL`: model identifier (default depends on provider)
    /// - `LLM_API_BASE`: endpoint override
    /// - `LLM_API_KEY`: falls back to `ANTHROPIC_API_KEY` or `OPENAI_API_KEY`
    /// - `SANDBOX_TIMEOUT_SEC`: per-execution deadline (default: 60)
    /// - `SANDBOX_MEMORY_LIMIT_MB`: address-space limit (default: 512)
    /// - `SANDBOX_PYTHON`: interpreter (default: python3)
    /// - `MAX_LOOPS`: critic loop ceiling (default: 3)
    /// - `CHECKPOINT_ENABLED`: persist checkpoints (default: true)
    /// - `CHECKPOINT_BACKEND`: memory or sqlite (default: memory)
    /// - `CHECKPOINT_PATH`: sqlite directory (default: /tmp/ml-pipeline/checkpoints)
    /// - `ARTIFACT_LOCAL_PATH`: artifact root (default: /tmp/ml-pipeline/artifacts)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("LOG_LEVEL") {
            config.log_level = val.to_lowercase();
        }

        // LLM settings
        if let Ok(val) = std::env::var("LLM_PROVIDER") {
            config.llm_provider = parse_env_value(&val, "LLM_PROVIDER")?;
        }
        config.llm_model = std::env::var("LLM_MODEL")
            .unwrap_or_else(|_| config.llm_provider.default_model().to_string());
        config.llm_api_base = std::env::var("LLM_API_BASE").ok();

        let provider_key = match config.llm_provider {
            LlmProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            LlmProviderKind::OpenAi | LlmProviderKind::LiteLlm => "OPENAI_API_KEY",
        };
        config.llm_api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var(provider_key))
            .ok()
            .filter(|k| !k.is_empty());

        // Sandbox settings
        if let Ok(val) = std::env::var("SANDBOX_TIMEOUT_SEC") {
            let secs: u64 = parse_env_value(&val, "SANDBOX_TIMEOUT_SEC")?;
            config.sandbox_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("SANDBOX_MEMORY_LIMIT_MB") {
            config.sandbox_memory_limit_mb = parse_env_value(&val, "SANDBOX_MEMORY_LIMIT_MB")?;
        }

        if let Ok(val) = std::env::var("SANDBOX_PYTHON") {
            config.sandbox_python = val;
        }

        // Pipeline settings
        if let Ok(val) = std::env::var("MAX_LOOPS") {
            config.max_loops = parse_env_value(&val, "MAX_LOOPS")?;
        }

        if let Ok(val) = std::env::var("CHECKPOINT_ENABLED") {
            config.checkpoint_enabled = parse_env_bool(&val, "CHECKPOINT_ENABLED")?;
        }

        if let Ok(val) = std::env::var("CHECKPOINT_BACKEND") {
            config.checkpoint_backend = parse_env_value(&val, "CHECKPOINT_BACKEND")?;
        }

        if let Ok(val) = std::env::var("CHECKPOINT_PATH") {
            config.checkpoint_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ARTIFACT_LOCAL_PATH") {
            config.artifact_path = PathBuf::from(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llm_model.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "llm_model cannot be empty".to_string(),
            ));
        }

        if self.sandbox_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "sandbox_timeout must be greater than 0".to_string(),
            ));
        }

        if self.sandbox_memory_limit_mb < 64 {
            return Err(ConfigError::ValidationFailed(
                "sandbox_memory_limit_mb must be at least 64 MB".to_string(),
            ));
        }

        if self.sandbox_python.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "sandbox_python cannot be empty".to_string(),
            ));
        }

        if self.max_loops == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_loops must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the provider and resets the model to that provider's default.
    pub fn with_llm_provider(mut self, provider: LlmProviderKind) -> Self {
        self.llm_provider = provider;
        self.llm_model = provider.default_model().to_string();
        self
    }

    pub fn with_llm_model(mut self, model: impl Into<String>) -> Self {
        self.llm_model = model.into();
        self
    }

    pub fn with_llm_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.llm_api_base = Some(api_base.into());
        self
    }

    pub fn with_llm_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.llm_api_key = Some(api_key.into());
        self
    }

    pub fn with_sandbox_timeout(mut self, timeout: Duration) -> Self {
        self.sandbox_timeout = timeout;
        self
    }

    pub fn with_sandbox_memory_limit_mb(mut self, memory: u64) -> Self {
        self.sandbox_memory_limit_mb = memory;
        self
    }

    pub fn with_sandbox_python(mut self, python: impl Into<String>) -> Self {
        self.sandbox_python = python.into();
        self
    }

    pub fn with_max_loops(mut self, max_loops: u32) -> Self {
        self.max_loops = max_loops;
        self
    }

    pub fn with_checkpoint_backend(mut self, backend: CheckpointBackend) -> Self {
        self.checkpoint_backend = backend;
        self
    }

    pub fn with_checkpoint_enabled(mut self, enabled: bool) -> Self {
        self.checkpoint_enabled = enabled;
        self
    }

    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = path.into();
        self
    }

    pub fn with_artifact_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact_path = path.into();
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T: FromStr,
{
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
