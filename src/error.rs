//! Error types for ml-forge operations.
//!
//! Defines error types for the major subsystems:
//! - Sandbox process management
//! - Language-model API interactions
//! - Checkpoint persistence
//! - Artifact storage
//! - Workflow graph dispatch
//! - Run execution

use thiserror::Error;

/// Errors raised while launching or supervising a sandbox process.
///
/// These never escape [`crate::sandbox::CodeSandbox::execute`]; they are
/// folded into a failed `ExecutionResult`.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to start interpreter: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key for provider '{0}'")]
    MissingApiKey(String),

    #[error("Unknown LLM provider: {0}")]
    UnknownProvider(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("LLM returned an empty response")]
    EmptyResponse,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while persisting or loading checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid checkpoint for run '{run_id}': {reason}")]
    Corrupt { run_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur in artifact storage.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Invalid run id '{0}'")]
    InvalidRunId(String),
}

/// Errors that escape a phase handler or the graph itself.
///
/// Recoverable failures are recorded in the run state instead; anything
/// surfacing as a `GraphError` aborts the run.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("No handler registered for phase '{0}'")]
    MissingHandler(String),

    #[error("Phase '{phase}' failed: {message}")]
    Handler { phase: String, message: String },

    #[error("State merge rejected: {0}")]
    Merge(String),

    #[error("Graph exceeded {0} phase transitions")]
    StepLimitExceeded(usize),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Prompt rendering error: {0}")]
    Prompt(#[from] tera::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    /// Short type name recorded in run errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            GraphError::MissingHandler(_) => "MissingHandler",
            GraphError::Handler { .. } => "HandlerError",
            GraphError::Merge(_) => "MergeError",
            GraphError::StepLimitExceeded(_) => "StepLimitExceeded",
            GraphError::Llm(_) => "LlmError",
            GraphError::Prompt(_) => "PromptError",
            GraphError::Serialization(_) => "SerializationError",
        }
    }
}

/// Errors that can occur while submitting or driving runs.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Run '{0}' not found")]
    RunNotFound(String),

    #[error("Run '{0}' is already active")]
    AlreadyActive(String),

    #[error("Run '{0}' has already finished")]
    AlreadyFinished(String),

    #[error("Run '{0}' has a saved checkpoint; resume it instead")]
    Resumable(String),

    #[error("Invalid run id '{0}'")]
    InvalidRunId(String),

    #[error("Run task failed: {0}")]
    Join(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Short type name recorded in run errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            ExecutorError::Graph(e) => e.type_name(),
            ExecutorError::Checkpoint(_) => "CheckpointError",
            ExecutorError::Artifact(_) => "ArtifactError",
            ExecutorError::RunNotFound(_) => "RunNotFound",
            ExecutorError::AlreadyActive(_) => "AlreadyActive",
            ExecutorError::AlreadyFinished(_) => "AlreadyFinished",
            ExecutorError::Resumable(_) => "Resumable",
            ExecutorError::InvalidRunId(_) => "InvalidRunId",
            ExecutorError::Join(_) => "JoinError",
            ExecutorError::Io(_) => "IoError",
        }
    }
}
