//! ml-forge: an autonomous machine-learning pipeline.
//!
//! A run takes a dataset and a plain-language objective through six phases
//! (profiling, feature engineering, visualization, training, evaluation and
//! review), executing generated Python in a sandbox and looping back when
//! the review finds the result lacking.

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod llm;
pub mod metrics;
pub mod phases;
pub mod sandbox;
pub mod state;
pub mod utils;

// Re-export commonly used error types
pub use config::ConfigError;
pub use error::{
    ArtifactError, CheckpointError, ExecutorError, GraphError, LlmError, SandboxError,
};
