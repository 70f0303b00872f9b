//! Value types carried by the run state.
//!
//! Phase outputs are deserialized from JSON printed by generated code, so
//! every field has a default and unknown keys are ignored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Pipeline phase marker recorded in the run state and status projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Accepted by the executor, graph not started yet.
    Queued,
    Initialized,
    DataProfiling,
    FeatureEngineering,
    Visualization,
    ModelTraining,
    Evaluation,
    CriticReview,
    Finalized,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Queued => "queued",
            Phase::Initialized => "initialized",
            Phase::DataProfiling => "data_profiling",
            Phase::FeatureEngineering => "feature_engineering",
            Phase::Visualization => "visualization",
            Phase::ModelTraining => "model_training",
            Phase::Evaluation => "evaluation",
            Phase::CriticReview => "critic_review",
            Phase::Finalized => "finalized",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Phase::Queued),
            "initialized" => Ok(Phase::Initialized),
            "data_profiling" => Ok(Phase::DataProfiling),
            "feature_engineering" => Ok(Phase::FeatureEngineering),
            "visualization" => Ok(Phase::Visualization),
            "model_training" => Ok(Phase::ModelTraining),
            "evaluation" => Ok(Phase::Evaluation),
            "critic_review" => Ok(Phase::CriticReview),
            "finalized" => Ok(Phase::Finalized),
            other => Err(format!("unknown phase: {}", other)),
        }
    }
}

/// File format of the input dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Csv,
    Parquet,
    Json,
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFormat::Csv => "csv",
            DataFormat::Parquet => "parquet",
            DataFormat::Json => "json",
        }
    }

    /// Infers the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "csv" => Some(DataFormat::Csv),
            "parquet" | "pq" => Some(DataFormat::Parquet),
            "json" | "jsonl" => Some(DataFormat::Json),
            _ => None,
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the input dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceRef {
    /// Where the data lives: `local`, `s3` or `url`.
    pub source_type: String,
    pub location: String,
    pub format: DataFormat,
    pub size_bytes: u64,
}

impl DataSourceRef {
    pub fn new(location: impl Into<String>, format: DataFormat, size_bytes: u64) -> Self {
        Self {
            source_type: "local".to_string(),
            location: location.into(),
            format,
            size_bytes,
        }
    }

    /// Builds a reference to a local file, reading its size from disk.
    pub fn local(path: &Path) -> std::io::Result<Self> {
        let format = DataFormat::from_path(path).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported data format: {}", path.display()),
            )
        })?;
        let size_bytes = std::fs::metadata(path)?.len();
        let location = std::fs::canonicalize(path)?.display().to_string();
        Ok(Self::new(location, format, size_bytes))
    }
}

/// Learning task inferred from the data and objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Classification,
    Regression,
    Clustering,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskType::Classification => "classification",
            TaskType::Regression => "regression",
            TaskType::Clustering => "clustering",
            TaskType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Output of the data profiling phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataProfile {
    /// `[rows, columns]`
    pub shape: Vec<u64>,
    pub dtypes: BTreeMap<String, String>,
    pub missing_counts: BTreeMap<String, u64>,
    pub missing_pct: BTreeMap<String, f64>,
    pub numeric_stats: BTreeMap<String, serde_json::Value>,
    pub categorical_stats: BTreeMap<String, serde_json::Value>,
    pub correlation_top: Vec<serde_json::Value>,
    pub key_findings: String,
    pub target_column: Option<String>,
    pub task_type: TaskType,
}

/// One engineered feature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureArtifact {
    pub name: String,
    pub code_snippet: String,
    pub source_columns: Vec<String>,
    pub dtype: String,
    pub rationale: String,
}

/// Output of the feature engineering phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureEngineering {
    pub features: Vec<FeatureArtifact>,
    pub code_executed: String,
    pub new_columns: Vec<String>,
    pub dropped_columns: Vec<String>,
    pub new_shape: Vec<u64>,
    pub validation_passed: bool,
    pub validation_notes: String,
}

/// A saved plot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlotArtifact {
    pub title: String,
    pub plot_type: String,
    pub file_path: String,
    pub description: String,
    pub interpretation: String,
}

/// Output of the visualization phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizationOutput {
    pub plots: Vec<PlotArtifact>,
    pub key_insights: String,
    pub feature_suggestions: Vec<String>,
    pub modeling_concerns: Vec<String>,
}

/// Output of the model training phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArtifact {
    pub best_model_name: String,
    pub task_type: TaskType,
    /// Raw candidate records as printed by the training code. Field names
    /// vary between runs; see `executor::summary::normalize_candidate`.
    pub candidates: Vec<serde_json::Value>,
    pub best_hyperparams: serde_json::Value,
    pub feature_importance: BTreeMap<String, f64>,
    pub serialized_path: String,
    pub training_code: String,
    pub target_column: String,
    pub feature_columns: Vec<String>,
}

/// Train/test gap classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverfittingRisk {
    #[default]
    Low,
    Moderate,
    High,
}

impl OverfittingRisk {
    /// Classifies a train-minus-test score gap.
    pub fn from_gap(gap: f64) -> Self {
        if gap < 0.05 {
            OverfittingRisk::Low
        } else if gap < 0.15 {
            OverfittingRisk::Moderate
        } else {
            OverfittingRisk::High
        }
    }
}

impl fmt::Display for OverfittingRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverfittingRisk::Low => "low",
            OverfittingRisk::Moderate => "moderate",
            OverfittingRisk::High => "high",
        };
        f.write_str(s)
    }
}

/// Output of the evaluation phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationMetrics {
    pub cv_scores: Vec<f64>,
    pub cv_mean: f64,
    pub cv_std: f64,
    pub test_metrics: BTreeMap<String, f64>,
    pub train_test_gap: f64,
    pub overfitting_risk: OverfittingRisk,
    pub evaluation_code: String,
    pub plot_paths: Vec<String>,
    pub summary: String,
}

/// Review verdict steering the graph after the critic phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Accept the result and end the run.
    Finalize,
    /// Loop back to feature engineering.
    RefineFeatures,
    /// Loop back to model training.
    RetrainModel,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Finalize => "finalize",
            Verdict::RefineFeatures => "refine_features",
            Verdict::RetrainModel => "retrain_model",
        }
    }

    /// Parses a reviewer's assessment, treating anything unrecognized as
    /// [`Verdict::Finalize`].
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "refine_features" => Verdict::RefineFeatures,
            "retrain_model" => Verdict::RetrainModel,
            _ => Verdict::Finalize,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Verdict::Finalize)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One review pass. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub iteration: u32,
    #[serde(rename = "overall_assessment")]
    pub verdict: Verdict,
    pub confidence: f64,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

impl ReviewDecision {
    /// Creates a decision, clamping confidence into `[0, 1]`.
    pub fn new(iteration: u32, verdict: Verdict, confidence: f64) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            iteration,
            verdict,
            confidence,
            concerns: Vec::new(),
            recommendations: Vec::new(),
            reasoning: String::new(),
        }
    }

    pub fn with_concerns(mut self, concerns: Vec<String>) -> Self {
        self.concerns = concerns;
        self
    }

    pub fn with_recommendations(mut self, recommendations: Vec<String>) -> Self {
        self.recommendations = recommendations;
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }
}

/// An error recorded during a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseError {
    pub phase: String,
    pub error_type: String,
    #[serde(alias = "error_message")]
    pub message: String,
    /// True when a retry of the phase could succeed.
    pub recoverable: bool,
}

impl PhaseError {
    pub fn new(
        phase: impl Into<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self {
            phase: phase.into(),
            error_type: error_type.into(),
            message: message.into(),
            recoverable,
        }
    }

    /// A required predecessor output was absent. Never recoverable.
    pub fn missing_dependency(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(phase, "MissingDependency", message, false)
    }
}
