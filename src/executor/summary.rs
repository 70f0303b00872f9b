//! Bounded per-phase summaries shown in run status.
//!
//! Phase outputs can be large (full code, every plot, raw candidate
//! records). Status only carries a fixed subset with long text truncated
//! and model candidates normalized to one set of keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::state::{
    DataProfile, EvaluationMetrics, FeatureEngineering, ModelArtifact, OverfittingRisk,
    ReviewDecision, RunState, TaskType, Verdict, VisualizationOutput,
};
use crate::utils::truncate_chars;

const FINDINGS_LIMIT: usize = 500;
const REASONING_LIMIT: usize = 200;
const TOP_FEATURES: usize = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub shape: Vec<u64>,
    pub task_type: TaskType,
    pub target_column: Option<String>,
    pub key_findings: String,
}

impl From<&DataProfile> for ProfileSummary {
    fn from(p: &DataProfile) -> Self {
        Self {
            shape: p.shape.clone(),
            task_type: p.task_type,
            target_column: p.target_column.clone(),
            key_findings: truncate_chars(&p.key_findings, FINDINGS_LIMIT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub new_columns: Vec<String>,
    pub new_shape: Vec<u64>,
    pub validation_passed: bool,
}

impl From<&FeatureEngineering> for FeatureSummary {
    fn from(f: &FeatureEngineering) -> Self {
        Self {
            new_columns: f.new_columns.clone(),
            new_shape: f.new_shape.clone(),
            validation_passed: f.validation_passed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationSummary {
    pub plot_count: usize,
    pub plot_paths: Vec<String>,
    pub key_insights: String,
}

impl From<&VisualizationOutput> for VisualizationSummary {
    fn from(v: &VisualizationOutput) -> Self {
        Self {
            plot_count: v.plots.len(),
            plot_paths: v
                .plots
                .iter()
                .map(|p| p.file_path.clone())
                .filter(|p| !p.is_empty())
                .collect(),
            key_insights: truncate_chars(&v.key_insights, FINDINGS_LIMIT),
        }
    }
}

/// A model candidate with its metrics under fixed names.
///
/// Missing metrics are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub name: String,
    pub accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
    pub cv_mean: Option<f64>,
    pub cv_std: Option<f64>,
    pub train_score: Option<f64>,
    pub val_score: Option<f64>,
}

/// First non-null value among `keys`, in order.
fn first_present<'a>(candidate: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| candidate.get(*k))
        .find(|v| !v.is_null())
}

fn as_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Maps a raw candidate record onto [`CandidateSummary`].
///
/// Each metric is read from the first alias present; accuracy falls back to
/// the validation score, then the cross-validation mean.
pub fn normalize_candidate(candidate: &Value) -> CandidateSummary {
    let metric = |keys: &[&str]| as_number(first_present(candidate, keys));

    let cv_mean = metric(&["cv_mean", "cv_score", "mean_cv_score", "cross_val_mean"]);
    let val_score = metric(&["val_score", "test_score"]);
    let accuracy = metric(&["accuracy", "test_accuracy", "acc"])
        .or(val_score)
        .or(cv_mean);

    let name = match first_present(candidate, &["name", "model_name", "algorithm", "model"]) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::String(_)) | None => "Unknown".to_string(),
        Some(other) => other.to_string(),
    };

    CandidateSummary {
        name,
        accuracy,
        precision: metric(&["precision", "precision_macro", "precision_weighted", "test_precision"]),
        recall: metric(&["recall", "recall_macro", "recall_weighted", "test_recall"]),
        f1: metric(&["f1", "f1_macro", "f1_weighted", "f1_score", "test_f1"]),
        cv_mean,
        cv_std: metric(&["cv_std", "cv_std_dev"]),
        train_score: metric(&["train_score", "train_accuracy"]),
        val_score,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub best_model_name: String,
    pub task_type: TaskType,
    pub candidates: Vec<CandidateSummary>,
    /// The most important features.
    pub feature_importance: BTreeMap<String, f64>,
}

impl From<&ModelArtifact> for ModelSummary {
    fn from(m: &ModelArtifact) -> Self {
        let mut ranked: Vec<(&String, &f64)> = m.feature_importance.iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(a.1));

        Self {
            best_model_name: if m.best_model_name.is_empty() {
                "unknown".to_string()
            } else {
                m.best_model_name.clone()
            },
            task_type: m.task_type,
            candidates: m.candidates.iter().map(normalize_candidate).collect(),
            feature_importance: ranked
                .into_iter()
                .take(TOP_FEATURES)
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub cv_mean: f64,
    pub cv_std: f64,
    pub test_metrics: BTreeMap<String, f64>,
    pub overfitting_risk: OverfittingRisk,
    pub summary: String,
}

impl From<&EvaluationMetrics> for EvaluationSummary {
    fn from(e: &EvaluationMetrics) -> Self {
        Self {
            cv_mean: e.cv_mean,
            cv_std: e.cv_std,
            test_metrics: e.test_metrics.clone(),
            overfitting_risk: e.overfitting_risk,
            summary: truncate_chars(&e.summary, FINDINGS_LIMIT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSummary {
    pub iteration: u32,
    pub assessment: Verdict,
    pub confidence: f64,
    pub reasoning: String,
}

impl From<&ReviewDecision> for DecisionSummary {
    fn from(d: &ReviewDecision) -> Self {
        Self {
            iteration: d.iteration,
            assessment: d.verdict,
            confidence: d.confidence,
            reasoning: truncate_chars(&d.reasoning, REASONING_LIMIT),
        }
    }
}

/// Summaries of every phase that has produced output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummaries {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_profile: Option<ProfileSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_engineering: Option<FeatureSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualizations: Option<VisualizationSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub critic_decisions: Vec<DecisionSummary>,
}

impl PhaseSummaries {
    pub fn from_state(state: &RunState) -> Self {
        Self {
            data_profile: state.data_profile.as_ref().map(Into::into),
            feature_engineering: state.feature_engineering.as_ref().map(Into::into),
            visualizations: state.visualizations.as_ref().map(Into::into),
            model: state.model.as_ref().map(Into::into),
            evaluation: state.evaluation.as_ref().map(Into::into),
            critic_decisions: state.review_decisions.iter().map(Into::into).collect(),
        }
    }
}
