//! Evaluation of the saved model on the held-out split.

use async_trait::async_trait;
use serde_json::json;
use std::time::Instant;
use tera::Context;
use tracing::{error, info};

use super::common::{
    f64_or_zero, failed_after_retry, float_list, float_map, generate_code, run_with_repair,
    string_list, CodeFilter, ANALYSIS_TEMPERATURE, CODE_TEMPERATURE,
};
use super::prompts::{render, EVALUATION_CODE, EVALUATION_SUMMARY, SYSTEM_ML_ANALYST};
use super::scripts::Script;
use crate::error::GraphError;
use crate::executor::{normalize_candidate, CandidateSummary};
use crate::graph::{Collaborators, PhaseHandler, PhaseName};
use crate::state::{
    EvaluationMetrics, ModelArtifact, OverfittingRisk, Phase, PhaseError, RunState, StateDelta,
};

const PHASE: &str = "evaluation";
const REMINDER: &str = "best_model, X_test, y_test, X_train, y_train and eval_dir are ALREADY LOADED. \
Do NOT use joblib.load(), pd.read_csv() or plt.show().";

/// The candidate record of the chosen model, else the first one.
fn best_candidate(model: &ModelArtifact) -> Option<CandidateSummary> {
    let candidates: Vec<CandidateSummary> = model.candidates.iter().map(normalize_candidate).collect();
    let position = candidates
        .iter()
        .position(|c| c.name == model.best_model_name)
        .unwrap_or(0);
    candidates.into_iter().nth(position)
}

#[derive(Debug, Default)]
pub struct Evaluator;

impl Evaluator {
    pub fn new() -> Self {
        Self
    }

    async fn evaluate(
        &self,
        state: &RunState,
        model: &ModelArtifact,
        ctx: &Collaborators,
    ) -> Result<StateDelta, GraphError> {
        let delta = StateDelta::entering(Phase::Evaluation);
        let best = best_candidate(model);
        let training_metrics = json!({
            "cv_mean": best.as_ref().and_then(|c| c.cv_mean).unwrap_or(0.0),
            "train_score": best.as_ref().and_then(|c| c.train_score).unwrap_or(0.0),
            "val_score": best.as_ref().and_then(|c| c.val_score).unwrap_or(0.0),
        });

        let mut context = Context::new();
        context.insert("objective", &state.objective);
        context.insert("task_type", &model.task_type.to_string());
        context.insert("best_model_name", &model.best_model_name);
        context.insert("training_metrics", &training_metrics.to_string());
        let prompt = render(EVALUATION_CODE, &context)?;

        let code = generate_code(ctx, &prompt, CODE_TEMPERATURE, CodeFilter::Evaluation).await?;
        let attempt = run_with_repair(
            ctx,
            state,
            Script::Evaluation,
            code,
            CodeFilter::Evaluation,
            "evaluation code",
            REMINDER,
        )
        .await?;

        if !attempt.result.success {
            error!(run_id = %state.run_id, "Evaluation failed after retry");
            return Ok(delta.with_error(failed_after_retry(PHASE, "Evaluation", &attempt.result)));
        }

        let payload = attempt.payload();
        let gap = f64_or_zero(&payload, "train_score") - f64_or_zero(&payload, "test_score");
        let mut metrics = EvaluationMetrics {
            cv_scores: float_list(payload.get("cv_scores")),
            cv_mean: f64_or_zero(&payload, "cv_mean"),
            cv_std: f64_or_zero(&payload, "cv_std"),
            test_metrics: float_map(payload.get("test_metrics")),
            train_test_gap: (gap * 10_000.0).round() / 10_000.0,
            overfitting_risk: OverfittingRisk::from_gap(gap),
            evaluation_code: attempt.code,
            plot_paths: string_list(payload.get("plot_paths")),
            summary: String::new(),
        };

        let mut context = Context::new();
        context.insert("objective", &state.objective);
        context.insert(
            "metrics",
            &json!({
                "test_metrics": metrics.test_metrics,
                "cv_mean": metrics.cv_mean,
                "cv_std": metrics.cv_std,
                "train_test_gap": metrics.train_test_gap,
                "overfitting_risk": metrics.overfitting_risk,
            })
            .to_string(),
        );
        let prompt = render(EVALUATION_SUMMARY, &context)?;
        metrics.summary = ctx
            .client
            .generate(&prompt, Some(SYSTEM_ML_ANALYST), ANALYSIS_TEMPERATURE)
            .await?;

        info!(
            run_id = %state.run_id,
            cv_mean = metrics.cv_mean,
            gap = metrics.train_test_gap,
            risk = %metrics.overfitting_risk,
            "Evaluation complete"
        );
        Ok(delta.with_evaluation(metrics))
    }
}

#[async_trait]
impl PhaseHandler for Evaluator {
    fn name(&self) -> PhaseName {
        PhaseName::Evaluator
    }

    async fn run(&self, state: &RunState, ctx: &Collaborators) -> Result<StateDelta, GraphError> {
        let (Some(model), Some(_)) = (&state.model, &state.data_profile) else {
            return Ok(StateDelta::entering(Phase::Evaluation).with_error(
                PhaseError::missing_dependency(PHASE, "Model or profile not available"),
            ));
        };

        let started = Instant::now();
        match self.evaluate(state, model, ctx).await {
            Ok(delta) if delta.evaluation.is_some() => {
                Ok(delta.with_timing(PHASE, started.elapsed().as_secs_f64()))
            }
            Ok(delta) => Ok(delta),
            Err(e) => {
                error!(run_id = %state.run_id, error = %e, "Evaluation error");
                Ok(StateDelta::entering(Phase::Evaluation)
                    .with_error(PhaseError::new(PHASE, e.type_name(), e.to_string(), true)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::common::testing::*;
    use crate::state::{DataProfile, TaskType};
    use std::sync::Arc;

    fn trained() -> RunState {
        let mut state = state();
        let model = ModelArtifact {
            best_model_name: "GradientBoosting".to_string(),
            task_type: TaskType::Classification,
            candidates: vec![
                json!({"name": "LogReg", "cv_mean": 0.7}),
                json!({"model_name": "GradientBoosting", "cv_score": "0.81", "train_score": 0.9}),
            ],
            ..Default::default()
        };
        state
            .apply(StateDelta::default().with_profile(DataProfile::default()).with_model(model))
            .unwrap();
        state
    }

    #[test]
    fn test_best_candidate_matches_name_or_first() {
        let state = trained();
        let model = state.model.unwrap();
        let best = best_candidate(&model).unwrap();
        assert_eq!(best.name, "GradientBoosting");
        assert_eq!(best.cv_mean, Some(0.81));

        let other = ModelArtifact {
            best_model_name: "Missing".to_string(),
            ..model
        };
        assert_eq!(best_candidate(&other).unwrap().name, "LogReg");
        assert!(best_candidate(&ModelArtifact::default()).is_none());
    }

    #[tokio::test]
    async fn test_metrics_and_overfitting_risk() {
        let client = Arc::new(ScriptedClient::new(&[
            "best_model = joblib.load('best_model.joblib')\nprint(report)",
            "Good model, moderate overfitting.",
        ]));
        let payload = r#"{"cv_scores": [0.8, 0.82], "cv_mean": 0.81, "cv_std": 0.01, "test_metrics": {"accuracy": 0.8, "f1": 0.78}, "train_score": 0.9, "test_score": 0.8, "plot_paths": ["eval_plots/cm.png"]}"#;
        let sandbox = Arc::new(ScriptedSandbox::new(vec![ok(payload)]));
        let delta = Evaluator::new()
            .run(&trained(), &collaborators(client.clone(), sandbox))
            .await
            .unwrap();

        let eval = delta.evaluation.unwrap();
        assert_eq!(eval.cv_scores, vec![0.8, 0.82]);
        assert_eq!(eval.test_metrics["f1"], 0.78);
        assert_eq!(eval.train_test_gap, 0.1);
        assert_eq!(eval.overfitting_risk, OverfittingRisk::Moderate);
        assert_eq!(eval.summary, "Good model, moderate overfitting.");
        assert!(eval.evaluation_code.contains("pass  # removed (model already loaded)"));
        assert!(delta.timings.contains_key("evaluation"));

        let prompts = client.prompts.lock().unwrap();
        assert!(prompts[0].contains("\"cv_mean\":0.81"));
        assert!(prompts[1].contains("\"overfitting_risk\":\"moderate\""));
    }

    #[tokio::test]
    async fn test_missing_model() {
        let client = Arc::new(ScriptedClient::new(&[]));
        let sandbox = Arc::new(ScriptedSandbox::new(vec![]));
        let delta = Evaluator::new()
            .run(&state(), &collaborators(client, sandbox.clone()))
            .await
            .unwrap();
        assert_eq!(delta.errors[0].message, "Model or profile not available");
        assert!(!delta.errors[0].recoverable);
        assert_eq!(sandbox.calls(), 0);
    }
}
