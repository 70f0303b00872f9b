//! Model training: generated scikit-learn code fits several candidates on a
//! fixed split, picks one by cross-validation and saves it.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;
use tera::Context;
use tracing::{error, info};

use super::common::{
    critic_feedback, failed_after_retry, float_map, generate_code, run_with_repair, CodeFilter,
    CODE_TEMPERATURE,
};
use super::prompts::{render, MODEL_SELECTION_CODE};
use super::scripts::{Script, MODEL_FILE};
use crate::error::GraphError;
use crate::graph::{Collaborators, PhaseHandler, PhaseName};
use crate::state::{DataProfile, ModelArtifact, Phase, PhaseError, RunState, StateDelta, Verdict};
use crate::utils::truncate_chars;

const PHASE: &str = "model_training";
const REMINDER: &str = "X_train, X_test, y_train, y_test are ALREADY LOADED. \
Do NOT use pd.read_csv() or train_test_split().";

#[derive(Debug, Default)]
pub struct ModelTrainer;

impl ModelTrainer {
    pub fn new() -> Self {
        Self
    }

    async fn train(
        &self,
        state: &RunState,
        profile: &DataProfile,
        ctx: &Collaborators,
    ) -> Result<StateDelta, GraphError> {
        let delta = StateDelta::entering(Phase::ModelTraining);
        let target = profile.target_column.clone().unwrap_or_else(|| "target".to_string());
        let feature_columns: Vec<String> = profile
            .dtypes
            .keys()
            .filter(|c| **c != target)
            .cloned()
            .collect();
        let key_insights = state
            .visualizations
            .as_ref()
            .map(|v| truncate_chars(&v.key_insights, 500))
            .unwrap_or_default();

        let mut context = Context::new();
        context.insert("objective", &state.objective);
        context.insert("task_type", &profile.task_type.to_string());
        context.insert("target_column", &target);
        context.insert(
            "feature_columns",
            &serde_json::to_string(&feature_columns.iter().take(30).collect::<Vec<_>>())?,
        );
        context.insert("shape", &format!("{:?}", profile.shape));
        context.insert("key_insights", &key_insights);
        context.insert(
            "critic_feedback",
            &critic_feedback(state, Verdict::RetrainModel, "model training"),
        );
        let prompt = render(MODEL_SELECTION_CODE, &context)?;

        let code = generate_code(ctx, &prompt, CODE_TEMPERATURE, CodeFilter::Training).await?;
        let attempt = run_with_repair(
            ctx,
            state,
            Script::Training,
            code,
            CodeFilter::Training,
            "training code",
            REMINDER,
        )
        .await?;

        if !attempt.result.success {
            error!(run_id = %state.run_id, "Model training failed after retry");
            return Ok(delta.with_error(failed_after_retry(PHASE, "Training", &attempt.result)));
        }

        let payload = attempt.payload();
        let model = ModelArtifact {
            best_model_name: payload
                .get("best_model")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            task_type: profile.task_type,
            candidates: payload
                .get("candidates")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            best_hyperparams: payload
                .get("best_hyperparams")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default())),
            feature_importance: float_map(payload.get("feature_importance")),
            serialized_path: state.working_dir.join(MODEL_FILE).to_string_lossy().into_owned(),
            training_code: attempt.code,
            target_column: target,
            feature_columns,
        };

        info!(
            run_id = %state.run_id,
            best_model = %model.best_model_name,
            candidates = model.candidates.len(),
            repaired = attempt.repaired,
            "Model training complete"
        );
        Ok(delta.with_model(model))
    }
}

#[async_trait]
impl PhaseHandler for ModelTrainer {
    fn name(&self) -> PhaseName {
        PhaseName::ModelTrainer
    }

    async fn run(&self, state: &RunState, ctx: &Collaborators) -> Result<StateDelta, GraphError> {
        let Some(profile) = &state.data_profile else {
            return Ok(StateDelta::entering(Phase::ModelTraining)
                .with_error(PhaseError::missing_dependency(PHASE, "Data profile not available")));
        };

        let started = Instant::now();
        match self.train(state, profile, ctx).await {
            Ok(delta) if delta.model.is_some() => {
                Ok(delta.with_timing(PHASE, started.elapsed().as_secs_f64()))
            }
            Ok(delta) => Ok(delta),
            Err(e) => {
                error!(run_id = %state.run_id, error = %e, "Model training error");
                Ok(StateDelta::entering(Phase::ModelTraining)
                    .with_error(PhaseError::new(PHASE, e.type_name(), e.to_string(), true)))
            }
        }
    }
}
