//! Feature engineering: generated pandas code derives new columns from the
//! raw data, then a structured review checks them for leakage.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Instant;
use tera::Context;
use tracing::{error, info, warn};

use super::common::{
    critic_feedback, failed_after_retry, generate_code, run_with_repair, string_list, u64_list,
    CodeFilter, CODE_TEMPERATURE, REPAIR_TEMPERATURE,
};
use super::prompts::{render, FEATURE_ENGINEERING_CODE, FEATURE_VALIDATION, SYSTEM_ML_ANALYST};
use super::scripts::Script;
use crate::error::GraphError;
use crate::graph::{Collaborators, PhaseHandler, PhaseName};
use crate::state::{
    DataProfile, FeatureArtifact, FeatureEngineering, Phase, PhaseError, RunState, StateDelta,
    Verdict,
};
use crate::utils::truncate_chars;

const PHASE: &str = "feature_engineering";

fn validation_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "leakage_risks": {"type": "array", "items": {"type": "string"}},
            "quality_issues": {"type": "array", "items": {"type": "string"}},
            "recommendations": {"type": "array", "items": {"type": "string"}},
            "approved": {"type": "boolean"}
        },
        "required": ["leakage_risks", "quality_issues", "recommendations", "approved"]
    })
}

#[derive(Debug, Default)]
pub struct FeatureEngineer;

impl FeatureEngineer {
    pub fn new() -> Self {
        Self
    }

    async fn engineer(
        &self,
        state: &RunState,
        profile: &DataProfile,
        ctx: &Collaborators,
    ) -> Result<StateDelta, GraphError> {
        let delta = StateDelta::entering(Phase::FeatureEngineering);

        let mut context = Context::new();
        context.insert("objective", &state.objective);
        context.insert("profile_summary", &truncate_chars(&profile.key_findings, 500));
        context.insert("dtypes", &serde_json::to_string(&profile.dtypes)?);
        context.insert("shape", &format!("{:?}", profile.shape));
        context.insert(
            "critic_feedback",
            &critic_feedback(state, Verdict::RefineFeatures, "feature engineering"),
        );
        let prompt = render(FEATURE_ENGINEERING_CODE, &context)?;

        let code = generate_code(ctx, &prompt, CODE_TEMPERATURE, CodeFilter::None).await?;
        let attempt = run_with_repair(
            ctx,
            state,
            Script::Features,
            code,
            CodeFilter::None,
            "feature engineering code",
            "",
        )
        .await?;

        if !attempt.result.success {
            error!(run_id = %state.run_id, "Feature engineering failed after retry");
            return Ok(delta.with_error(failed_after_retry(PHASE, "Feature code", &attempt.result)));
        }

        let payload = attempt.payload();
        let new_columns = string_list(payload.get("new_columns"));
        let new_dtypes = payload.get("new_dtypes").and_then(Value::as_object);
        let features = new_columns
            .iter()
            .map(|name| FeatureArtifact {
                name: name.clone(),
                dtype: new_dtypes
                    .and_then(|d| d.get(name))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                ..Default::default()
            })
            .collect();

        let (validation_passed, validation_notes) =
            self.review(state, profile, &new_columns, &attempt.code, ctx).await;

        let engineering = FeatureEngineering {
            features,
            code_executed: attempt.code,
            new_columns,
            dropped_columns: string_list(payload.get("dropped_columns")),
            new_shape: u64_list(payload.get("new_shape")),
            validation_passed,
            validation_notes,
        };

        info!(
            run_id = %state.run_id,
            new_features = engineering.new_columns.len(),
            dropped = engineering.dropped_columns.len(),
            approved = validation_passed,
            repaired = attempt.repaired,
            "Feature engineering complete"
        );
        Ok(delta.with_features(engineering))
    }

    /// Leakage and quality review of the new columns. A failed review call
    /// leaves the features unapproved rather than failing the phase.
    async fn review(
        &self,
        state: &RunState,
        profile: &DataProfile,
        new_columns: &[String],
        code: &str,
        ctx: &Collaborators,
    ) -> (bool, String) {
        let prompt = match self.review_prompt(state, profile, new_columns, code) {
            Ok(prompt) => prompt,
            Err(e) => return (false, format!("Validation unavailable: {}", e)),
        };
        match ctx
            .client
            .generate_structured(&prompt, Some(SYSTEM_ML_ANALYST), &validation_schema(), REPAIR_TEMPERATURE)
            .await
        {
            Ok(review) => {
                let notes = json!({
                    "leakage_risks": string_list(review.get("leakage_risks")),
                    "quality_issues": string_list(review.get("quality_issues")),
                    "recommendations": string_list(review.get("recommendations")),
                });
                let approved = review.get("approved").and_then(Value::as_bool).unwrap_or(true);
                (approved, notes.to_string())
            }
            Err(e) => {
                warn!(run_id = %state.run_id, error = %e, "Feature review failed");
                (false, format!("Validation unavailable: {}", e))
            }
        }
    }

    fn review_prompt(
        &self,
        state: &RunState,
        profile: &DataProfile,
        new_columns: &[String],
        code: &str,
    ) -> Result<String, GraphError> {
        let original: Vec<&String> = profile.dtypes.keys().collect();
        let mut context = Context::new();
        context.insert("objective", &state.objective);
        context.insert("original_columns", &serde_json::to_string(&original)?);
        context.insert("new_features", &serde_json::to_string(new_columns)?);
        context.insert("feature_code", &truncate_chars(code, 3000));
        render(FEATURE_VALIDATION, &context)
    }
}

#[async_trait]
impl PhaseHandler for FeatureEngineer {
    fn name(&self) -> PhaseName {
        PhaseName::FeatureEngineer
    }

    async fn run(&self, state: &RunState, ctx: &Collaborators) -> Result<StateDelta, GraphError> {
        let Some(profile) = &state.data_profile else {
            return Ok(StateDelta::entering(Phase::FeatureEngineering)
                .with_error(PhaseError::missing_dependency(PHASE, "Data profile not available")));
        };

        let started = Instant::now();
        match self.engineer(state, profile, ctx).await {
            Ok(delta) if delta.feature_engineering.is_some() => {
                Ok(delta.with_timing(PHASE, started.elapsed().as_secs_f64()))
            }
            Ok(delta) => Ok(delta),
            Err(e) => {
                error!(run_id = %state.run_id, error = %e, "Feature engineering error");
                Ok(StateDelta::entering(Phase::FeatureEngineering).with_error(PhaseError::new(
                    PHASE,
                    e.type_name(),
                    e.to_string(),
                    true,
                )))
            }
        }
    }
}
