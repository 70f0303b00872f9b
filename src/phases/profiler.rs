//! Data profiling: schema, missing values, distributions, correlations and
//! a target/task guess, followed by an LLM read of the profile.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Instant;
use tera::Context;
use tracing::{error, info};

use super::common::{as_f64, ANALYSIS_TEMPERATURE};
use super::prompts::{render, DATA_PROFILE_ANALYSIS, SYSTEM_ML_ANALYST};
use super::scripts::Script;
use crate::error::GraphError;
use crate::graph::{Collaborators, PhaseHandler, PhaseName};
use crate::state::{DataProfile, Phase, PhaseError, RunState, StateDelta};
use crate::utils::parse_last_json_line;

const PHASE: &str = "data_profiling";

#[derive(Debug, Default)]
pub struct DataProfiler;

impl DataProfiler {
    pub fn new() -> Self {
        Self
    }

    async fn profile(&self, state: &RunState, ctx: &Collaborators) -> Result<StateDelta, GraphError> {
        let delta = StateDelta::entering(Phase::DataProfiling);
        let result = ctx.sandbox.execute(Script::Profile.request(state, "")).await;
        if result.failed() {
            error!(
                run_id = %state.run_id,
                error = result.error_message.as_deref().unwrap_or("unknown"),
                "Profiling script failed"
            );
            return Ok(delta.with_error(PhaseError::new(
                PHASE,
                result.error_type.as_deref().unwrap_or("ExecutionError"),
                result.error_message.as_deref().unwrap_or("Unknown error"),
                false,
            )));
        }

        let payload = parse_last_json_line(&result.stdout).ok_or_else(|| GraphError::Handler {
            phase: PHASE.to_string(),
            message: "profiling script printed no JSON result".to_string(),
        })?;
        let mut profile: DataProfile = serde_json::from_value(payload)?;

        let mut context = Context::new();
        context.insert("objective", &state.objective);
        context.insert("shape", &format!("{:?}", profile.shape));
        context.insert("dtypes", &serde_json::to_string_pretty(&profile.dtypes)?);
        context.insert("missing_counts", &serde_json::to_string_pretty(&profile.missing_counts)?);
        context.insert("numeric_stats", &serde_json::to_string_pretty(&headline_stats(&profile))?);
        context.insert("categorical_stats", &serde_json::to_string_pretty(&top_categories(&profile))?);
        let prompt = render(DATA_PROFILE_ANALYSIS, &context)?;

        profile.key_findings = ctx
            .client
            .generate(&prompt, Some(SYSTEM_ML_ANALYST), ANALYSIS_TEMPERATURE)
            .await?;

        info!(
            run_id = %state.run_id,
            shape = ?profile.shape,
            task_type = %profile.task_type,
            target = profile.target_column.as_deref().unwrap_or("-"),
            "Data profiling complete"
        );
        Ok(delta.with_profile(profile))
    }
}

/// Mean, std, min and max per numeric column.
fn headline_stats(profile: &DataProfile) -> Value {
    let mut out = Map::new();
    for (column, stats) in &profile.numeric_stats {
        let mut kept = Map::new();
        for key in ["mean", "std", "min", "max"] {
            if let Some(v) = as_f64(stats.get(key)) {
                kept.insert(key.to_string(), json!(v));
            }
        }
        out.insert(column.clone(), Value::Object(kept));
    }
    Value::Object(out)
}

/// The five most frequent values per categorical column.
fn top_categories(profile: &DataProfile) -> Value {
    let mut out = Map::new();
    for (column, counts) in &profile.categorical_stats {
        let mut ranked: Vec<(&String, f64)> = counts
            .as_object()
            .map(|o| o.iter().filter_map(|(k, v)| as_f64(Some(v)).map(|n| (k, n))).collect())
            .unwrap_or_default();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        let top: Map<String, Value> = ranked
            .into_iter()
            .take(5)
            .map(|(k, n)| (k.clone(), json!(n)))
            .collect();
        out.insert(column.clone(), Value::Object(top));
    }
    Value::Object(out)
}

#[async_trait]
impl PhaseHandler for DataProfiler {
    fn name(&self) -> PhaseName {
        PhaseName::DataProfiler
    }

    async fn run(&self, state: &RunState, ctx: &Collaborators) -> Result<StateDelta, GraphError> {
        let started = Instant::now();
        match self.profile(state, ctx).await {
            Ok(delta) if delta.data_profile.is_some() => {
                Ok(delta.with_timing(PHASE, started.elapsed().as_secs_f64()))
            }
            Ok(delta) => Ok(delta),
            Err(e) => {
                error!(run_id = %state.run_id, error = %e, "Data profiling error");
                Ok(StateDelta::entering(Phase::DataProfiling).with_error(PhaseError::new(
                    PHASE,
                    e.type_name(),
                    e.to_string(),
                    false,
                )))
            }
        }
    }
}
