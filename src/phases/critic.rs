//! Review of the whole run: finalize, or send the run back to feature
//! engineering or model training.
//!
//! The verdict the reviewer asked for is recorded as given. A non-final
//! verdict advances the loop counter, never past the ceiling; the router
//! ends the run once the ceiling is reached.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Instant;
use tera::Context;
use tracing::{error, info};

use super::common::{as_f64, string_list, REPAIR_TEMPERATURE};
use super::prompts::{render, CRITIC_REVIEW, SYSTEM_CRITIC};
use crate::error::GraphError;
use crate::executor::summary::{
    EvaluationSummary, FeatureSummary, ModelSummary, ProfileSummary, VisualizationSummary,
};
use crate::graph::{Collaborators, PhaseHandler, PhaseName};
use crate::metrics::MetricsCollector;
use crate::state::{Phase, PhaseError, ReviewDecision, RunState, StateDelta, Verdict};

const PHASE: &str = "critic_review";
const DEFAULT_CONFIDENCE: f64 = 0.5;

fn decision_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "overall_assessment": {"type": "string", "enum": ["finalize", "refine_features", "retrain_model"]},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "concerns": {"type": "array", "items": {"type": "string"}},
            "recommendations": {"type": "array", "items": {"type": "string"}},
            "reasoning": {"type": "string"}
        },
        "required": ["overall_assessment", "confidence", "concerns", "recommendations", "reasoning"]
    })
}

/// JSON of an optional summary, or `missing`.
fn describe<T: serde::Serialize>(summary: Option<T>, missing: &str) -> Result<String, GraphError> {
    match summary {
        Some(s) => Ok(serde_json::to_string(&s)?),
        None => Ok(missing.to_string()),
    }
}

#[derive(Debug, Default)]
pub struct Critic {
    metrics: MetricsCollector,
}

impl Critic {
    pub fn new() -> Self {
        Self::default()
    }

    fn prompt(&self, state: &RunState, iteration: u32) -> Result<String, GraphError> {
        let previous: Vec<Value> = state
            .review_decisions
            .iter()
            .map(|d| {
                json!({
                    "iteration": d.iteration,
                    "overall_assessment": d.verdict,
                    "concerns": d.concerns,
                })
            })
            .collect();
        let errors: Vec<String> = state
            .errors
            .iter()
            .map(|e| format!("{}: {}: {}", e.phase, e.error_type, e.message))
            .collect();

        let mut context = Context::new();
        context.insert("objective", &state.objective);
        context.insert(
            "profile_summary",
            &describe(state.data_profile.as_ref().map(ProfileSummary::from), "Not available")?,
        );
        context.insert(
            "features_summary",
            &describe(state.feature_engineering.as_ref().map(FeatureSummary::from), "None")?,
        );
        context.insert(
            "viz_insights",
            &describe(state.visualizations.as_ref().map(VisualizationSummary::from), "None")?,
        );
        context.insert(
            "model_summary",
            &describe(state.model.as_ref().map(ModelSummary::from), "No model trained")?,
        );
        context.insert(
            "eval_metrics",
            &describe(state.evaluation.as_ref().map(EvaluationSummary::from), "No evaluation")?,
        );
        context.insert(
            "errors",
            &if errors.is_empty() {
                "None".to_string()
            } else {
                serde_json::to_string(&errors)?
            },
        );
        context.insert("iteration", &iteration);
        context.insert("max_loops", &state.max_loops);
        context.insert("previous_decisions", &serde_json::to_string(&previous)?);
        render(CRITIC_REVIEW, &context)
    }

    /// Asks the client for a decision. The flag is true when the client
    /// asked for another loop, even if the ceiling turned it into a
    /// finalize.
    async fn review(
        &self,
        state: &RunState,
        iteration: u32,
        ctx: &Collaborators,
    ) -> Result<(ReviewDecision, bool), GraphError> {
        let prompt = self.prompt(state, iteration)?;
        let raw = ctx
            .client
            .generate_structured(&prompt, Some(SYSTEM_CRITIC), &decision_schema(), REPAIR_TEMPERATURE)
            .await?;

        let requested = raw
            .get("overall_assessment")
            .and_then(Value::as_str)
            .map(Verdict::parse_lenient)
            .unwrap_or(Verdict::Finalize);
        let mut verdict = requested;
        let mut concerns = string_list(raw.get("concerns"));
        if !requested.is_terminal() && state.loop_count + 1 >= state.max_loops {
            info!(
                run_id = %state.run_id,
                requested = %requested,
                loop_count = state.loop_count + 1,
                "Max loops reached, forcing finalization"
            );
            concerns.push(format!(
                "Forced finalization: reached max loop limit ({})",
                state.max_loops
            ));
            verdict = Verdict::Finalize;
        }

        let decision = ReviewDecision::new(
            iteration,
            verdict,
            as_f64(raw.get("confidence")).unwrap_or(DEFAULT_CONFIDENCE),
        )
        .with_concerns(concerns)
        .with_recommendations(string_list(raw.get("recommendations")))
        .with_reasoning(raw.get("reasoning").and_then(Value::as_str).unwrap_or_default());
        Ok((decision, !requested.is_terminal()))
    }
}

#[async_trait]
impl PhaseHandler for Critic {
    fn name(&self) -> PhaseName {
        PhaseName::Critic
    }

    async fn run(&self, state: &RunState, ctx: &Collaborators) -> Result<StateDelta, GraphError> {
        let started = Instant::now();
        let iteration = state.review_decisions.len() as u32 + 1;
        let delta = StateDelta::entering(Phase::CriticReview);

        let (decision, revisit) = match self.review(state, iteration, ctx).await {
            Ok(reviewed) => reviewed,
            Err(e) => {
                error!(run_id = %state.run_id, error = %e, "Critic review failed");
                let fallback = ReviewDecision::new(iteration, Verdict::Finalize, 0.0)
                    .with_concerns(vec![format!("Critic failed: {}", e)])
                    .with_recommendations(vec!["Manual review required".to_string()]);
                self.metrics.record_verdict(fallback.verdict.as_str());
                return Ok(delta
                    .with_decision(fallback)
                    .with_error(PhaseError::new(PHASE, e.type_name(), e.to_string(), false)));
            }
        };

        let loop_count = if revisit {
            (state.loop_count + 1).min(state.max_loops)
        } else {
            state.loop_count
        };

        info!(
            run_id = %state.run_id,
            iteration = iteration,
            verdict = %decision.verdict,
            confidence = decision.confidence,
            loop_count = loop_count,
            max_loops = state.max_loops,
            "Critic decision"
        );
        self.metrics.record_verdict(decision.verdict.as_str());

        Ok(delta
            .with_loop_count(loop_count)
            .with_decision(decision)
            .with_timing(format!("{}_{}", PHASE, iteration), started.elapsed().as_secs_f64()))
    }
}
