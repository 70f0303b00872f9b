//! Exploratory plots. Generated plotting code is checked before it runs;
//! unusable code is replaced by a fixed set of plots, and a failed
//! visualization never blocks the run.

use async_trait::async_trait;
use std::path::Path;
use std::time::Instant;
use tera::Context;
use tracing::{error, info, warn};

use super::common::{generate_code, string_list, CodeFilter, ANALYSIS_TEMPERATURE, CODE_TEMPERATURE};
use super::prompts::{render, SYSTEM_ML_ANALYST, VISUALIZATION_CODE, VISUALIZATION_INTERPRETATION};
use super::scripts::{fallback_visualization, Script};
use crate::error::GraphError;
use crate::graph::{Collaborators, PhaseHandler, PhaseName};
use crate::sandbox::validate_code;
use crate::state::{
    DataProfile, Phase, PhaseError, PlotArtifact, RunState, StateDelta, VisualizationOutput,
};
use crate::utils::{parse_last_json_line, truncate_chars};

const PHASE: &str = "visualization";
const SKIPPED: &str = "Visualization generation failed; proceeding without.";

fn skipped() -> VisualizationOutput {
    VisualizationOutput {
        key_insights: SKIPPED.to_string(),
        ..Default::default()
    }
}

#[derive(Debug, Default)]
pub struct Visualizer;

impl Visualizer {
    pub fn new() -> Self {
        Self
    }

    async fn visualize(
        &self,
        state: &RunState,
        profile: &DataProfile,
        ctx: &Collaborators,
    ) -> Result<StateDelta, GraphError> {
        let delta = StateDelta::entering(Phase::Visualization);
        let target = profile.target_column.as_deref();

        let mut context = Context::new();
        context.insert("objective", &state.objective);
        context.insert("dtypes", &serde_json::to_string(&profile.dtypes)?);
        context.insert("shape", &format!("{:?}", profile.shape));
        context.insert("key_findings", &truncate_chars(&profile.key_findings, 800));
        let prompt = render(VISUALIZATION_CODE, &context)?;

        let mut code =
            generate_code(ctx, &prompt, CODE_TEMPERATURE, CodeFilter::Visualization).await?;
        let report = validate_code(&Script::Visualization.assemble(&code));
        if let Some(reason) = report.error {
            warn!(run_id = %state.run_id, reason = %reason, "Plot code rejected, using fallback plots");
            code = fallback_visualization(target);
        }

        let mut result = ctx.sandbox.execute(Script::Visualization.request(state, &code)).await;
        if !result.success {
            warn!(
                run_id = %state.run_id,
                error_type = result.error_type.as_deref().unwrap_or("unknown"),
                "Plot code failed, using fallback plots"
            );
            result = ctx
                .sandbox
                .execute(Script::Visualization.request(state, &fallback_visualization(target)))
                .await;
        }
        if !result.success {
            error!(run_id = %state.run_id, "Fallback plots failed");
            return Ok(delta
                .with_visualizations(skipped())
                .with_error(PhaseError::new(
                    PHASE,
                    result.error_type.as_deref().unwrap_or("ExecutionError"),
                    format!(
                        "Visualization failed: {}",
                        result.error_message.as_deref().unwrap_or("unknown error")
                    ),
                    true,
                )));
        }

        let plot_files = parse_last_json_line(&result.stdout)
            .map(|payload| string_list(payload.get("plot_files")))
            .unwrap_or_default();
        let plots: Vec<PlotArtifact> = plot_files
            .iter()
            .map(|file| PlotArtifact {
                title: Path::new(file)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.clone()),
                plot_type: "auto".to_string(),
                file_path: file.clone(),
                ..Default::default()
            })
            .collect();

        let narration: Vec<&str> = result
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('{'))
            .collect();
        let mut context = Context::new();
        context.insert("objective", &state.objective);
        context.insert(
            "plot_descriptions",
            &if narration.is_empty() {
                "Plots generated.".to_string()
            } else {
                narration.join("\n")
            },
        );
        let prompt = render(VISUALIZATION_INTERPRETATION, &context)?;
        let key_insights = ctx
            .client
            .generate(&prompt, Some(SYSTEM_ML_ANALYST), ANALYSIS_TEMPERATURE)
            .await?;

        info!(run_id = %state.run_id, plots = plots.len(), "Visualization complete");
        Ok(delta.with_visualizations(VisualizationOutput {
            plots,
            key_insights,
            ..Default::default()
        }))
    }
}

#[async_trait]
impl PhaseHandler for Visualizer {
    fn name(&self) -> PhaseName {
        PhaseName::Visualizer
    }

    async fn run(&self, state: &RunState, ctx: &Collaborators) -> Result<StateDelta, GraphError> {
        let Some(profile) = &state.data_profile else {
            return Ok(StateDelta::entering(Phase::Visualization)
                .with_error(PhaseError::missing_dependency(PHASE, "Data profile not available")));
        };

        let started = Instant::now();
        match self.visualize(state, profile, ctx).await {
            Ok(delta) if delta.errors.is_empty() => {
                Ok(delta.with_timing(PHASE, started.elapsed().as_secs_f64()))
            }
            Ok(delta) => Ok(delta),
            Err(e) => {
                error!(run_id = %state.run_id, error = %e, "Visualization error");
                Ok(StateDelta::entering(Phase::Visualization)
                    .with_visualizations(skipped())
                    .with_error(PhaseError::new(PHASE, e.type_name(), e.to_string(), true)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::common::testing::*;
    use std::sync::Arc;

    fn profiled() -> RunState {
        let mut state = state();
        let profile = DataProfile {
            shape: vec![10, 3],
            target_column: Some("churn".to_string()),
            ..Default::default()
        };
        state.apply(StateDelta::default().with_profile(profile)).unwrap();
        state
    }

    const PLOTS: &str = "Plot 1: churn by plan\n{\"plot_files\": [\"/tmp/run-1/plots/plot_01_churn.png\"], \"plot_count\": 1}";

    #[tokio::test]
    async fn test_plots_and_interpretation() {
        let client = Arc::new(ScriptedClient::new(&[
            "sns.countplot(data=df, x='churn')\nplt.show()",
            "Churn is imbalanced.",
        ]));
        let sandbox = Arc::new(ScriptedSandbox::new(vec![ok(PLOTS)]));
        let delta = Visualizer::new()
            .run(&profiled(), &collaborators(client.clone(), sandbox.clone()))
            .await
            .unwrap();

        let viz = delta.visualizations.unwrap();
        assert_eq!(viz.plots.len(), 1);
        assert_eq!(viz.plots[0].title, "plot_01_churn");
        assert_eq!(viz.plots[0].plot_type, "auto");
        assert_eq!(viz.key_insights, "Churn is imbalanced.");
        assert!(delta.timings.contains_key("visualization"));

        let code = &sandbox.requests.lock().unwrap()[0].code;
        assert!(code.contains("pass  # removed (no display): plt.show()"));
        assert!(client.prompts.lock().unwrap()[1].contains("Plot 1: churn by plan"));
    }

    #[tokio::test]
    async fn test_rejected_code_replaced_before_running() {
        let client = Arc::new(ScriptedClient::new(&["import subprocess\nsubprocess.run(['ls'])", "ok"]));
        let sandbox = Arc::new(ScriptedSandbox::new(vec![ok(PLOTS)]));
        Visualizer::new()
            .run(&profiled(), &collaborators(client, sandbox.clone()))
            .await
            .unwrap();

        let requests = sandbox.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].code.contains("subprocess"));
        assert!(requests[0].code.contains("target = 'churn'"));
    }

    #[tokio::test]
    async fn test_double_failure_is_recoverable() {
        let client = Arc::new(ScriptedClient::new(&["sns.barplot(data=df)"]));
        let sandbox = Arc::new(ScriptedSandbox::new(vec![
            crashed("ValueError: bad plot"),
            crashed("ModuleNotFoundError: No module named 'seaborn'"),
        ]));
        let delta = Visualizer::new()
            .run(&profiled(), &collaborators(client, sandbox.clone()))
            .await
            .unwrap();

        assert_eq!(sandbox.calls(), 2);
        let viz = delta.visualizations.unwrap();
        assert!(viz.plots.is_empty());
        assert_eq!(viz.key_insights, SKIPPED);
        assert!(delta.errors[0].recoverable);
        assert_eq!(delta.errors[0].error_type, "ModuleNotFoundError");
        assert!(delta.timings.is_empty());
    }

    #[tokio::test]
    async fn test_missing_profile() {
        let client = Arc::new(ScriptedClient::new(&[]));
        let sandbox = Arc::new(ScriptedSandbox::new(vec![]));
        let delta = Visualizer::new()
            .run(&state(), &collaborators(client, sandbox))
            .await
            .unwrap();
        assert_eq!(delta.errors[0].error_type, "MissingDependency");
        assert!(delta.visualizations.is_none());
    }
}
