//! The conditional edge after a review pass.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::phase::PhaseName;
use crate::state::{RunState, Verdict};

/// Where the graph goes after the critic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "route", content = "phase")]
pub enum Route {
    Terminal,
    Goto(PhaseName),
}

impl Route {
    pub fn target(&self) -> Option<PhaseName> {
        match self {
            Route::Terminal => None,
            Route::Goto(phase) => Some(*phase),
        }
    }
}

/// Decides the successor of a review pass from the latest decision.
///
/// The loop ceiling is checked here as well as in the critic, so a decision
/// recorded by any handler cannot drive the graph past it.
pub fn route_after_review(state: &RunState) -> Route {
    let Some(latest) = state.latest_decision() else {
        info!(run_id = %state.run_id, "No review decisions recorded, finalizing");
        return Route::Terminal;
    };

    if state.loop_count >= state.max_loops {
        info!(
            run_id = %state.run_id,
            loop_count = state.loop_count,
            max_loops = state.max_loops,
            "Loop ceiling reached, finalizing"
        );
        return Route::Terminal;
    }

    match latest.verdict {
        Verdict::RefineFeatures => {
            info!(
                run_id = %state.run_id,
                iteration = latest.iteration,
                concerns = ?latest.concerns,
                "Routing back to feature engineering"
            );
            Route::Goto(PhaseName::FeatureEngineer)
        }
        Verdict::RetrainModel => {
            info!(
                run_id = %state.run_id,
                iteration = latest.iteration,
                concerns = ?latest.concerns,
                "Routing back to model training"
            );
            Route::Goto(PhaseName::ModelTrainer)
        }
        Verdict::Finalize => {
            info!(run_id = %state.run_id, confidence = latest.confidence, "Finalizing run");
            Route::Terminal
        }
    }
}
