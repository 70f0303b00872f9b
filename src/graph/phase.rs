//! Identities of the six phases and their fixed forward order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::state::Phase;

/// A node of the workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    DataProfiler,
    FeatureEngineer,
    Visualizer,
    ModelTrainer,
    Evaluator,
    Critic,
}

impl PhaseName {
    /// Every phase, in forward order.
    pub const ALL: [PhaseName; 6] = [
        PhaseName::DataProfiler,
        PhaseName::FeatureEngineer,
        PhaseName::Visualizer,
        PhaseName::ModelTrainer,
        PhaseName::Evaluator,
        PhaseName::Critic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::DataProfiler => "data_profiler",
            PhaseName::FeatureEngineer => "feature_engineer",
            PhaseName::Visualizer => "visualizer",
            PhaseName::ModelTrainer => "model_trainer",
            PhaseName::Evaluator => "evaluator",
            PhaseName::Critic => "critic",
        }
    }

    /// The current-phase marker a run shows while this phase is active.
    pub fn marker(&self) -> Phase {
        match self {
            PhaseName::DataProfiler => Phase::DataProfiling,
            PhaseName::FeatureEngineer => Phase::FeatureEngineering,
            PhaseName::Visualizer => Phase::Visualization,
            PhaseName::ModelTrainer => Phase::ModelTraining,
            PhaseName::Evaluator => Phase::Evaluation,
            PhaseName::Critic => Phase::CriticReview,
        }
    }

    /// The unconditional successor; `None` for the critic, whose successor
    /// is decided by the router.
    pub fn next(&self) -> Option<PhaseName> {
        match self {
            PhaseName::DataProfiler => Some(PhaseName::FeatureEngineer),
            PhaseName::FeatureEngineer => Some(PhaseName::Visualizer),
            PhaseName::Visualizer => Some(PhaseName::ModelTrainer),
            PhaseName::ModelTrainer => Some(PhaseName::Evaluator),
            PhaseName::Evaluator => Some(PhaseName::Critic),
            PhaseName::Critic => None,
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PhaseName::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase '{}'", s))
    }
}
