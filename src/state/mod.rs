//! Run state flowing through the workflow graph.
//!
//! - [`RunState`]: inputs, phase outputs, loop control, timings and errors
//!   for one run
//! - [`StateDelta`]: the partial update a phase handler returns
//! - [`types`]: phase outputs, review decisions and phase errors

pub mod run_state;
pub mod types;

pub use run_state::{RunState, StateDelta, DEFAULT_MAX_LOOPS};
pub use types::{
    DataFormat, DataProfile, DataSourceRef, EvaluationMetrics, FeatureArtifact,
    FeatureEngineering, ModelArtifact, OverfittingRisk, Phase, PhaseError, PlotArtifact,
    ReviewDecision, TaskType, Verdict, VisualizationOutput,
};
