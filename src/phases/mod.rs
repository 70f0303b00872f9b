//! The six phase handlers.
//!
//! Each code-running phase renders a prompt, asks the client for Python,
//! runs it in the sandbox between a fixed preamble and epilogue, and reads
//! its result from the last JSON line of stdout. Failing code gets one
//! repair attempt.
//!
//! | Phase | Handler | Timeout |
//! |-------|---------|---------|
//! | data_profiler | [`DataProfiler`] | 120 s |
//! | feature_engineer | [`FeatureEngineer`] | 120 s |
//! | visualizer | [`Visualizer`] | 120 s |
//! | model_trainer | [`ModelTrainer`] | 300 s |
//! | evaluator | [`Evaluator`] | 120 s |
//! | critic | [`Critic`] | - |

pub mod common;
pub mod critic;
pub mod evaluator;
pub mod features;
pub mod profiler;
pub mod prompts;
pub mod scripts;
pub mod trainer;
pub mod visualizer;

use std::sync::Arc;

pub use critic::Critic;
pub use evaluator::Evaluator;
pub use features::FeatureEngineer;
pub use profiler::DataProfiler;
pub use trainer::ModelTrainer;
pub use visualizer::Visualizer;

use crate::graph::PhaseHandler;

/// One handler per phase, in forward order.
pub fn default_handlers() -> Vec<Arc<dyn PhaseHandler>> {
    vec![
        Arc::new(DataProfiler::new()),
        Arc::new(FeatureEngineer::new()),
        Arc::new(Visualizer::new()),
        Arc::new(ModelTrainer::new()),
        Arc::new(Evaluator::new()),
        Arc::new(Critic::new()),
    ]
}
