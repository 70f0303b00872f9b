//! The run state and the deltas that mutate it.
//!
//! A [`RunState`] is only ever changed by [`RunState::apply`], which checks
//! a [`StateDelta`] in full before touching any field. Review decisions and
//! errors can only be appended; timings can only gain or update keys.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::types::{
    DataProfile, DataSourceRef, EvaluationMetrics, FeatureEngineering, ModelArtifact, Phase,
    PhaseError, ReviewDecision, VisualizationOutput,
};
use crate::error::GraphError;

/// Default loop ceiling for critic-triggered revisits.
pub const DEFAULT_MAX_LOOPS: u32 = 3;

/// State of one run as it flows through the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub objective: String,
    pub data_source: DataSourceRef,

    pub data_profile: Option<DataProfile>,
    pub feature_engineering: Option<FeatureEngineering>,
    pub visualizations: Option<VisualizationOutput>,
    pub model: Option<ModelArtifact>,
    pub evaluation: Option<EvaluationMetrics>,

    pub review_decisions: Vec<ReviewDecision>,
    pub loop_count: u32,
    pub max_loops: u32,

    pub current_phase: Phase,
    /// Phase name to elapsed seconds.
    pub phase_timings: BTreeMap<String, f64>,
    pub errors: Vec<PhaseError>,

    pub working_dir: PathBuf,
}

impl RunState {
    /// Creates a fresh state with every phase output empty.
    pub fn new(
        run_id: impl Into<String>,
        objective: impl Into<String>,
        data_source: DataSourceRef,
        working_dir: impl Into<PathBuf>,
        max_loops: u32,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            objective: objective.into(),
            data_source,
            data_profile: None,
            feature_engineering: None,
            visualizations: None,
            model: None,
            evaluation: None,
            review_decisions: Vec::new(),
            loop_count: 0,
            max_loops,
            current_phase: Phase::Initialized,
            phase_timings: BTreeMap::new(),
            errors: Vec::new(),
            working_dir: working_dir.into(),
        }
    }

    pub fn latest_decision(&self) -> Option<&ReviewDecision> {
        self.review_decisions.last()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Merges a delta into this state.
    ///
    /// The delta is validated first; on error the state is left untouched.
    pub fn apply(&mut self, delta: StateDelta) -> Result<(), GraphError> {
        if let Some(count) = delta.loop_count {
            if count > self.max_loops {
                return Err(GraphError::Merge(format!(
                    "loop count {} exceeds ceiling {}",
                    count, self.max_loops
                )));
            }
            if count < self.loop_count {
                return Err(GraphError::Merge(format!(
                    "loop count cannot decrease from {} to {}",
                    self.loop_count, count
                )));
            }
        }

        let next_iteration = self.review_decisions.len() as u32;
        for (offset, decision) in delta.decisions.iter().enumerate() {
            let expected = next_iteration + offset as u32 + 1;
            if decision.iteration != expected {
                return Err(GraphError::Merge(format!(
                    "review decision iteration {} out of order, expected {}",
                    decision.iteration, expected
                )));
            }
        }

        if let Some(phase) = delta.current_phase {
            self.current_phase = phase;
        }
        if let Some(profile) = delta.data_profile {
            self.data_profile = Some(profile);
        }
        if let Some(features) = delta.feature_engineering {
            self.feature_engineering = Some(features);
        }
        if let Some(visualizations) = delta.visualizations {
            self.visualizations = Some(visualizations);
        }
        if let Some(model) = delta.model {
            self.model = Some(model);
        }
        if let Some(evaluation) = delta.evaluation {
            self.evaluation = Some(evaluation);
        }
        if let Some(count) = delta.loop_count {
            self.loop_count = count;
        }
        self.phase_timings.extend(delta.timings);
        self.review_decisions.extend(delta.decisions);
        self.errors.extend(delta.errors);
        Ok(())
    }
}

/// The fields a phase handler changed.
///
/// Absent fields are left as they are; collections are appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub current_phase: Option<Phase>,
    pub data_profile: Option<DataProfile>,
    pub feature_engineering: Option<FeatureEngineering>,
    pub visualizations: Option<VisualizationOutput>,
    pub model: Option<ModelArtifact>,
    pub evaluation: Option<EvaluationMetrics>,
    pub loop_count: Option<u32>,
    pub timings: BTreeMap<String, f64>,
    pub decisions: Vec<ReviewDecision>,
    pub errors: Vec<PhaseError>,
}

impl StateDelta {
    /// A delta that only moves the phase marker.
    pub fn entering(phase: Phase) -> Self {
        Self {
            current_phase: Some(phase),
            ..Self::default()
        }
    }

    pub fn with_profile(mut self, profile: DataProfile) -> Self {
        self.data_profile = Some(profile);
        self
    }

    pub fn with_features(mut self, features: FeatureEngineering) -> Self {
        self.feature_engineering = Some(features);
        self
    }

    pub fn with_visualizations(mut self, visualizations: VisualizationOutput) -> Self {
        self.visualizations = Some(visualizations);
        self
    }

    pub fn with_model(mut self, model: ModelArtifact) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_evaluation(mut self, evaluation: EvaluationMetrics) -> Self {
        self.evaluation = Some(evaluation);
        self
    }

    pub fn with_loop_count(mut self, count: u32) -> Self {
        self.loop_count = Some(count);
        self
    }

    /// Records elapsed seconds, rounded to two decimals.
    pub fn with_timing(mut self, key: impl Into<String>, secs: f64) -> Self {
        self.timings.insert(key.into(), (secs * 100.0).round() / 100.0);
        self
    }

    pub fn with_decision(mut self, decision: ReviewDecision) -> Self {
        self.decisions.push(decision);
        self
    }

    pub fn with_error(mut self, error: PhaseError) -> Self {
        self.errors.push(error);
        self
    }

    pub fn push_error(&mut self, error: PhaseError) {
        self.errors.push(error);
    }

    /// Names of the phase-output slots this delta populates.
    pub fn populated_outputs(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.data_profile.is_some() {
            out.push("data_profile");
        }
        if self.feature_engineering.is_some() {
            out.push("feature_engineering");
        }
        if self.visualizations.is_some() {
            out.push("visualizations");
        }
        if self.model.is_some() {
            out.push("model");
        }
        if self.evaluation.is_some() {
            out.push("evaluation");
        }
        if !self.decisions.is_empty() {
            out.push("critic_decisions");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::{DataFormat, Verdict};

    fn state(max_loops: u32) -> RunState {
        RunState::new(
            "run-1",
            "classify churn",
            DataSourceRef::new("/data/churn.csv", DataFormat::Csv, 1024),
            "/tmp/run-1",
            max_loops,
        )
    }

    #[test]
    fn test_new_state_is_empty() {
        let s = state(3);
        assert_eq!(s.current_phase, Phase::Initialized);
        assert_eq!(s.loop_count, 0);
        assert!(s.data_profile.is_none());
        assert!(s.review_decisions.is_empty());
        assert!(!s.has_errors());
    }

    #[test]
    fn test_apply_merges_fields_and_appends() {
        let mut s = state(3);
        s.apply(
            StateDelta::entering(Phase::DataProfiling)
                .with_profile(DataProfile::default())
                .with_timing("data_profiling", 1.23456)
                .with_error(PhaseError::new("data_profiling", "KeyError", "x", true)),
        )
        .unwrap();
        s.apply(
            StateDelta::entering(Phase::FeatureEngineering)
                .with_timing("feature_engineering", 2.0)
                .with_error(PhaseError::missing_dependency("feature_engineering", "no profile")),
        )
        .unwrap();

        assert_eq!(s.current_phase, Phase::FeatureEngineering);
        assert!(s.data_profile.is_some());
        assert_eq!(s.phase_timings.get("data_profiling"), Some(&1.23));
        assert_eq!(s.phase_timings.len(), 2);
        assert_eq!(s.errors.len(), 2);
        assert_eq!(s.errors[1].error_type, "MissingDependency");
        assert!(!s.errors[1].recoverable);
    }

    #[test]
    fn test_apply_overwrites_slot_on_loop_back() {
        let mut s = state(3);
        let first = FeatureEngineering {
            new_columns: vec!["a".to_string()],
            ..Default::default()
        };
        let second = FeatureEngineering {
            new_columns: vec!["b".to_string()],
            ..Default::default()
        };
        s.apply(StateDelta::default().with_features(first)).unwrap();
        s.apply(StateDelta::default().with_features(second)).unwrap();
        assert_eq!(s.feature_engineering.unwrap().new_columns, vec!["b".to_string()]);
    }

    #[test]
    fn test_apply_rejects_loop_count_above_ceiling() {
        let mut s = state(1);
        let err = s
            .apply(
                StateDelta::entering(Phase::CriticReview)
                    .with_loop_count(2)
                    .with_error(PhaseError::new("critic", "X", "y", false)),
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::Merge(_)));
        // nothing from the rejected delta landed
        assert_eq!(s.current_phase, Phase::Initialized);
        assert!(s.errors.is_empty());
    }

    #[test]
    fn test_apply_rejects_out_of_order_decision() {
        let mut s = state(3);
        let err = s
            .apply(StateDelta::default().with_decision(ReviewDecision::new(2, Verdict::Finalize, 0.9)))
            .unwrap_err();
        assert!(err.to_string().contains("out of order"));

        s.apply(StateDelta::default().with_decision(ReviewDecision::new(1, Verdict::Finalize, 0.9)))
            .unwrap();
        assert_eq!(s.latest_decision().unwrap().iteration, 1);
    }

    #[test]
    fn test_apply_rejects_decreasing_loop_count() {
        let mut s = state(3);
        s.apply(StateDelta::default().with_loop_count(2)).unwrap();
        assert!(s.apply(StateDelta::default().with_loop_count(1)).is_err());
    }

    #[test]
    fn test_populated_outputs() {
        let delta = StateDelta::default()
            .with_model(ModelArtifact::default())
            .with_decision(ReviewDecision::new(1, Verdict::Finalize, 1.0));
        assert_eq!(delta.populated_outputs(), vec!["model", "critic_decisions"]);
    }
}
