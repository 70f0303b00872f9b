//! The fixed phase graph and its event stream.
//!
//! `data_profiler -> feature_engineer -> visualizer -> model_trainer ->
//! evaluator -> critic`, then [`route_after_review`] picks terminal or one of
//! the two loop-back targets. Each completed phase produces a
//! [`GraphEvent`] carrying the delta and the state after merging it.

use futures::stream::Stream;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::handler::{Collaborators, PhaseHandler};
use super::phase::PhaseName;
use super::router::route_after_review;
use crate::error::GraphError;
use crate::metrics::MetricsCollector;
use crate::state::{RunState, StateDelta};

/// One completed phase.
#[derive(Debug, Clone)]
pub struct GraphEvent {
    pub phase: PhaseName,
    /// What the handler changed.
    pub delta: StateDelta,
    /// State after the delta was merged.
    pub state: RunState,
    /// Phase to run next; `None` when the run has reached its terminal state.
    pub next: Option<PhaseName>,
    pub elapsed_secs: f64,
}

/// Ordered map of phase to handler plus the collaborators handed to each.
pub struct WorkflowGraph {
    handlers: BTreeMap<PhaseName, Arc<dyn PhaseHandler>>,
    collaborators: Collaborators,
    metrics: MetricsCollector,
}

impl WorkflowGraph {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            handlers: BTreeMap::new(),
            collaborators,
            metrics: MetricsCollector::new(),
        }
    }

    /// Registers `handler` under its own name, replacing any earlier one.
    pub fn with_handler(mut self, handler: Arc<dyn PhaseHandler>) -> Self {
        self.handlers.insert(handler.name(), handler);
        self
    }

    pub fn with_handlers(mut self, handlers: impl IntoIterator<Item = Arc<dyn PhaseHandler>>) -> Self {
        for handler in handlers {
            self.handlers.insert(handler.name(), handler);
        }
        self
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Phases with no registered handler.
    pub fn missing_handlers(&self) -> Vec<PhaseName> {
        PhaseName::ALL
            .into_iter()
            .filter(|p| !self.handlers.contains_key(p))
            .collect()
    }

    /// Fails if any phase lacks a handler.
    pub fn ensure_complete(&self) -> Result<(), GraphError> {
        match self.missing_handlers().first() {
            Some(phase) => Err(GraphError::MissingHandler(phase.to_string())),
            None => Ok(()),
        }
    }

    /// The phase that follows `phase` for the given merged state.
    pub fn successor(phase: PhaseName, state: &RunState) -> Option<PhaseName> {
        match phase {
            PhaseName::Critic => route_after_review(state).target(),
            other => other.next(),
        }
    }

    /// Upper bound on phase executions for a run with this loop ceiling.
    ///
    /// A full forward pass is six phases and each loop-back reruns at most
    /// five.
    pub fn step_limit(max_loops: u32) -> usize {
        PhaseName::ALL.len() + 5 * max_loops as usize
    }

    /// Drives `state` from `start` to the terminal state, yielding one event
    /// per completed phase.
    ///
    /// The stream ends after the terminal event or after the first error.
    pub fn stream(
        &self,
        mut state: RunState,
        start: PhaseName,
    ) -> impl Stream<Item = Result<GraphEvent, GraphError>> + Send + '_ {
        async_stream::stream! {
            let limit = Self::step_limit(state.max_loops);
            let mut current = Some(start);
            let mut steps = 0usize;

            while let Some(phase) = current {
                if steps >= limit {
                    warn!(run_id = %state.run_id, steps = steps, "Step limit exceeded");
                    yield Err(GraphError::StepLimitExceeded(limit));
                    return;
                }
                steps += 1;

                let Some(handler) = self.handlers.get(&phase) else {
                    yield Err(GraphError::MissingHandler(phase.to_string()));
                    return;
                };

                debug!(run_id = %state.run_id, phase = %phase, "Entering phase");
                let started = Instant::now();
                let mut delta = match handler.run(&state, &self.collaborators).await {
                    Ok(delta) => delta,
                    Err(e) => {
                        warn!(run_id = %state.run_id, phase = %phase, error = %e, "Phase handler failed");
                        yield Err(e);
                        return;
                    }
                };
                let elapsed_secs = started.elapsed().as_secs_f64();
                self.metrics.record_phase(phase.as_str(), elapsed_secs);

                if delta.current_phase.is_none() {
                    delta.current_phase = Some(phase.marker());
                }
                for error in &delta.errors {
                    self.metrics.record_phase_error(&error.phase, &error.error_type);
                }

                if let Err(e) = state.apply(delta.clone()) {
                    yield Err(e);
                    return;
                }

                let next = Self::successor(phase, &state);
                info!(
                    run_id = %state.run_id,
                    phase = %phase,
                    elapsed_secs = elapsed_secs,
                    outputs = ?delta.populated_outputs(),
                    next = ?next,
                    "Phase complete"
                );

                yield Ok(GraphEvent {
                    phase,
                    delta,
                    state: state.clone(),
                    next,
                    elapsed_secs,
                });
                current = next;
            }
        }
    }

    /// Runs to completion and returns the final state.
    pub async fn run(&self, state: RunState, start: PhaseName) -> Result<RunState, GraphError> {
        use futures::StreamExt;

        let mut final_state = state.clone();
        let events = self.stream(state, start);
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            final_state = event?.state;
        }
        Ok(final_state)
    }
}

fn label(phase: PhaseName) -> &'static str {
    match phase {
        PhaseName::DataProfiler => "Data Profiler",
        PhaseName::FeatureEngineer => "Feature Engineer",
        PhaseName::Visualizer => "Visualizer",
        PhaseName::ModelTrainer => "Model Trainer",
        PhaseName::Evaluator => "Evaluator",
        PhaseName::Critic => "Critic Review",
    }
}

/// Mermaid flowchart of the fixed topology.
pub fn to_mermaid() -> String {
    let mut out = String::from("flowchart TD\n    START([START]) --> data_profiler\n");
    for phase in PhaseName::ALL {
        if phase == PhaseName::Critic {
            out.push_str(&format!("    {}{{{}}}\n", phase, label(phase)));
        } else {
            out.push_str(&format!("    {}[{}]\n", phase, label(phase)));
        }
    }
    for phase in PhaseName::ALL {
        if let Some(next) = phase.next() {
            out.push_str(&format!("    {} --> {}\n", phase, next));
        }
    }
    out.push_str("    critic -->|finalize| DONE([END])\n");
    out.push_str(&format!(
        "    critic -->|refine_features| {}\n",
        PhaseName::FeatureEngineer
    ));
    out.push_str(&format!(
        "    critic -->|retrain_model| {}\n",
        PhaseName::ModelTrainer
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CodeGenClient, TokenUsage};
    use crate::sandbox::{CodeSandbox, ExecutionRequest, ExecutionResult};
    use crate::state::{DataFormat, DataSourceRef, Phase, PhaseError, ReviewDecision, Verdict};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::Mutex;

    struct NullClient;

    #[async_trait]
    impl CodeGenClient for NullClient {
        async fn generate(&self, _: &str, _: Option<&str>, _: f64) -> Result<String, LlmError> {
            Err(LlmError::EmptyResponse)
        }

        fn usage(&self) -> TokenUsage {
            TokenUsage::default()
        }

        fn model_name(&self) -> &str {
            "null"
        }
    }

    struct NullSandbox;

    #[async_trait]
    impl CodeSandbox for NullSandbox {
        async fn execute(&self, _request: ExecutionRequest) -> ExecutionResult {
            ExecutionResult::success(String::new(), String::new(), 0.0)
        }
    }

    /// Records a timing and nothing else.
    struct Passthrough(PhaseName);

    #[async_trait]
    impl PhaseHandler for Passthrough {
        fn name(&self) -> PhaseName {
            self.0
        }

        async fn run(&self, _state: &RunState, _ctx: &Collaborators) -> Result<StateDelta, GraphError> {
            Ok(StateDelta::default().with_timing(self.0.as_str(), 0.01))
        }
    }

    /// Critic that replays a fixed verdict and counts loop-backs.
    struct ScriptedCritic {
        verdicts: Mutex<Vec<Verdict>>,
    }

    #[async_trait]
    impl PhaseHandler for ScriptedCritic {
        fn name(&self) -> PhaseName {
            PhaseName::Critic
        }

        async fn run(&self, state: &RunState, _ctx: &Collaborators) -> Result<StateDelta, GraphError> {
            let verdict = {
                let mut verdicts = self.verdicts.lock().unwrap();
                if verdicts.is_empty() {
                    Verdict::Finalize
                } else {
                    verdicts.remove(0)
                }
            };
            let mut delta = StateDelta::entering(Phase::CriticReview)
                .with_decision(ReviewDecision::new(state.loop_count + 1, verdict, 0.7));
            if !verdict.is_terminal() {
                delta = delta.with_loop_count((state.loop_count + 1).min(state.max_loops));
            }
            Ok(delta)
        }
    }

    struct Failing;

    #[async_trait]
    impl PhaseHandler for Failing {
        fn name(&self) -> PhaseName {
            PhaseName::Visualizer
        }

        async fn run(&self, _state: &RunState, _ctx: &Collaborators) -> Result<StateDelta, GraphError> {
            Err(GraphError::Handler {
                phase: "visualizer".to_string(),
                message: "boom".to_string(),
            })
        }
    }

    fn collaborators() -> Collaborators {
        Collaborators::new(Arc::new(NullClient), Arc::new(NullSandbox))
    }

    fn graph_with(verdicts: Vec<Verdict>) -> WorkflowGraph {
        let mut graph = WorkflowGraph::new(collaborators());
        for phase in PhaseName::ALL {
            if phase != PhaseName::Critic {
                graph = graph.with_handler(Arc::new(Passthrough(phase)));
            }
        }
        graph.with_handler(Arc::new(ScriptedCritic {
            verdicts: Mutex::new(verdicts),
        }))
    }

    fn initial(max_loops: u32) -> RunState {
        RunState::new(
            "run-g",
            "predict",
            DataSourceRef::new("/d.csv", DataFormat::Csv, 10),
            "/tmp/run-g",
            max_loops,
        )
    }

    #[tokio::test]
    async fn test_linear_run_finalizes() {
        let graph = graph_with(vec![Verdict::Finalize]);
        let events: Vec<_> = graph
            .stream(initial(3), PhaseName::DataProfiler)
            .collect()
            .await;

        let phases: Vec<PhaseName> = events.iter().map(|e| e.as_ref().unwrap().phase).collect();
        assert_eq!(phases, PhaseName::ALL.to_vec());

        let last = events.last().unwrap().as_ref().unwrap();
        assert_eq!(last.next, None);
        assert_eq!(last.state.current_phase, Phase::CriticReview);
        assert_eq!(last.state.review_decisions.len(), 1);
        assert_eq!(last.state.phase_timings.len(), 5);
    }

    #[tokio::test]
    async fn test_refine_features_loops_back() {
        let graph = graph_with(vec![Verdict::RefineFeatures, Verdict::Finalize]);
        let events: Vec<_> = graph
            .stream(initial(3), PhaseName::DataProfiler)
            .map(|e| e.unwrap())
            .collect()
            .await;

        let phases: Vec<&str> = events.iter().map(|e| e.phase.as_str()).collect();
        assert_eq!(
            phases,
            vec![
                "data_profiler",
                "feature_engineer",
                "visualizer",
                "model_trainer",
                "evaluator",
                "critic",
                "feature_engineer",
                "visualizer",
                "model_trainer",
                "evaluator",
                "critic",
            ]
        );
        let final_state = &events.last().unwrap().state;
        assert_eq!(final_state.loop_count, 1);
        assert_eq!(final_state.review_decisions.len(), 2);
    }

    #[tokio::test]
    async fn test_retrain_skips_feature_phases() {
        let graph = graph_with(vec![Verdict::RetrainModel]);
        let state = graph.run(initial(3), PhaseName::DataProfiler).await.unwrap();
        assert_eq!(state.review_decisions.len(), 2);
        assert_eq!(state.loop_count, 1);
    }

    #[tokio::test]
    async fn test_loop_terminates_at_every_ceiling() {
        for max_loops in 1..=4u32 {
            let graph = graph_with(vec![Verdict::RefineFeatures; 10]);
            let state = graph
                .run(initial(max_loops), PhaseName::DataProfiler)
                .await
                .unwrap();
            assert_eq!(state.loop_count, max_loops);
            assert_eq!(state.review_decisions.len(), max_loops as usize);
        }
    }

    #[tokio::test]
    async fn test_handler_error_ends_stream() {
        let graph = graph_with(vec![]).with_handler(Arc::new(Failing));
        let events: Vec<_> = graph
            .stream(initial(3), PhaseName::DataProfiler)
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert!(events[..2].iter().all(|e| e.is_ok()));
        assert!(matches!(events[2], Err(GraphError::Handler { .. })));
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let graph = WorkflowGraph::new(collaborators())
            .with_handler(Arc::new(Passthrough(PhaseName::DataProfiler)));
        assert_eq!(graph.missing_handlers().len(), 5);
        assert!(graph.ensure_complete().is_err());

        let err = graph.run(initial(1), PhaseName::DataProfiler).await.unwrap_err();
        assert!(matches!(err, GraphError::MissingHandler(p) if p == "feature_engineer"));
    }

    #[tokio::test]
    async fn test_resume_from_middle() {
        let graph = graph_with(vec![]);
        let events: Vec<_> = graph
            .stream(initial(3), PhaseName::Evaluator)
            .map(|e| e.unwrap().phase)
            .collect()
            .await;
        assert_eq!(events, vec![PhaseName::Evaluator, PhaseName::Critic]);
    }

    #[tokio::test]
    async fn test_rejected_merge_aborts() {
        struct BadCritic;

        #[async_trait]
        impl PhaseHandler for BadCritic {
            fn name(&self) -> PhaseName {
                PhaseName::Critic
            }

            async fn run(&self, _s: &RunState, _c: &Collaborators) -> Result<StateDelta, GraphError> {
                Ok(StateDelta::default()
                    .with_loop_count(9)
                    .with_error(PhaseError::new("critic", "X", "y", false)))
            }
        }

        let graph = graph_with(vec![]).with_handler(Arc::new(BadCritic));
        let err = graph.run(initial(2), PhaseName::Critic).await.unwrap_err();
        assert!(matches!(err, GraphError::Merge(_)));
    }

    #[test]
    fn test_mermaid_lists_all_edges() {
        let diagram = to_mermaid();
        assert!(diagram.starts_with("flowchart TD"));
        assert!(diagram.contains("data_profiler --> feature_engineer"));
        assert!(diagram.contains("evaluator --> critic"));
        assert!(diagram.contains("critic -->|refine_features| feature_engineer"));
        assert!(diagram.contains("critic -->|retrain_model| model_trainer"));
        assert!(diagram.contains("critic{Critic Review}"));
    }

    #[test]
    fn test_step_limit() {
        assert_eq!(WorkflowGraph::step_limit(1), 11);
        assert_eq!(WorkflowGraph::step_limit(3), 21);
    }
}
