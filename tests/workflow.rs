//! Graph-level behavior: loop termination, routing and the review ceiling.

mod common;

use futures::StreamExt;
use std::sync::Arc;

use common::{fresh_state, stub_graph, StubPhase, VerdictClient};
use ml_forge::graph::{PhaseHandler, PhaseName, WorkflowGraph};
use ml_forge::state::{Phase, RunState, Verdict};

async fn phase_sequence(graph: &WorkflowGraph, state: RunState) -> (Vec<PhaseName>, RunState) {
    let mut phases = Vec::new();
    let mut last = state.clone();
    let events = graph.stream(state, PhaseName::DataProfiler);
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        let event = event.expect("stub graph never fails");
        phases.push(event.phase);
        last = event.state;
    }
    (phases, last)
}

#[tokio::test]
async fn test_loops_terminate_for_every_ceiling() {
    for max_loops in 1..=4u32 {
        for verdict in ["refine_features", "retrain_model"] {
            let client = Arc::new(VerdictClient::new(&[verdict]));
            let graph = stub_graph(client.clone(), vec![]);
            let (phases, state) = phase_sequence(&graph, fresh_state("loop", max_loops)).await;

            assert_eq!(state.loop_count, max_loops, "{} with ceiling {}", verdict, max_loops);
            assert_eq!(state.review_decisions.len() as u32, max_loops);
            assert!(phases.len() <= WorkflowGraph::step_limit(max_loops));
            assert_eq!(*phases.last().unwrap(), PhaseName::Critic);
            for (i, decision) in state.review_decisions.iter().enumerate() {
                assert_eq!(decision.iteration, i as u32 + 1);
            }
            let forced = state.review_decisions.last().unwrap();
            assert_eq!(forced.verdict, Verdict::Finalize);
            assert!(forced.concerns.iter().any(|c| c.starts_with("Forced finalization")));
        }
    }
}

#[tokio::test]
async fn test_loop_back_targets() {
    let client = Arc::new(VerdictClient::new(&["refine_features", "retrain_model", "finalize"]));
    let graph = stub_graph(client, vec![]);
    let (phases, state) = phase_sequence(&graph, fresh_state("targets", 3)).await;

    use PhaseName::*;
    assert_eq!(
        phases,
        vec![
            DataProfiler, FeatureEngineer, Visualizer, ModelTrainer, Evaluator, Critic,
            FeatureEngineer, Visualizer, ModelTrainer, Evaluator, Critic,
            ModelTrainer, Evaluator, Critic,
        ]
    );
    assert_eq!(state.loop_count, 2);
    let verdicts: Vec<Verdict> = state.review_decisions.iter().map(|d| d.verdict).collect();
    assert_eq!(verdicts, vec![Verdict::RefineFeatures, Verdict::RetrainModel, Verdict::Finalize]);
    assert!(state.phase_timings.contains_key("critic_review_3"));
}

#[tokio::test]
async fn test_routing_is_deterministic() {
    let script = ["retrain_model", "refine_features", "finalize"];
    let mut runs = Vec::new();
    for _ in 0..3 {
        let graph = stub_graph(Arc::new(VerdictClient::new(&script)), vec![]);
        runs.push(phase_sequence(&graph, fresh_state("same", 3)).await.0);
    }
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[1], runs[2]);
}

#[tokio::test]
async fn test_ceiling_of_one_with_refine() {
    let client = Arc::new(VerdictClient::new(&["refine_features"]));
    let features = Arc::new(StubPhase::new(PhaseName::FeatureEngineer));
    let graph = stub_graph(client.clone(), vec![features.clone() as Arc<dyn PhaseHandler>]);

    let state = graph
        .run(fresh_state("ceiling-1", 1), PhaseName::DataProfiler)
        .await
        .unwrap();

    assert_eq!(state.loop_count, 1);
    assert_eq!(state.review_decisions.len(), 1);
    assert_eq!(state.review_decisions[0].verdict, Verdict::Finalize);
    assert_eq!(
        state.review_decisions[0].concerns,
        vec!["Forced finalization: reached max loop limit (1)"]
    );
    assert_eq!(state.current_phase, Phase::CriticReview);
    assert_eq!(features.runs.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(client.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_finalize_ends_after_one_pass() {
    let graph = stub_graph(Arc::new(VerdictClient::new(&["finalize"])), vec![]);
    let (phases, state) = phase_sequence(&graph, fresh_state("one-pass", 3)).await;
    assert_eq!(phases.len(), 6);
    assert_eq!(state.loop_count, 0);
    assert!(state.errors.is_empty());
}
