//! Scripted collaborators and stub phases shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ml_forge::error::{GraphError, LlmError};
use ml_forge::graph::{Collaborators, PhaseHandler, PhaseName, WorkflowGraph};
use ml_forge::llm::{CodeGenClient, TokenUsage};
use ml_forge::phases::Critic;
use ml_forge::sandbox::{CodeSandbox, ExecutionRequest, ExecutionResult};
use ml_forge::state::{DataFormat, DataProfile, DataSourceRef, PhaseError, RunState, StateDelta};

/// Answers every review with the next scripted verdict, repeating the last.
pub struct VerdictClient {
    verdicts: Mutex<Vec<&'static str>>,
    pub calls: AtomicUsize,
}

impl VerdictClient {
    pub fn new(verdicts: &[&'static str]) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.to_vec()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CodeGenClient for VerdictClient {
    async fn generate(&self, _prompt: &str, _system: Option<&str>, _t: f64) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut verdicts = self.verdicts.lock().unwrap();
        let verdict = if verdicts.len() > 1 {
            verdicts.remove(0)
        } else {
            verdicts.first().copied().unwrap_or("finalize")
        };
        Ok(format!(
            r#"{{"overall_assessment": "{}", "confidence": 0.7, "concerns": [], "recommendations": [], "reasoning": "scripted"}}"#,
            verdict
        ))
    }

    fn usage(&self) -> TokenUsage {
        TokenUsage::default()
    }

    fn model_name(&self) -> &str {
        "verdicts"
    }
}

/// Sandbox that must never be reached.
pub struct UnusedSandbox;

#[async_trait]
impl CodeSandbox for UnusedSandbox {
    async fn execute(&self, _request: ExecutionRequest) -> ExecutionResult {
        panic!("stub phases do not run code")
    }
}

/// What a stub phase does when it runs.
#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    Succeed,
    /// Records a recoverable error in its delta.
    RecordError,
    /// Fails the handler call itself.
    Abort,
}

/// Stands in for one of the five code-running phases.
pub struct StubPhase {
    pub phase: PhaseName,
    pub behavior: Behavior,
    pub delay: Duration,
    pub runs: AtomicUsize,
}

impl StubPhase {
    pub fn new(phase: PhaseName) -> Self {
        Self {
            phase,
            behavior: Behavior::Succeed,
            delay: Duration::ZERO,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl PhaseHandler for StubPhase {
    fn name(&self) -> PhaseName {
        self.phase
    }

    async fn run(&self, state: &RunState, _ctx: &Collaborators) -> Result<StateDelta, GraphError> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let key = format!("{}_{}", self.phase.as_str(), n);
        let mut delta = StateDelta::entering(self.phase.marker());
        match self.behavior {
            Behavior::Succeed => {}
            Behavior::RecordError => {
                delta.push_error(PhaseError::new(self.phase.as_str(), "ValueError", "bad column", true));
                return Ok(delta);
            }
            Behavior::Abort => {
                return Err(GraphError::Handler {
                    phase: self.phase.as_str().to_string(),
                    message: format!("{} crashed on run {}", self.phase, n),
                })
            }
        }
        if self.phase == PhaseName::DataProfiler && state.data_profile.is_none() {
            delta = delta.with_profile(DataProfile::default());
        }
        Ok(delta.with_timing(key, 0.01))
    }
}

/// A graph of stub phases with the real critic reviewing against `client`.
pub fn stub_graph(
    client: Arc<VerdictClient>,
    overrides: Vec<Arc<dyn PhaseHandler>>,
) -> WorkflowGraph {
    let collaborators = Collaborators::new(client, Arc::new(UnusedSandbox));
    let mut graph = WorkflowGraph::new(collaborators).with_handler(Arc::new(Critic::new()));
    for phase in PhaseName::ALL {
        if phase != PhaseName::Critic {
            graph = graph.with_handler(Arc::new(StubPhase::new(phase)));
        }
    }
    graph.with_handlers(overrides)
}

pub fn source() -> DataSourceRef {
    DataSourceRef::new("/data/churn.csv", DataFormat::Csv, 4096)
}

pub fn fresh_state(run_id: &str, max_loops: u32) -> RunState {
    RunState::new(run_id, "predict churn", source(), std::env::temp_dir(), max_loops)
}

/// True when a `python3` interpreter can be started.
pub fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
