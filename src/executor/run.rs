//! The run executor.
//!
//! Each submitted run becomes one tokio task that streams its state through
//! the [`WorkflowGraph`]. After every phase the task writes a checkpoint and
//! publishes a fresh snapshot to the [`StatusProjection`]; when the graph
//! ends it copies artifacts and saves the final snapshot as metadata.

use futures::StreamExt;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::artifacts::{validate_run_id, ArtifactStore};
use super::status::{RunSnapshot, RunStatus, StatusProjection};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::Settings;
use crate::error::ExecutorError;
use crate::graph::{PhaseName, WorkflowGraph};
use crate::metrics::MetricsCollector;
use crate::state::{DataSourceRef, Phase, PhaseError, RunState, StateDelta, DEFAULT_MAX_LOOPS};

/// Phase name recorded for errors raised outside any phase handler.
const EXECUTION_PHASE: &str = "execution";

/// A run accepted by the executor.
pub struct RunHandle {
    run_id: String,
    task: JoinHandle<RunSnapshot>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Waits for the run to leave the graph and returns its final snapshot.
    pub async fn wait(self) -> Result<RunSnapshot, ExecutorError> {
        self.task
            .await
            .map_err(|e| ExecutorError::Join(e.to_string()))
    }
}

struct ExecutorInner {
    graph: WorkflowGraph,
    checkpoints: Arc<dyn CheckpointStore>,
    artifacts: ArtifactStore,
    projection: StatusProjection,
    active: Mutex<HashSet<String>>,
    metrics: MetricsCollector,
}

/// Removes a run from the active set when its task ends, panics included.
struct ActiveGuard {
    inner: Arc<ExecutorInner>,
    run_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.run_id);
        self.inner.metrics.dec_active_runs();
    }
}

/// Drives runs through the workflow graph.
///
/// Cheap to clone; clones share the status projection and stores.
#[derive(Clone)]
pub struct RunExecutor {
    inner: Arc<ExecutorInner>,
    default_max_loops: u32,
    scratch_dir: Option<PathBuf>,
}

impl RunExecutor {
    /// Creates an executor. Fails if any phase has no handler.
    pub fn new(
        graph: WorkflowGraph,
        checkpoints: Arc<dyn CheckpointStore>,
        artifacts: ArtifactStore,
    ) -> Result<Self, ExecutorError> {
        graph.ensure_complete()?;
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                graph,
                checkpoints,
                artifacts,
                projection: StatusProjection::new(),
                active: Mutex::new(HashSet::new()),
                metrics: MetricsCollector::new(),
            }),
            default_max_loops: DEFAULT_MAX_LOOPS,
            scratch_dir: None,
        })
    }

    /// Creates an executor with the stores and loop ceiling from `settings`.
    pub async fn from_settings(
        settings: &Settings,
        graph: WorkflowGraph,
    ) -> Result<Self, ExecutorError> {
        let checkpoints = crate::checkpoint::open_store(settings).await?;
        let artifacts = ArtifactStore::new(&settings.artifact_path);
        Ok(Self::new(graph, checkpoints, artifacts)?.with_max_loops(settings.max_loops))
    }

    /// Loop ceiling for runs submitted without one.
    pub fn with_max_loops(mut self, max_loops: u32) -> Self {
        self.default_max_loops = max_loops.max(1);
        self
    }

    /// Directory under which per-run working directories are created.
    /// Defaults to the system temp directory.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.inner.artifacts
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.inner.graph
    }

    /// Accepts a run and starts it on its own task.
    ///
    /// A fresh working directory is allocated for the run and kept after it
    /// ends. An id already known to the checkpoint store or artifact storage
    /// is refused, so a finished run is never overwritten.
    pub async fn submit(
        &self,
        data_source: DataSourceRef,
        objective: impl Into<String>,
        run_id: Option<String>,
        max_loops: Option<u32>,
    ) -> Result<RunHandle, ExecutorError> {
        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        check_run_id(&run_id)?;
        let guard = self.reserve(&run_id)?;
        self.ensure_unknown(&run_id).await?;

        let working_dir = self.allocate_working_dir(&run_id)?;
        let max_loops = max_loops.unwrap_or(self.default_max_loops).max(1);
        let state = RunState::new(&run_id, objective, data_source, working_dir, max_loops);

        info!(
            run_id = %run_id,
            max_loops = max_loops,
            working_dir = %state.working_dir.display(),
            "Run accepted"
        );
        self.inner
            .checkpoints
            .save(&Checkpoint::new(state.clone(), Some(PhaseName::DataProfiler), 0))
            .await?;
        Ok(self.spawn(state, PhaseName::DataProfiler, 0, guard).await)
    }

    /// Submits a run and waits for it to finish.
    pub async fn run_to_completion(
        &self,
        data_source: DataSourceRef,
        objective: impl Into<String>,
        run_id: Option<String>,
        max_loops: Option<u32>,
    ) -> Result<RunSnapshot, ExecutorError> {
        self.submit(data_source, objective, run_id, max_loops)
            .await?
            .wait()
            .await
    }

    /// Restarts a run from its last checkpoint.
    pub async fn resume(&self, run_id: &str) -> Result<RunHandle, ExecutorError> {
        check_run_id(run_id)?;
        let guard = self.reserve(run_id)?;
        let checkpoint = self
            .inner
            .checkpoints
            .load(run_id)
            .await?
            .ok_or_else(|| ExecutorError::RunNotFound(run_id.to_string()))?;

        let Some(next) = checkpoint.next_phase else {
            return Err(ExecutorError::AlreadyFinished(run_id.to_string()));
        };

        tokio::fs::create_dir_all(&checkpoint.state.working_dir).await?;
        info!(
            run_id = %run_id,
            next_phase = %next,
            step = checkpoint.step,
            "Resuming run from checkpoint"
        );
        Ok(self.spawn(checkpoint.state, next, checkpoint.step, guard).await)
    }

    /// Latest snapshot of a run: the live projection first, then the saved
    /// metadata. `None` when neither knows the run.
    pub async fn status(&self, run_id: &str) -> Result<Option<RunSnapshot>, ExecutorError> {
        check_run_id(run_id)?;
        if let Some(snapshot) = self.inner.projection.get(run_id).await {
            if snapshot.status.is_terminal() {
                return Ok(Some(snapshot));
            }
            let usage = self.inner.graph.collaborators().client.usage();
            return Ok(Some(snapshot.with_token_usage(usage)));
        }
        Ok(self.inner.artifacts.load_metadata(run_id).await?)
    }

    /// Snapshots of every known run: live runs first, then runs only found
    /// in artifact storage.
    pub async fn list(&self) -> Result<Vec<RunSnapshot>, ExecutorError> {
        let mut snapshots = self.inner.projection.list().await;
        let live: HashSet<String> = snapshots.iter().map(|s| s.run_id.clone()).collect();

        for run_id in self.inner.artifacts.list_runs().await? {
            if live.contains(&run_id) {
                continue;
            }
            match self.inner.artifacts.load_metadata(&run_id).await {
                Ok(Some(snapshot)) => snapshots.push(snapshot),
                Ok(None) => {}
                Err(e) => warn!(run_id = %run_id, error = %e, "Skipping unreadable run metadata"),
            }
        }
        Ok(snapshots)
    }

    fn allocate_working_dir(&self, run_id: &str) -> Result<PathBuf, ExecutorError> {
        let short: String = run_id.chars().take(8).collect();
        let prefix = format!("pipeline_{}_", short);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.scratch_dir {
            Some(scratch) => {
                std::fs::create_dir_all(scratch)?;
                builder.tempdir_in(scratch)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir.keep())
    }

    /// Claims `run_id` in the active set until the returned guard drops.
    fn reserve(&self, run_id: &str) -> Result<ActiveGuard, ExecutorError> {
        let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(run_id.to_string()) {
            return Err(ExecutorError::AlreadyActive(run_id.to_string()));
        }
        self.inner.metrics.inc_active_runs();
        Ok(ActiveGuard {
            inner: Arc::clone(&self.inner),
            run_id: run_id.to_string(),
        })
    }

    /// Fails if any tier already holds state for `run_id`.
    async fn ensure_unknown(&self, run_id: &str) -> Result<(), ExecutorError> {
        if let Some(checkpoint) = self.inner.checkpoints.load(run_id).await? {
            return Err(if checkpoint.is_finished() {
                ExecutorError::AlreadyFinished(run_id.to_string())
            } else {
                ExecutorError::Resumable(run_id.to_string())
            });
        }
        let known = match self.inner.projection.get(run_id).await {
            Some(snapshot) => Some(snapshot),
            None => self.inner.artifacts.load_metadata(run_id).await?,
        };
        match known {
            Some(_) => Err(ExecutorError::AlreadyFinished(run_id.to_string())),
            None => Ok(()),
        }
    }

    async fn spawn(
        &self,
        state: RunState,
        start: PhaseName,
        step: u64,
        guard: ActiveGuard,
    ) -> RunHandle {
        let run_id = state.run_id.clone();
        self.inner.projection.update(&state, RunStatus::Queued).await;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _guard = guard;
            inner.drive(state, start, step).await
        });

        RunHandle { run_id, task }
    }
}

fn check_run_id(run_id: &str) -> Result<(), ExecutorError> {
    validate_run_id(run_id).map_err(|_| ExecutorError::InvalidRunId(run_id.to_string()))
}

/// Where a run stopped: the last merged state and the graph cursor.
struct Position {
    state: RunState,
    next: Option<PhaseName>,
    step: u64,
}

impl ExecutorInner {
    async fn drive(&self, state: RunState, start: PhaseName, step: u64) -> RunSnapshot {
        let started = Instant::now();
        let run_id = state.run_id.clone();
        self.projection.update(&state, RunStatus::Running).await;

        let mut position = Position {
            state,
            next: Some(start),
            step,
        };
        let outcome = match self.stream_to_end(&mut position).await {
            Ok(()) => self.finish(&mut position.state).await,
            Err(e) => Err(e),
        };
        let snapshot = match outcome {
            Ok(snapshot) => snapshot,
            Err(e) => self.fail(position, e).await,
        };

        let elapsed = started.elapsed().as_secs_f64();
        self.metrics.record_run(snapshot.status.as_str(), elapsed);
        info!(
            run_id = %run_id,
            status = %snapshot.status,
            loop_count = snapshot.loop_count,
            errors = snapshot.errors.len(),
            elapsed_secs = elapsed,
            "Run finished"
        );
        snapshot
    }

    /// Streams the graph from `position`, checkpointing and publishing after
    /// each phase. `position` always holds the last merged state.
    async fn stream_to_end(&self, position: &mut Position) -> Result<(), ExecutorError> {
        let Some(start) = position.next else {
            return Ok(());
        };
        let events = self.graph.stream(position.state.clone(), start);
        futures::pin_mut!(events);

        while let Some(event) = events.next().await {
            let event = event?;
            position.step += 1;
            position.state = event.state;
            position.next = event.next;

            let checkpoint = Checkpoint::new(position.state.clone(), position.next, position.step);
            self.checkpoints.save(&checkpoint).await?;
            self.projection.update(&position.state, RunStatus::Running).await;
        }
        Ok(())
    }

    async fn finish(&self, state: &mut RunState) -> Result<RunSnapshot, ExecutorError> {
        state.apply(StateDelta::entering(Phase::Finalized))?;
        self.artifacts
            .copy_from_working_dir(&state.run_id, &state.working_dir)
            .await?;

        let status = RunStatus::finished(state.has_errors());
        let snapshot = RunSnapshot::from_state(state, status)
            .with_token_usage(self.graph.collaborators().client.usage());
        self.artifacts.save_metadata(&state.run_id, &snapshot).await?;

        self.projection.publish(snapshot.clone()).await;
        Ok(snapshot)
    }

    /// Records `e` as a non-recoverable error and marks the run failed.
    ///
    /// The checkpoint keeps the graph cursor so the run can be resumed.
    async fn fail(&self, mut position: Position, e: ExecutorError) -> RunSnapshot {
        let run_id = position.state.run_id.clone();
        error!(run_id = %run_id, error = %e, "Run failed");

        let recorded = PhaseError::new(EXECUTION_PHASE, e.type_name(), e.to_string(), false);
        if let Err(merge) = position.state.apply(StateDelta::default().with_error(recorded)) {
            warn!(run_id = %run_id, error = %merge, "Could not record run failure");
        }

        let checkpoint = Checkpoint::new(position.state.clone(), position.next, position.step);
        if let Err(save) = self.checkpoints.save(&checkpoint).await {
            warn!(run_id = %run_id, error = %save, "Failed to checkpoint failed run");
        }

        let snapshot = RunSnapshot::from_state(&position.state, RunStatus::Failed)
            .with_token_usage(self.graph.collaborators().client.usage());
        if let Err(save) = self.artifacts.save_metadata(&run_id, &snapshot).await {
            warn!(run_id = %run_id, error = %save, "Failed to save metadata for failed run");
        }
        self.projection.publish(snapshot.clone()).await;
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::error::{GraphError, LlmError};
    use crate::graph::{Collaborators, PhaseHandler};
    use crate::llm::{CodeGenClient, TokenUsage};
    use crate::sandbox::{CodeSandbox, ExecutionRequest, ExecutionResult};
    use crate::state::{DataFormat, DataProfile, ReviewDecision, Verdict};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct CountingClient;

    #[async_trait]
    impl CodeGenClient for CountingClient {
        async fn generate(&self, _: &str, _: Option<&str>, _: f64) -> Result<String, LlmError> {
            Ok(String::new())
        }

        fn usage(&self) -> TokenUsage {
            TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                llm_calls: 1,
            }
        }

        fn model_name(&self) -> &str {
            "counting"
        }
    }

    struct NullSandbox;

    #[async_trait]
    impl CodeSandbox for NullSandbox {
        async fn execute(&self, _request: ExecutionRequest) -> ExecutionResult {
            ExecutionResult::success(String::new(), String::new(), 0.0)
        }
    }

    /// Writes a profile; the model trainer also drops a model file.
    struct Producer(PhaseName);

    #[async_trait]
    impl PhaseHandler for Producer {
        fn name(&self) -> PhaseName {
            self.0
        }

        async fn run(&self, state: &RunState, _ctx: &Collaborators) -> Result<StateDelta, GraphError> {
            let mut delta = StateDelta::default().with_timing(self.0.as_str(), 0.01);
            match self.0 {
                PhaseName::DataProfiler => delta = delta.with_profile(DataProfile::default()),
                PhaseName::ModelTrainer => {
                    std::fs::write(state.working_dir.join("model.joblib"), b"model")
                        .map_err(|e| GraphError::Handler {
                            phase: "model_trainer".to_string(),
                            message: e.to_string(),
                        })?;
                }
                _ => {}
            }
            Ok(delta)
        }
    }

    struct Finalizer;

    #[async_trait]
    impl PhaseHandler for Finalizer {
        fn name(&self) -> PhaseName {
            PhaseName::Critic
        }

        async fn run(&self, state: &RunState, _ctx: &Collaborators) -> Result<StateDelta, GraphError> {
            let iteration = state.review_decisions.len() as u32 + 1;
            Ok(StateDelta::default().with_decision(ReviewDecision::new(iteration, Verdict::Finalize, 0.9)))
        }
    }

    /// Visualizer that fails until switched off.
    struct FlakyVisualizer {
        fail: AtomicBool,
    }

    #[async_trait]
    impl PhaseHandler for FlakyVisualizer {
        fn name(&self) -> PhaseName {
            PhaseName::Visualizer
        }

        async fn run(&self, _state: &RunState, _ctx: &Collaborators) -> Result<StateDelta, GraphError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(GraphError::Handler {
                    phase: "visualizer".to_string(),
                    message: "renderer crashed".to_string(),
                });
            }
            Ok(StateDelta::default().with_timing("visualizer", 0.01))
        }
    }

    fn graph(visualizer: Option<Arc<dyn PhaseHandler>>) -> WorkflowGraph {
        let collaborators = Collaborators::new(Arc::new(CountingClient), Arc::new(NullSandbox));
        let mut graph = WorkflowGraph::new(collaborators).with_handler(Arc::new(Finalizer));
        for phase in PhaseName::ALL {
            if phase != PhaseName::Critic {
                graph = graph.with_handler(Arc::new(Producer(phase)));
            }
        }
        if let Some(v) = visualizer {
            graph = graph.with_handler(v);
        }
        graph
    }

    fn source() -> DataSourceRef {
        DataSourceRef::new("/data/x.csv", DataFormat::Csv, 10)
    }

    fn executor(
        graph: WorkflowGraph,
        store: Arc<dyn CheckpointStore>,
        dir: &TempDir,
    ) -> RunExecutor {
        RunExecutor::new(graph, store, ArtifactStore::new(dir.path().join("artifacts")))
            .unwrap()
            .with_scratch_dir(dir.path().join("scratch"))
    }

    #[tokio::test]
    async fn test_run_completes_and_persists() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let exec = executor(graph(None), Arc::clone(&store), &dir);

        let snapshot = exec
            .run_to_completion(source(), "classify", Some("run-ok".to_string()), Some(2))
            .await
            .unwrap();

        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.current_phase, Phase::Finalized);
        assert_eq!(snapshot.max_loops, 2);
        assert_eq!(snapshot.phase_timings.len(), 5);
        assert_eq!(snapshot.summaries.critic_decisions.len(), 1);
        assert_eq!(snapshot.token_usage.unwrap().total_tokens, 15);
        assert!(snapshot
            .working_dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("pipeline_run-ok_"));

        let checkpoint = store.load("run-ok").await.unwrap().unwrap();
        assert!(checkpoint.is_finished());
        assert_eq!(checkpoint.step, 6);

        let artifacts = exec.artifacts().list_artifacts("run-ok").await.unwrap();
        assert!(artifacts.iter().any(|p| p.ends_with("model.joblib")));
        assert!(artifacts.iter().any(|p| p.ends_with("metadata.json")));

        assert_eq!(exec.status("run-ok").await.unwrap().unwrap().status, RunStatus::Completed);
        assert!(matches!(
            exec.submit(source(), "again", Some("run-ok".to_string()), None).await,
            Err(ExecutorError::AlreadyFinished(_))
        ));
    }

    #[tokio::test]
    async fn test_handler_error_fails_run() {
        let dir = TempDir::new().unwrap();
        let flaky = Arc::new(FlakyVisualizer {
            fail: AtomicBool::new(true),
        });
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let exec = executor(graph(Some(flaky.clone())), Arc::clone(&store), &dir);

        let snapshot = exec
            .run_to_completion(source(), "classify", Some("run-bad".to_string()), None)
            .await
            .unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        let last = snapshot.errors.last().unwrap();
        assert_eq!(last.phase, "execution");
        assert_eq!(last.error_type, "HandlerError");
        assert!(!last.recoverable);
        // output of the phases that succeeded is still visible
        assert!(snapshot.summaries.data_profile.is_some());
        assert!(snapshot.working_dir.exists());

        // the checkpoint still points at the failed phase
        let checkpoint = store.load("run-bad").await.unwrap().unwrap();
        assert_eq!(checkpoint.next_phase, Some(PhaseName::Visualizer));

        flaky.fail.store(false, Ordering::SeqCst);
        let resumed = exec.resume("run-bad").await.unwrap().wait().await.unwrap();
        assert_eq!(resumed.status, RunStatus::CompletedWithErrors);
        assert_eq!(resumed.summaries.critic_decisions.len(), 1);
    }

    #[tokio::test]
    async fn test_status_falls_back_to_metadata() {
        let dir = TempDir::new().unwrap();
        let exec = executor(graph(None), Arc::new(MemoryCheckpointStore::new()), &dir);
        exec.run_to_completion(source(), "classify", Some("run-old".to_string()), None)
            .await
            .unwrap();

        // a second executor over the same artifact directory has no live state
        let fresh = executor(graph(None), Arc::new(MemoryCheckpointStore::new()), &dir);
        let snapshot = fresh.status("run-old").await.unwrap().unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert!(fresh.status("unknown").await.unwrap().is_none());

        let listed = fresh.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].run_id, "run-old");
    }

    #[tokio::test]
    async fn test_resume_errors() {
        let dir = TempDir::new().unwrap();
        let exec = executor(graph(None), Arc::new(MemoryCheckpointStore::new()), &dir);
        assert!(matches!(exec.resume("ghost").await, Err(ExecutorError::RunNotFound(_))));

        exec.run_to_completion(source(), "classify", Some("done".to_string()), None)
            .await
            .unwrap();
        assert!(matches!(exec.resume("done").await, Err(ExecutorError::AlreadyFinished(_))));
    }

    #[tokio::test]
    async fn test_incomplete_graph_rejected() {
        let collaborators = Collaborators::new(Arc::new(CountingClient), Arc::new(NullSandbox));
        let result = RunExecutor::new(
            WorkflowGraph::new(collaborators),
            Arc::new(MemoryCheckpointStore::new()),
            ArtifactStore::new("/tmp/unused"),
        );
        assert!(matches!(result, Err(ExecutorError::Graph(GraphError::MissingHandler(_)))));
    }
}
