//! Live status projection for runs.
//!
//! One [`RunSnapshot`] per run, replaced whole on every update so readers
//! never see half of a phase transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::RwLock;

use super::summary::PhaseSummaries;
use crate::llm::TokenUsage;
use crate::state::{Phase, PhaseError, RunState};
use crate::utils::truncate_chars;

const OBJECTIVE_DISPLAY_LIMIT: usize = 100;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::Failed => "failed",
        }
    }

    /// True once the run has left the graph.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::CompletedWithErrors | RunStatus::Failed
        )
    }

    /// Status for a run that reached the end of the graph.
    pub fn finished(has_errors: bool) -> Self {
        if has_errors {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a status query returns for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    /// Truncated for display.
    pub objective: String,
    pub current_phase: Phase,
    pub phase_timings: BTreeMap<String, f64>,
    pub loop_count: u32,
    pub max_loops: u32,
    pub errors: Vec<PhaseError>,
    #[serde(flatten)]
    pub summaries: PhaseSummaries,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    pub working_dir: PathBuf,
    pub updated_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn from_state(state: &RunState, status: RunStatus) -> Self {
        Self {
            run_id: state.run_id.clone(),
            status,
            objective: truncate_chars(&state.objective, OBJECTIVE_DISPLAY_LIMIT),
            current_phase: state.current_phase,
            phase_timings: state.phase_timings.clone(),
            loop_count: state.loop_count,
            max_loops: state.max_loops,
            errors: state.errors.clone(),
            summaries: PhaseSummaries::from_state(state),
            token_usage: None,
            working_dir: state.working_dir.clone(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_token_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }
}

/// Concurrently readable map of run id to latest snapshot.
#[derive(Debug, Default)]
pub struct StatusProjection {
    runs: RwLock<HashMap<String, RunSnapshot>>,
}

impl StatusProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot for a run.
    pub async fn publish(&self, snapshot: RunSnapshot) {
        let mut runs = self.runs.write().await;
        runs.insert(snapshot.run_id.clone(), snapshot);
    }

    /// Publishes the state of a run under the given status.
    pub async fn update(&self, state: &RunState, status: RunStatus) {
        self.publish(RunSnapshot::from_state(state, status)).await;
    }

    /// Changes the status of a run, keeping everything else.
    pub async fn set_status(&self, run_id: &str, status: RunStatus) -> bool {
        let mut runs = self.runs.write().await;
        match runs.get_mut(run_id) {
            Some(snapshot) => {
                snapshot.status = status;
                snapshot.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, run_id: &str) -> Option<RunSnapshot> {
        self.runs.read().await.get(run_id).cloned()
    }

    pub async fn contains(&self, run_id: &str) -> bool {
        self.runs.read().await.contains_key(run_id)
    }

    /// All snapshots, oldest update first.
    pub async fn list(&self) -> Vec<RunSnapshot> {
        let mut all: Vec<RunSnapshot> = self.runs.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.run_id.cmp(&b.run_id)));
        all
    }
}
