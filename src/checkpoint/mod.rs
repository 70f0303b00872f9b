//! Checkpoint persistence.
//!
//! A checkpoint holds the latest merged state of a run together with the
//! graph cursor (the next phase to run). The executor writes one after every
//! phase; [`crate::executor::RunExecutor::resume`] reads it back.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

use crate::config::{CheckpointBackend, Settings};
use crate::error::CheckpointError;
use crate::graph::PhaseName;
use crate::state::RunState;

/// Latest persisted position of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub state: RunState,
    /// Phase to run next; `None` once the graph reached its terminal state.
    pub next_phase: Option<PhaseName>,
    /// Number of phases merged so far. Saves never move this backwards.
    pub step: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(state: RunState, next_phase: Option<PhaseName>, step: u64) -> Self {
        Self {
            run_id: state.run_id.clone(),
            state,
            next_phase,
            step,
            updated_at: Utc::now(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.next_phase.is_none()
    }
}

/// Keyed storage of the latest checkpoint per run.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Stores `checkpoint`, replacing an older one for the same run.
    ///
    /// A checkpoint with a lower step than the stored one is ignored.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Run ids with a stored checkpoint, oldest update first.
    async fn list(&self) -> Result<Vec<String>, CheckpointError>;

    fn backend_name(&self) -> &'static str;
}

/// Opens the backend selected by `settings`.
pub async fn open_store(settings: &Settings) -> Result<Arc<dyn CheckpointStore>, CheckpointError> {
    let store: Arc<dyn CheckpointStore> = match settings.checkpoint_backend {
        CheckpointBackend::Memory => Arc::new(MemoryCheckpointStore::new()),
        CheckpointBackend::Sqlite => {
            Arc::new(SqliteCheckpointStore::open_dir(&settings.checkpoint_path).await?)
        }
    };
    tracing::info!(backend = store.backend_name(), "Checkpoint store ready");
    Ok(store)
}
