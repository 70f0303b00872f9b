//! In-process checkpoint store. Lost when the process exits.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{Checkpoint, CheckpointStore};
use crate::error::CheckpointError;

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut checkpoints = self.checkpoints.write().await;
        match checkpoints.get(&checkpoint.run_id) {
            Some(existing) if existing.step > checkpoint.step => {}
            _ => {
                checkpoints.insert(checkpoint.run_id.clone(), checkpoint.clone());
            }
        }
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.read().await.get(run_id).cloned())
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let checkpoints = self.checkpoints.read().await;
        let mut entries: Vec<&Checkpoint> = checkpoints.values().collect();
        entries.sort_by_key(|c| c.updated_at);
        Ok(entries.into_iter().map(|c| c.run_id.clone()).collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PhaseName;
    use crate::state::{DataFormat, DataSourceRef, RunState};

    fn state(id: &str) -> RunState {
        RunState::new(id, "o", DataSourceRef::new("/d.csv", DataFormat::Csv, 1), "/tmp/x", 3)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load("a").await.unwrap().is_none());

        store
            .save(&Checkpoint::new(state("a"), Some(PhaseName::FeatureEngineer), 1))
            .await
            .unwrap();
        let loaded = store.load("a").await.unwrap().unwrap();
        assert_eq!(loaded.next_phase, Some(PhaseName::FeatureEngineer));
        assert!(!loaded.is_finished());
    }

    #[tokio::test]
    async fn test_stale_step_is_ignored() {
        let store = MemoryCheckpointStore::new();
        store
            .save(&Checkpoint::new(state("a"), Some(PhaseName::Evaluator), 4))
            .await
            .unwrap();
        store
            .save(&Checkpoint::new(state("a"), Some(PhaseName::Visualizer), 2))
            .await
            .unwrap();
        let loaded = store.load("a").await.unwrap().unwrap();
        assert_eq!(loaded.step, 4);
        assert_eq!(loaded.next_phase, Some(PhaseName::Evaluator));
    }

    #[tokio::test]
    async fn test_list() {
        let store = MemoryCheckpointStore::new();
        store.save(&Checkpoint::new(state("a"), None, 6)).await.unwrap();
        store.save(&Checkpoint::new(state("b"), None, 6)).await.unwrap();
        let mut ids = store.list().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
