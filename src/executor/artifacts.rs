//! Durable per-run artifact storage.
//!
//! Layout under the base path:
//!
//! ```text
//! <base>/<run_id>/
//!     metadata.json
//!     model.joblib, *.pkl, *.json
//!     df_engineered.csv
//!     plots/*.png
//!     eval_plots/*.png
//! ```

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::status::RunSnapshot;
use crate::error::ArtifactError;

const METADATA_FILE: &str = "metadata.json";
const ENGINEERED_DATASET: &str = "df_engineered.csv";
const TOP_LEVEL_EXTENSIONS: &[&str] = &["joblib", "pkl", "json"];
const PLOT_DIRS: &[&str] = &["plots", "eval_plots"];
const MAX_RUN_ID_LEN: usize = 128;

/// Checks that a run id names a single directory under the store.
///
/// Ids are 1 to 128 ASCII letters, digits, `_`, `-` or `.`, and may not
/// start with `.`.
pub fn validate_run_id(run_id: &str) -> Result<(), ArtifactError> {
    let valid = !run_id.is_empty()
        && run_id.len() <= MAX_RUN_ID_LEN
        && !run_id.starts_with('.')
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ArtifactError::InvalidRunId(run_id.to_string()))
    }
}

/// File-based store holding one directory per run.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_path: PathBuf,
}

impl ArtifactStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Path of a run's directory, without creating it.
    pub fn run_path(&self, run_id: &str) -> Result<PathBuf, ArtifactError> {
        validate_run_id(run_id)?;
        Ok(self.base_path.join(run_id))
    }

    /// Returns the run's directory, creating it if needed.
    pub async fn run_dir(&self, run_id: &str) -> Result<PathBuf, ArtifactError> {
        let dir = self.run_path(run_id)?;
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Writes the final snapshot of a run as pretty-printed JSON.
    pub async fn save_metadata(
        &self,
        run_id: &str,
        snapshot: &RunSnapshot,
    ) -> Result<PathBuf, ArtifactError> {
        let path = self.run_dir(run_id).await?.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&path, json).await?;
        debug!(run_id, path = %path.display(), "Saved run metadata");
        Ok(path)
    }

    /// Reads a run's saved snapshot, if there is one.
    pub async fn load_metadata(&self, run_id: &str) -> Result<Option<RunSnapshot>, ArtifactError> {
        let path = self.run_path(run_id)?.join(METADATA_FILE);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Copies model files, plots and the engineered dataset out of a
    /// working directory. Returns the destination paths.
    ///
    /// Files that fail to copy are logged and skipped.
    pub async fn copy_from_working_dir(
        &self,
        run_id: &str,
        working_dir: &Path,
    ) -> Result<Vec<PathBuf>, ArtifactError> {
        let dest = self.run_dir(run_id).await?;
        let mut copied = Vec::new();

        for source in top_level_files(working_dir).await? {
            let Some(name) = source.file_name() else {
                continue;
            };
            let target = dest.join(name);
            if copy_file(&source, &target).await {
                copied.push(target);
            }
        }

        for dir in PLOT_DIRS {
            let source_dir = working_dir.join(dir);
            if !fs::try_exists(&source_dir).await.unwrap_or(false) {
                continue;
            }
            let target_dir = dest.join(dir);
            fs::create_dir_all(&target_dir).await?;
            let mut entries = fs::read_dir(&source_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if has_extension(&path, &["png"]) && entry.file_type().await?.is_file() {
                    let target = target_dir.join(entry.file_name());
                    if copy_file(&path, &target).await {
                        copied.push(target);
                    }
                }
            }
        }

        debug!(run_id, count = copied.len(), "Copied run artifacts");
        Ok(copied)
    }

    /// Every file stored for a run, relative to the run directory, sorted.
    pub async fn list_artifacts(&self, run_id: &str) -> Result<Vec<PathBuf>, ArtifactError> {
        let root = self.run_path(run_id)?;
        tokio::task::spawn_blocking(move || walk_files(&root))
            .await
            .map_err(|e| ArtifactError::Io(std::io::Error::other(e.to_string())))?
    }

    /// Run ids that have a directory in the store, sorted.
    pub async fn list_runs(&self) -> Result<Vec<String>, ArtifactError> {
        let mut runs = Vec::new();
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() && validate_run_id(&name).is_ok() {
                runs.push(name);
            }
        }
        runs.sort();
        Ok(runs)
    }
}

async fn top_level_files(dir: &Path) -> Result<Vec<PathBuf>, ArtifactError> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let is_dataset = path.file_name().is_some_and(|n| n == ENGINEERED_DATASET);
        if is_dataset || has_extension(&path, TOP_LEVEL_EXTENSIONS) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

async fn copy_file(source: &Path, target: &Path) -> bool {
    match fs::copy(source, target).await {
        Ok(_) => true,
        Err(e) => {
            warn!(source = %source.display(), error = %e, "Failed to copy artifact");
            false
        }
    }
}

fn walk_files(root: &Path) -> Result<Vec<PathBuf>, ArtifactError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            if let Ok(relative) = entry.path().strip_prefix(root) {
                files.push(relative.to_path_buf());
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::status::RunStatus;
    use crate::state::{DataFormat, DataSourceRef, RunState};
    use tempfile::TempDir;

    fn snapshot(run_id: &str) -> RunSnapshot {
        let state = RunState::new(
            run_id,
            "classify",
            DataSourceRef::new("/data/x.csv", DataFormat::Csv, 10),
            "/tmp/x",
            3,
        );
        RunSnapshot::from_state(&state, RunStatus::Completed)
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let base = TempDir::new().unwrap();
        let store = ArtifactStore::new(base.path());

        assert!(store.load_metadata("r1").await.unwrap().is_none());
        // a lookup must not create the directory
        assert!(!base.path().join("r1").exists());

        let path = store.save_metadata("r1", &snapshot("r1")).await.unwrap();
        assert!(path.ends_with("r1/metadata.json"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n  \"run_id\""));

        let loaded = store.load_metadata("r1").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.run_id, "r1");
    }

    #[tokio::test]
    async fn test_copy_from_working_dir_selects_artifacts() {
        let base = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let w = work.path();
        std::fs::write(w.join("model.joblib"), b"m").unwrap();
        std::fs::write(w.join("scaler.pkl"), b"s").unwrap();
        std::fs::write(w.join("results.json"), b"{}").unwrap();
        std::fs::write(w.join("df_engineered.csv"), b"a,b").unwrap();
        std::fs::write(w.join("data.csv"), b"raw").unwrap();
        std::fs::write(w.join("_run.py"), b"print(1)").unwrap();
        std::fs::create_dir(w.join("plots")).unwrap();
        std::fs::write(w.join("plots/hist.png"), b"png").unwrap();
        std::fs::write(w.join("plots/notes.txt"), b"x").unwrap();
        std::fs::create_dir(w.join("eval_plots")).unwrap();
        std::fs::write(w.join("eval_plots/roc.png"), b"png").unwrap();

        let store = ArtifactStore::new(base.path());
        let copied = store.copy_from_working_dir("r1", w).await.unwrap();
        assert_eq!(copied.len(), 6);

        let listed = store.list_artifacts("r1").await.unwrap();
        let names: Vec<String> = listed.iter().map(|p| p.display().to_string()).collect();
        assert_eq!(
            names,
            vec![
                "df_engineered.csv",
                "eval_plots/roc.png",
                "model.joblib",
                "plots/hist.png",
                "results.json",
                "scaler.pkl",
            ]
        );
    }

    #[tokio::test]
    async fn test_list_runs_and_missing_run() {
        let base = TempDir::new().unwrap();
        let store = ArtifactStore::new(base.path().join("nested"));
        assert!(store.list_runs().await.unwrap().is_empty());
        assert!(store.list_artifacts("ghost").await.unwrap().is_empty());

        store.run_dir("b").await.unwrap();
        store.run_dir("a").await.unwrap();
        assert_eq!(store.list_runs().await.unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_validate_run_id() {
        let longest = "a".repeat(128);
        let too_long = "a".repeat(129);
        for ok in ["r1", "run-ok", "3f2a_b.v2", longest.as_str()] {
            assert!(validate_run_id(ok).is_ok(), "{}", ok);
        }
        for bad in ["", ".", "..", "../x", "a/b", "/etc", ".hidden", "a\\b", "run id", too_long.as_str()] {
            assert!(
                matches!(validate_run_id(bad), Err(ArtifactError::InvalidRunId(_))),
                "{}",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_traversing_run_id_touches_nothing_outside_base() {
        let root = TempDir::new().unwrap();
        let store = ArtifactStore::new(root.path().join("artifacts"));

        assert!(matches!(
            store.save_metadata("../escaped", &snapshot("../escaped")).await,
            Err(ArtifactError::InvalidRunId(_))
        ));
        assert!(!root.path().join("escaped").exists());
        assert!(store.load_metadata("../../etc").await.is_err());
        assert!(store.list_artifacts("..").await.is_err());

        // stray directories that are not run ids are not listed
        std::fs::create_dir_all(root.path().join("artifacts/.cache")).unwrap();
        store.run_dir("kept").await.unwrap();
        assert_eq!(store.list_runs().await.unwrap(), vec!["kept"]);
    }
}
