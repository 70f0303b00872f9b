//! SQLite-backed checkpoint store.
//!
//! One row per run holding the state as JSON. Schema changes are applied by
//! [`SqliteCheckpointStore::run_migrations`], tracked in a `_migrations`
//! table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use super::{Checkpoint, CheckpointStore};
use crate::error::CheckpointError;
use crate::graph::PhaseName;

/// File name of the database inside the checkpoint directory.
pub const DATABASE_FILE: &str = "checkpoints.db";

const MIGRATIONS: &[(&str, &str)] = &[(
    "checkpoints_v1",
    r#"
    CREATE TABLE IF NOT EXISTS checkpoints (
        run_id TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        next_phase TEXT,
        step INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
)];

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Opens (creating if needed) `checkpoints.db` inside `dir`.
    pub async fn open_dir(dir: &Path) -> Result<Self, CheckpointError> {
        tokio::fs::create_dir_all(dir).await?;
        let options = SqliteConnectOptions::new()
            .filename(dir.join(DATABASE_FILE))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| CheckpointError::ConnectionFailed(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// A private in-memory database.
    pub async fn in_memory() -> Result<Self, CheckpointError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| CheckpointError::ConnectionFailed(e.to_string()))?;

        // Each connection to :memory: is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| CheckpointError::ConnectionFailed(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Applies pending migrations. Safe to run repeatedly.
    pub async fn run_migrations(&self) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for &(name, sql) in MIGRATIONS {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM _migrations WHERE name = ?1")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await?;
            if applied.is_some() {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            sqlx::query(sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO _migrations (name, applied_at) VALUES (?1, ?2)")
                .bind(name)
                .bind(Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::debug!(migration = name, "Applied checkpoint migration");
        }

        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let state = serde_json::to_string(&checkpoint.state)?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints (run_id, state, next_phase, step, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(run_id) DO UPDATE SET
                state = excluded.state,
                next_phase = excluded.next_phase,
                step = excluded.step,
                updated_at = excluded.updated_at
            WHERE excluded.step >= checkpoints.step
            "#,
        )
        .bind(&checkpoint.run_id)
        .bind(state)
        .bind(checkpoint.next_phase.map(|p| p.as_str()))
        .bind(checkpoint.step as i64)
        .bind(checkpoint.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = sqlx::query(
            "SELECT run_id, state, next_phase, step, updated_at FROM checkpoints WHERE run_id = ?1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let corrupt = |reason: String| CheckpointError::Corrupt {
            run_id: run_id.to_string(),
            reason,
        };

        let state: String = row.try_get("state")?;
        let next_phase: Option<String> = row.try_get("next_phase")?;
        let step: i64 = row.try_get("step")?;
        let updated_at: String = row.try_get("updated_at")?;

        let next_phase = next_phase
            .map(|p| PhaseName::from_str(&p))
            .transpose()
            .map_err(corrupt)?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| corrupt(format!("bad timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(Some(Checkpoint {
            run_id: row.try_get("run_id")?,
            state: serde_json::from_str(&state)?,
            next_phase,
            step: step.max(0) as u64,
            updated_at,
        }))
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT run_id FROM checkpoints ORDER BY updated_at")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
