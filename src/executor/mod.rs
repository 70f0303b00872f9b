//! Run execution.
//!
//! - [`RunExecutor`]: submits runs, drives them through the graph and
//!   answers status queries
//! - [`StatusProjection`]: the live, concurrently readable snapshot map
//! - [`ArtifactStore`]: durable per-run artifact directories
//! - [`summary`]: bounded per-phase summaries shown in status

pub mod artifacts;
pub mod run;
pub mod status;
pub mod summary;

pub use artifacts::ArtifactStore;
pub use run::{RunExecutor, RunHandle};
pub use status::{RunSnapshot, RunStatus, StatusProjection};
pub use summary::{normalize_candidate, CandidateSummary, PhaseSummaries};
