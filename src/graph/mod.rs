//! The workflow graph.
//!
//! - [`PhaseName`]: the six phase identities and their forward order
//! - [`PhaseHandler`]: the trait each phase implements
//! - [`route_after_review`]: the conditional edge after the critic
//! - [`WorkflowGraph`]: handler registry and the per-phase event stream

pub mod handler;
pub mod phase;
pub mod router;
pub mod workflow;

pub use handler::{Collaborators, PhaseHandler};
pub use phase::PhaseName;
pub use router::{route_after_review, Route};
pub use workflow::{to_mermaid, GraphEvent, WorkflowGraph};
