//! The phase handler seam.

use async_trait::async_trait;
use std::sync::Arc;

use super::phase::PhaseName;
use crate::error::GraphError;
use crate::llm::CodeGenClient;
use crate::sandbox::CodeSandbox;
use crate::state::{RunState, StateDelta};

/// Services a handler may call.
#[derive(Clone)]
pub struct Collaborators {
    pub client: Arc<dyn CodeGenClient>,
    pub sandbox: Arc<dyn CodeSandbox>,
}

impl Collaborators {
    pub fn new(client: Arc<dyn CodeGenClient>, sandbox: Arc<dyn CodeSandbox>) -> Self {
        Self { client, sandbox }
    }
}

/// One node of the workflow graph.
///
/// A handler reads the state and returns the fields it changed. Failures it
/// can recover from are recorded as `PhaseError`s in the delta; an `Err`
/// aborts the run. Handlers never change the working directory.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    fn name(&self) -> PhaseName;

    async fn run(&self, state: &RunState, ctx: &Collaborators) -> Result<StateDelta, GraphError>;
}
