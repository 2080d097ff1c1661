//! The injected step function and its contract with the engine.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use super::types::RunStatus;
use crate::error::Result;
use crate::types::{AgentMessage, GenerationId, RunId, ThreadMetadata};

/// What the engine should do once a step's stream is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSignal {
    /// Step again within the same run, even without new input.
    Continue,
    /// The run may complete once queued input is drained.
    Stop,
    /// Complete this run and start a sibling sharing its parent.
    Branch,
}

/// Items pulled from a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    /// Output to append and publish.
    Message(AgentMessage),
    /// The backend bound this run to an external session.
    SessionBound { session_id: String },
    /// Terminal sentinel. A stream ending without it counts as `Stop`.
    Finished(StepSignal),
}

/// Pull-based output of one step.
pub type StepStream = BoxStream<'static, Result<StepEvent>>;

/// Everything a step gets to see.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub thread_id: String,
    pub run_id: RunId,
    pub parent_run_id: Option<RunId>,
    pub generation_id: GenerationId,
    /// Messages of the run's ancestor chain, oldest first, without `pending`.
    pub history: Vec<AgentMessage>,
    /// Input not yet seen by the loop.
    pub pending: Vec<AgentMessage>,
    /// First step of this run.
    pub first_step: bool,
}

/// Run identity handed to lifecycle hooks.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub thread_id: String,
    pub run_id: RunId,
    pub parent_run_id: Option<RunId>,
    pub metadata: ThreadMetadata,
}

/// A concrete agent type plugged into [`super::RunEngine`].
///
/// `prepare_run`, `finish_run`, `inject` and `shutdown` are always invoked
/// while the engine holds its restart lock, so implementations never see two
/// of them race for the same thread.
#[async_trait]
pub trait AgentLoop: Send + Sync + 'static {
    /// Produce the output of one turn.
    ///
    /// Implementations must stop promptly once `cancel` fires.
    async fn step(&self, input: StepInput, cancel: CancellationToken) -> Result<StepStream>;

    /// Whether input may be handed to a run that is already executing.
    fn supports_injection(&self) -> bool {
        false
    }

    /// Deliver input to the live run. `Ok(false)` asks the engine to queue it.
    async fn inject(&self, _messages: &[AgentMessage]) -> Result<bool> {
        Ok(false)
    }

    /// Called before the first step of a run.
    async fn prepare_run(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    /// Called once a run reaches a terminal status.
    async fn finish_run(&self, _ctx: &RunContext, _status: RunStatus) -> Result<()> {
        Ok(())
    }

    /// Release every resource held by the loop.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
