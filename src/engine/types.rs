//! Run engine value types.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::types::{AgentMessage, RunId};

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Engine-level state, observable through [`super::RunEngine::watch_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No run in progress; ready to accept input.
    Idle,
    /// A run is executing.
    Running,
    /// The engine was disposed and rejects further input.
    Disposed,
}

/// How submitted input was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// A new run was started for it.
    Started,
    /// Handed to the live run through the loop's injection path.
    Injected,
    /// Queued for the active run's next step.
    Queued,
}

/// Correlates a caller's input with the run that will process it.
///
/// Returned synchronously from [`super::RunEngine::send`]; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAssignment {
    pub input_id: String,
    pub run_id: RunId,
    pub delivery: Delivery,
}

/// Optional knobs for [`super::RunEngine::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Caller correlation id; generated when absent.
    pub input_id: Option<String>,
    /// Branch from this run instead of the thread's latest run.
    pub parent_run_id: Option<RunId>,
    /// Cancels the run that processes this input.
    pub cancel: Option<CancellationToken>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input_id(mut self, input_id: impl Into<String>) -> Self {
        self.input_id = Some(input_id.into());
        self
    }

    pub fn with_parent_run(mut self, parent_run_id: RunId) -> Self {
        self.parent_run_id = Some(parent_run_id);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// What subscribers receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThreadEvent {
    RunStarted {
        run_id: RunId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<RunId>,
    },
    /// Input was persisted and routed to `run_id`.
    InputAccepted {
        input_id: String,
        run_id: RunId,
        delivery: Delivery,
    },
    /// A persisted output message.
    Message { message: AgentMessage },
    /// Terminal control message for a run.
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Point-in-time view of an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub current_run_id: Option<RunId>,
    pub latest_run_id: Option<RunId>,
    pub queued_inputs: usize,
    pub message_count: usize,
    pub subscriber_count: usize,
}
