//! Backend client contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{AgentMessage, RunId};

/// Parameters for opening a backend session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub thread_id: String,
    pub run_id: RunId,
    /// Resume this external session instead of starting from scratch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session: Option<String>,
}

/// Events read from a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    Message {
        message: AgentMessage,
    },
    /// The backend announced (or changed) its session id.
    Session {
        session_id: String,
    },
    /// End of one turn. Never persisted.
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

pub type BackendEventStream = BoxStream<'static, Result<BackendEvent>>;

/// A connection to an external reasoning backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Open the session. Called once per client.
    async fn start(&mut self, request: SessionRequest) -> Result<()>;

    async fn send(&self, messages: Vec<AgentMessage>) -> Result<()>;

    /// Events produced from now on. The stream ends when the connection does.
    fn subscribe(&self) -> Result<BackendEventStream>;

    /// Ask the backend to exit, forcing it after `timeout`.
    async fn shutdown(&mut self, timeout: Duration) -> Result<()>;

    fn is_alive(&self) -> bool;

    fn current_session(&self) -> Option<String>;
}

/// Creates a fresh, unstarted client for each connection attempt.
pub type ClientFactory = Arc<dyn Fn() -> Box<dyn BackendClient> + Send + Sync>;
