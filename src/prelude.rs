//! Convenience re-exports for common use.

pub use crate::config::{EngineConfig, StoreConfig, ThreadlineConfig};
pub use crate::engine::{
    AgentLoop, RunAssignment, RunEngine, RunStatus, SendOptions, StepEvent, StepInput,
    StepSignal, StepStream, Subscription, ThreadEvent,
};
pub use crate::error::{Result, ThreadlineError};
pub use crate::process::BackendClient;
pub use crate::store::ConversationStore;
pub use crate::types::{AgentMessage, MessageBody, PersistedMessage, Role, ThreadMetadata};
