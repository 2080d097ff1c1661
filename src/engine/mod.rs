//! Run orchestration: one [`RunEngine`] per thread driving an [`AgentLoop`].

mod agent_loop;
mod runtime;
mod subscriber;
mod types;

pub use agent_loop::{AgentLoop, RunContext, StepEvent, StepInput, StepSignal, StepStream};
pub use runtime::RunEngine;
pub use subscriber::Subscription;
pub use types::{
    Delivery, EngineSnapshot, EngineState, RunAssignment, RunStatus, SendOptions, ThreadEvent,
};
