//! Threadline: durable, branching agent conversations.
//!
//! Runs long-lived conversational agents whose reasoning lives in an external
//! backend, persists every exchanged message, and fans live output out to any
//! number of independent subscribers.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use threadline::prelude::*;
//! use threadline::process::{ProcessAgentLoop, ProcessMode, StdioBackendClient};
//!
//! # async fn example() -> threadline::error::Result<()> {
//! let config = ThreadlineConfig::from_env()?;
//! let store = threadline::store::open(&config.store).await?;
//! let agent = ProcessAgentLoop::from_config(
//!     ProcessMode::Interactive,
//!     Arc::new(|| Box::new(StdioBackendClient::new("my-backend", vec![])) as Box<dyn BackendClient>),
//!     &config.engine,
//! );
//! let engine = RunEngine::open("support-42", store, agent, &config.engine).await?;
//! let mut events = engine.subscribe();
//! engine.send(vec![AgentMessage::user("Hello!")], SendOptions::new()).await?;
//! while let Some(event) = events.recv().await {
//!     if let ThreadEvent::RunFinished { .. } = event {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod prelude;
pub mod process;
pub mod store;
pub mod types;

#[cfg(feature = "cli")]
pub mod cli;
