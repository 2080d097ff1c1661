//! Core types for Threadline.

pub mod message;
pub mod record;

pub use message::*;
pub use record::*;

use uuid::Uuid;

/// Unique run identifier.
pub type RunId = Uuid;

/// Identifier of one turn's batch of messages within a run.
pub type GenerationId = Uuid;
