//! Durable record shapes shared by every store backend.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{GenerationId, Role, RunId};

/// The atomic durable unit of a thread's message log.
///
/// Records are append-only: once written they are never mutated, only removed
/// together with their thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedMessage {
    pub id: String,
    pub thread_id: String,
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<GenerationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_order_idx: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub message_type: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_agent: Option<String>,
    /// JSON-serialized message body.
    pub payload: String,
}

impl PersistedMessage {
    fn order_key(&self) -> (DateTime<Utc>, u32) {
        (self.timestamp, self.message_order_idx.unwrap_or(0))
    }

    /// Compare by `(timestamp, message_order_idx)`; a missing index counts as 0.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

/// Stable sort into canonical order. Equal keys keep insertion order.
pub fn sort_canonical(messages: &mut [PersistedMessage]) {
    messages.sort_by(PersistedMessage::canonical_cmp);
}

/// The single mutable record kept per thread. Always written whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadMetadata {
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_run_id: Option<RunId>,
    pub last_updated: DateTime<Utc>,
    /// External backend session id → run that session served.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_mappings: Option<BTreeMap<String, RunId>>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ThreadMetadata {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self::synthesized(thread_id, Utc::now())
    }

    /// Minimal record for a thread that has data but no stored metadata.
    pub fn synthesized(thread_id: impl Into<String>, last_updated: DateTime<Utc>) -> Self {
        Self {
            thread_id: thread_id.into(),
            current_run_id: None,
            latest_run_id: None,
            last_updated,
            session_mappings: None,
            properties: serde_json::Map::new(),
        }
    }

    /// Remember that `session_id` served `run_id`.
    pub fn map_session(&mut self, session_id: impl Into<String>, run_id: RunId) {
        self.session_mappings
            .get_or_insert_with(BTreeMap::new)
            .insert(session_id.into(), run_id);
    }

    /// Session that served `run_id`, if any was recorded.
    pub fn session_for_run(&self, run_id: RunId) -> Option<&str> {
        self.session_mappings.as_ref().and_then(|mappings| {
            mappings
                .iter()
                .find(|(_, mapped)| **mapped == run_id)
                .map(|(session, _)| session.as_str())
        })
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

/// Sort metadata newest first; ties broken by thread id for stable paging.
pub fn sort_by_recency(entries: &mut [ThreadMetadata]) {
    entries.sort_by(|a, b| {
        b.last_updated
            .cmp(&a.last_updated)
            .then_with(|| a.thread_id.cmp(&b.thread_id))
    });
}
