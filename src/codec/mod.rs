//! Conversion between [`AgentMessage`] and [`PersistedMessage`].
//!
//! Encoding always assigns a fresh record id and a microsecond-precision
//! timestamp; there is no deduplication here. Decoding dispatches on
//! `message_type` through a [`MessageRegistry`]; an unregistered tag or an
//! unparseable payload is an error, never a silent fallback.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{SubsecRound, Utc};
use uuid::Uuid;

use crate::error::{Result, ThreadlineError};
use crate::types::{AgentMessage, Lineage, MessageBody, PersistedMessage, RunId};

/// Decodes a JSON payload into a concrete body shape.
pub type BodyDecoder = fn(serde_json::Value) -> Result<MessageBody>;

static BUILTIN_REGISTRY: OnceLock<MessageRegistry> = OnceLock::new();

/// Tag → decoder table used by [`from_persisted`].
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    decoders: HashMap<String, BodyDecoder>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl MessageRegistry {
    /// Registry with no tags.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registry covering every [`MessageBody`] variant.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(MessageBody::TEXT, |v| {
            Ok(MessageBody::Text(serde_json::from_value(v)?))
        });
        registry.register(MessageBody::IMAGE, |v| {
            Ok(MessageBody::Image(serde_json::from_value(v)?))
        });
        registry.register(MessageBody::TOOL_CALL, |v| {
            Ok(MessageBody::ToolCall(serde_json::from_value(v)?))
        });
        registry.register(MessageBody::TOOL_RESULT, |v| {
            Ok(MessageBody::ToolResult(serde_json::from_value(v)?))
        });
        registry.register(MessageBody::REASONING, |v| {
            Ok(MessageBody::Reasoning(serde_json::from_value(v)?))
        });
        registry.register(MessageBody::ERROR, |v| {
            Ok(MessageBody::Error(serde_json::from_value(v)?))
        });
        registry
    }

    /// Shared instance of [`MessageRegistry::builtin`].
    pub fn global() -> &'static MessageRegistry {
        BUILTIN_REGISTRY.get_or_init(Self::builtin)
    }

    /// Add or replace the decoder for `tag`.
    pub fn register(&mut self, tag: impl Into<String>, decoder: BodyDecoder) {
        self.decoders.insert(tag.into(), decoder);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Decode a raw payload string for the given tag.
    pub fn decode(&self, tag: &str, payload: &str) -> Result<MessageBody> {
        let decoder = self
            .decoders
            .get(tag)
            .ok_or_else(|| ThreadlineError::UnknownMessageType(tag.to_string()))?;
        let value: serde_json::Value = serde_json::from_str(payload)?;
        decoder(value)
    }

    /// Rebuild the in-memory message from a record.
    pub fn from_persisted(&self, record: &PersistedMessage) -> Result<AgentMessage> {
        let body = self.decode(&record.message_type, &record.payload)?;
        Ok(AgentMessage {
            id: Some(record.id.clone()),
            role: record.role,
            body,
            from_agent: record.from_agent.clone(),
            timestamp: Some(record.timestamp),
            lineage: Lineage {
                run_id: Some(record.run_id),
                parent_run_id: record.parent_run_id,
                generation_id: record.generation_id,
                message_order_idx: record.message_order_idx,
            },
        })
    }

    pub fn from_persisted_batch(&self, records: &[PersistedMessage]) -> Result<Vec<AgentMessage>> {
        records.iter().map(|r| self.from_persisted(r)).collect()
    }
}

/// Encode a message for `thread_id`.
///
/// Lineage carried by the message wins; `run_id` is the fallback.
pub fn to_persisted(
    message: &AgentMessage,
    thread_id: &str,
    run_id: RunId,
) -> Result<PersistedMessage> {
    let payload = serde_json::to_string(&message.body)?;
    Ok(PersistedMessage {
        id: Uuid::new_v4().to_string(),
        thread_id: thread_id.to_string(),
        run_id: message.lineage.run_id.unwrap_or(run_id),
        parent_run_id: message.lineage.parent_run_id,
        generation_id: message.lineage.generation_id,
        message_order_idx: message.lineage.message_order_idx,
        timestamp: Utc::now().trunc_subsecs(6),
        message_type: message.message_type().to_string(),
        role: message.role,
        from_agent: message.from_agent.clone(),
        payload,
    })
}

/// Encode a batch, keeping order.
///
/// Messages without an explicit `message_order_idx` get their batch position.
pub fn to_persisted_batch(
    messages: &[AgentMessage],
    thread_id: &str,
    run_id: RunId,
) -> Result<Vec<PersistedMessage>> {
    messages
        .iter()
        .enumerate()
        .map(|(idx, message)| {
            let mut record = to_persisted(message, thread_id, run_id)?;
            if record.message_order_idx.is_none() {
                record.message_order_idx = Some(idx as u32);
            }
            Ok(record)
        })
        .collect()
}

/// Decode with the built-in registry.
pub fn from_persisted(record: &PersistedMessage) -> Result<AgentMessage> {
    MessageRegistry::global().from_persisted(record)
}

/// Decode a batch with the built-in registry, keeping order.
pub fn from_persisted_batch(records: &[PersistedMessage]) -> Result<Vec<AgentMessage>> {
    MessageRegistry::global().from_persisted_batch(records)
}
