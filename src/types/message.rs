//! Universal in-memory message model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{GenerationId, RunId};

/// Conversation role.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Shape of a message. The serde tag doubles as the persisted `message_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text(TextContent),
    Image(ImageContent),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Reasoning(TextContent),
    Error(ErrorContent),
}

impl MessageBody {
    pub const TEXT: &'static str = "text";
    pub const IMAGE: &'static str = "image";
    pub const TOOL_CALL: &'static str = "tool_call";
    pub const TOOL_RESULT: &'static str = "tool_result";
    pub const REASONING: &'static str = "reasoning";
    pub const ERROR: &'static str = "error";

    /// The discriminator stored as `message_type`.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Text(_) => Self::TEXT,
            Self::Image(_) => Self::IMAGE,
            Self::ToolCall(_) => Self::TOOL_CALL,
            Self::ToolResult(_) => Self::TOOL_RESULT,
            Self::Reasoning(_) => Self::REASONING,
            Self::Error(_) => Self::ERROR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextContent {
    pub text: String,
}

/// Image content embedded in a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageContent {
    pub data: String,
    pub mime_type: String,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A tool execution result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub result: serde_json::Value,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorContent {
    pub message: String,
}

/// Run/generation placement of a message.
///
/// Lives outside the payload: the codec copies these into record columns.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lineage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<GenerationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_order_idx: Option<u32>,
}

/// A message exchanged with an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    /// Persisted record id, present once the message has been stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub body: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lineage: Lineage,
}

impl AgentMessage {
    pub fn new(role: Role, body: MessageBody) -> Self {
        Self {
            id: None,
            role,
            body,
            from_agent: None,
            timestamp: None,
            lineage: Lineage::default(),
        }
    }

    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, MessageBody::Text(TextContent { text: text.into() }))
    }

    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, MessageBody::Text(TextContent { text: text.into() }))
    }

    /// Create an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(
            Role::Assistant,
            MessageBody::Text(TextContent { text: text.into() }),
        )
    }

    /// Create an assistant reasoning message.
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::new(
            Role::Assistant,
            MessageBody::Reasoning(TextContent { text: text.into() }),
        )
    }

    /// Create an assistant tool call.
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self::new(
            Role::Assistant,
            MessageBody::ToolCall(ToolCall {
                id: id.into(),
                name: name.into(),
                arguments,
            }),
        )
    }

    /// Create a tool result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        result: serde_json::Value,
        is_error: bool,
    ) -> Self {
        Self::new(
            Role::Tool,
            MessageBody::ToolResult(ToolResult {
                tool_call_id: tool_call_id.into(),
                result,
                is_error,
            }),
        )
    }

    /// Create an error notice attributed to the assistant side.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            Role::Assistant,
            MessageBody::Error(ErrorContent {
                message: message.into(),
            }),
        )
    }

    pub fn with_from_agent(mut self, agent: impl Into<String>) -> Self {
        self.from_agent = Some(agent.into());
        self
    }

    pub fn with_lineage(mut self, lineage: Lineage) -> Self {
        self.lineage = lineage;
        self
    }

    /// Shape discriminator of the body.
    pub fn message_type(&self) -> &'static str {
        self.body.type_tag()
    }

    /// Text of a text or reasoning body; empty for other shapes.
    pub fn text(&self) -> &str {
        match &self.body {
            MessageBody::Text(content) | MessageBody::Reasoning(content) => &content.text,
            MessageBody::Error(content) => &content.message,
            _ => "",
        }
    }
}
