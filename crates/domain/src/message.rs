//! Conversation data model.
//!
//! Messages are append-only from the turn engine's perspective; the
//! physical store may truncate from the head when the window limit is
//! exceeded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Tool,
}

/// One entry in a session's conversation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,

    /// Tool calls the model requested in this message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRecord>>,

    /// The raw tool output, present on `Role::Tool` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_response: Option<Value>,

    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self::new(Role::Model, content)
    }

    /// A tool-result message correlated to a call via the record.
    pub fn tool(record: ToolCallRecord, response: Value) -> Self {
        Self {
            role: Role::Tool,
            content: String::new(),
            tool_calls: Some(vec![record]),
            tool_response: Some(response),
            timestamp: Utc::now(),
        }
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_response: None,
            timestamp: Utc::now(),
        }
    }

    /// Approximate token count used for context budgeting: `ceil(len/4)`
    /// over the text plus the JSON-stringified structured fields.
    pub fn approx_tokens(&self) -> usize {
        let mut chars = self.content.len();
        if let Some(calls) = &self.tool_calls {
            chars += serde_json::to_string(calls).map(|s| s.len()).unwrap_or(0);
        }
        if let Some(resp) = &self.tool_response {
            chars += serde_json::to_string(resp).map(|s| s.len()).unwrap_or(0);
        }
        chars.div_ceil(4)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool call records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle of a model-initiated tool call as it moves through the
/// approval gate and execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    PendingApproval,
    Approved,
    Rejected,
    Running,
    Done,
    Failed,
}

/// A model-initiated tool invocation, resolved to its owning server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    /// Server-unique correlation id.
    pub call_id: String,
    pub server_name: String,
    pub original_name: String,
    pub args: Value,
    pub state: ToolCallState,
}

impl ToolCallRecord {
    pub fn new(
        call_id: impl Into<String>,
        server_name: impl Into<String>,
        original_name: impl Into<String>,
        args: Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            server_name: server_name.into(),
            original_name: original_name.into(),
            args,
            state: ToolCallState::PendingApproval,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
