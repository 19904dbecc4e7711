//! Typed events.
//!
//! Three event families cross component boundaries: client-facing events
//! emitted by the turn engine, registry change events, and health-state
//! transitions. Each is a complete-payload enum sent over a typed channel;
//! there is no string-keyed bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outbound events delivered to the client socket.
///
/// The wire names and payload fields are a stable contract with the
/// transport server; see the serialization tests below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    #[serde(rename = "ready", rename_all = "camelCase")]
    Ready {
        session_id: String,
        sandbox_id: String,
        provider: String,
        model: String,
    },

    #[serde(rename = "thinking")]
    Thinking,

    #[serde(rename = "response")]
    Response { text: String },

    #[serde(rename = "approvalRequired", rename_all = "camelCase")]
    ApprovalRequired {
        call_id: String,
        server_name: String,
        tool_name: String,
        args: Value,
        /// 1-based position within the turn's approval queue.
        position: usize,
        total: usize,
    },

    #[serde(rename = "toolOutput", rename_all = "camelCase")]
    ToolOutput { call_id: String, output: Value },

    #[serde(rename = "error")]
    Error { code: String, message: String },

    #[serde(rename = "system:message")]
    SystemMessage { text: String },
}

/// Inbound messages from the client socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum ClientCommand {
    #[serde(rename = "message")]
    Message { text: String },

    #[serde(rename = "approval", rename_all = "camelCase")]
    Approval { call_id: String, approved: bool },

    #[serde(rename = "history:reset")]
    HistoryReset,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Emitted by the registry on every configuration mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RegistryEvent {
    Added { name: String },
    Removed { name: String },
    Updated { name: String },
    Enabled { name: String },
    Disabled { name: String },
    Settings,
    Reloaded,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Reconnecting,
    Disconnected,
}

/// Per-server health record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealth {
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ServerHealth {
    /// Initial state on first successful connect.
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_check: None,
            last_success: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Emitted on every health-state transition of a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthEvent {
    pub server: String,
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_required_wire_shape() {
        let event = ClientEvent::ApprovalRequired {
            call_id: "c1".into(),
            server_name: "fs".into(),
            tool_name: "read_file".into(),
            args: serde_json::json!({ "p": "/a" }),
            position: 1,
            total: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "approvalRequired");
        assert_eq!(json["payload"]["callId"], "c1");
        assert_eq!(json["payload"]["serverName"], "fs");
        assert_eq!(json["payload"]["toolName"], "read_file");
        assert_eq!(json["payload"]["position"], 1);
        assert_eq!(json["payload"]["total"], 3);
    }

    #[test]
    fn system_message_wire_name() {
        let event = ClientEvent::SystemMessage { text: "hi".into() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "system:message");
    }

    #[test]
    fn ready_event_payload_is_camel_case() {
        let event = ClientEvent::Ready {
            session_id: "alpha".into(),
            sandbox_id: "sb-1".into(),
            provider: "anthropic".into(),
            model: "m".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["sessionId"], "alpha");
        assert_eq!(json["payload"]["sandboxId"], "sb-1");
    }

    #[test]
    fn parse_inbound_approval() {
        let raw = r#"{ "type": "approval", "payload": { "callId": "c2", "approved": false } }"#;
        let command: ClientCommand = serde_json::from_str(raw).unwrap();
        assert_eq!(
            command,
            ClientCommand::Approval {
                call_id: "c2".into(),
                approved: false
            }
        );
    }

    #[test]
    fn health_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(HealthStatus::Reconnecting).unwrap(),
            serde_json::json!("reconnecting")
        );
    }
}
