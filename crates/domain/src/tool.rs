//! Tool catalog types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool advertised by one server, identified by `(server, original name)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub server_name: String,
    pub original_name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-schema for the tool's arguments.
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

/// A catalog entry after name resolution: the publicly surfaced name plus
/// the descriptor it maps back to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExposedTool {
    pub exposed_name: String,
    #[serde(flatten)]
    pub descriptor: ToolDescriptor,
}

/// A tool as presented to the language model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&ExposedTool> for ToolDefinition {
    fn from(tool: &ExposedTool) -> Self {
        Self {
            name: tool.exposed_name.clone(),
            description: tool.descriptor.description.clone(),
            parameters: tool.descriptor.parameters.clone(),
        }
    }
}

pub fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_defaults_parameters_schema() {
        let raw = r#"{ "server_name": "fs", "original_name": "read" }"#;
        let descriptor: ToolDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(descriptor.parameters["type"], "object");
        assert_eq!(descriptor.description, "");
    }

    #[test]
    fn exposed_tool_to_definition() {
        let tool = ExposedTool {
            exposed_name: "fs_read".into(),
            descriptor: ToolDescriptor {
                server_name: "fs".into(),
                original_name: "read".into(),
                description: "Read a file".into(),
                parameters: empty_object_schema(),
            },
        };
        let def = ToolDefinition::from(&tool);
        assert_eq!(def.name, "fs_read");
        assert_eq!(def.description, "Read a file");
    }
}
