//! The `LanguageModel` capability.
//!
//! Vendor clients live outside this workspace; the turn engine only sees
//! this trait. Implementations translate the conversation history and the
//! aggregated tool catalog into whatever wire format the vendor expects.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::message::ConversationMessage;
use crate::tool::ToolDefinition;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelToolCall {
    /// Correlation id, unique within the turn.
    pub call_id: String,
    /// The exposed tool name as advertised to the model.
    pub name: String,
    pub args: Value,
}

/// The model's reply to one completion request.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    pub text: Option<String>,
    pub tool_calls: Vec<ModelToolCall>,
}

/// Trait every language-model backend must implement.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete one reasoning step: given the history tail, the current
    /// prompt, and the available tools, return text and/or tool calls.
    async fn complete(
        &self,
        history: &[ConversationMessage],
        prompt: &str,
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn>;

    /// Vendor identifier (e.g. `"anthropic"`), surfaced in the `ready` event.
    fn provider(&self) -> &str;

    /// Model identifier, surfaced in the `ready` event.
    fn model(&self) -> &str;
}
