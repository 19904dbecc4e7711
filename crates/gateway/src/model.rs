//! Development stand-in for the `LanguageModel` capability.
//!
//! Vendor model adapters live outside this workspace and are injected at
//! bootstrap. Until one is wired in, single-node dev mode runs with this
//! model, which never calls tools and simply acknowledges the prompt.

use async_trait::async_trait;

use tb_domain::message::ConversationMessage;
use tb_domain::model::{LanguageModel, ModelTurn};
use tb_domain::tool::ToolDefinition;
use tb_domain::Result;

pub struct DevModel;

#[async_trait]
impl LanguageModel for DevModel {
    async fn complete(
        &self,
        history: &[ConversationMessage],
        prompt: &str,
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn> {
        tracing::debug!(
            history = history.len(),
            tools = tools.len(),
            "dev model completing"
        );
        Ok(ModelTurn {
            text: Some(format!(
                "[dev model] no language-model backend is configured; received: {prompt}"
            )),
            tool_calls: Vec::new(),
        })
    }

    fn provider(&self) -> &str {
        "dev"
    }

    fn model(&self) -> &str {
        "dev-echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dev_model_echoes_without_tool_calls() {
        let turn = DevModel.complete(&[], "hello", &[]).await.unwrap();
        assert!(turn.tool_calls.is_empty());
        assert!(turn.text.unwrap().contains("hello"));
    }
}
