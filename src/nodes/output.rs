//! `output` node: renders a `prompt` template if present; otherwise
//! concatenates every non-internal state value (key-sorted, excluding its
//! own key) separated by blank lines. Optionally re-formats the result
//! through an LLM post-processor named by `format_with` (a `provider/model`
//! string), which is an implementation-defined extra the specification
//! leaves open.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{config_str, BuildDeps, NodeAgent, NodeBuilder, NodeContext, NodeEvent};
use crate::dag::NodeDefinition;
use crate::llm::{split_provider_model, ChatMessage, LlmRequest, MessageRole};
use crate::{CoreError, Result};

pub struct OutputNodeBuilder;

impl NodeBuilder for OutputNodeBuilder {
    fn build(&self, node: &NodeDefinition, _deps: Arc<BuildDeps>) -> Result<Arc<dyn NodeAgent>> {
        Ok(Arc::new(OutputNode {
            node_id: node.id.clone(),
            prompt: config_str(&node.config, "prompt").map(str::to_string),
            format_with: config_str(&node.config, "format_with").map(str::to_string),
        }))
    }
}

struct OutputNode {
    node_id: String,
    prompt: Option<String>,
    format_with: Option<String>,
}

#[async_trait]
impl NodeAgent for OutputNode {
    async fn run(&self, ctx: NodeContext) -> Result<()> {
        let mut rendered = match &self.prompt {
            Some(prompt) => ctx.resolve_template(prompt).await,
            None => {
                let state = ctx.state.lock().await;
                state
                    .non_internal_sorted()
                    .into_iter()
                    .filter(|(k, _)| k.as_str() != self.node_id)
                    .map(|(_, v)| value_to_text(v))
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }
        };

        if let Some(spec) = &self.format_with {
            rendered = self.reformat(&ctx, spec, rendered).await?;
        }

        ctx.state_set(self.node_id.clone(), Value::String(rendered))
            .await;
        Ok(())
    }
}

impl OutputNode {
    async fn reformat(&self, ctx: &NodeContext, spec: &str, text: String) -> Result<String> {
        let (provider, model) = split_provider_model(spec)
            .ok_or_else(|| CoreError::Validation(format!("invalid format_with: {spec}")))?;
        let llm = ctx
            .deps
            .llm
            .get(provider)
            .ok_or_else(|| CoreError::Validation(format!("provider not configured: {provider}")))?;

        ctx.emit(NodeEvent::Log(format!("reformatting output via {spec}")));
        let response = llm
            .generate_content(LlmRequest {
                model: model.to_string(),
                system_prompt: Some("Reformat the following text for clarity. Return only the reformatted text.".into()),
                messages: vec![ChatMessage {
                    role: MessageRole::User,
                    content: text.clone(),
                }],
                functions: vec![],
                temperature: Some(0.0),
                max_tokens: None,
            })
            .await?;
        Ok(response.content.unwrap_or(text))
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
