//! `agent` node: the LLM call. Renders the `prompt` template, resolves the
//! system prompt, calls the configured model, and runs a bounded
//! function-calling turn loop — one turn if no tools are declared, up to
//! ten if they are. Between turns, function calls are executed against the
//! tool registry (errors and panics become a `{"error": ...}` result fed
//! back to the model) until the model stops emitting function calls.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{require_config_str, BuildDeps, NodeAgent, NodeBuilder, NodeContext, NodeEvent};
use crate::dag::NodeDefinition;
use crate::llm::{
    split_provider_model, ChatMessage, FunctionDeclaration, LlmRequest, MessageRole,
};
use crate::{CoreError, Result};

const MAX_TURNS_NO_TOOLS: usize = 1;
const MAX_TURNS_WITH_TOOLS: usize = 10;

pub struct AgentNodeBuilder;

impl NodeBuilder for AgentNodeBuilder {
    fn build(&self, node: &NodeDefinition, _deps: Arc<BuildDeps>) -> Result<Arc<dyn NodeAgent>> {
        let provider_model = require_config_str(&node.config, "model", &node.id)?.to_string();
        split_provider_model(&provider_model).ok_or_else(|| {
            CoreError::Validation(format!(
                "node {}: `model` must be `provider/model`, got `{provider_model}`",
                node.id
            ))
        })?;

        let prompt = require_config_str(&node.config, "prompt", &node.id)?.to_string();
        let system_prompt = node
            .config
            .get("system_prompt")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let tools: Vec<String> = node
            .config
            .get("tools")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let temperature = node.config.get("temperature").and_then(|v| v.as_f64()).map(|f| f as f32);

        Ok(Arc::new(AgentNode {
            node_id: node.id.clone(),
            provider_model,
            prompt,
            system_prompt,
            tools,
            temperature,
        }))
    }
}

struct AgentNode {
    node_id: String,
    provider_model: String,
    prompt: String,
    system_prompt: Option<String>,
    tools: Vec<String>,
    temperature: Option<f32>,
}

#[async_trait]
impl NodeAgent for AgentNode {
    async fn run(&self, ctx: NodeContext) -> Result<()> {
        let (provider, model) = split_provider_model(&self.provider_model)
            .expect("validated at build time");
        let llm = ctx.deps.llm.get(provider).ok_or_else(|| {
            CoreError::Validation(format!("provider not configured: {provider}"))
        })?;

        let rendered_prompt = ctx.resolve_template(&self.prompt).await;
        let rendered_system = match &self.system_prompt {
            Some(s) => Some(ctx.resolve_template(s).await),
            None => None,
        };

        let functions: Vec<FunctionDeclaration> = self
            .tools
            .iter()
            .filter_map(|name| ctx.deps.tools.get(name))
            .map(|tool| FunctionDeclaration {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.input_schema(),
            })
            .collect();

        let max_turns = if functions.is_empty() {
            MAX_TURNS_NO_TOOLS
        } else {
            MAX_TURNS_WITH_TOOLS
        };

        let mut messages = vec![ChatMessage {
            role: MessageRole::User,
            content: rendered_prompt,
        }];

        let mut final_content = String::new();
        for turn in 0..max_turns {
            if ctx.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            ctx.emit(NodeEvent::Log(format!(
                "{}: turn {}/{max_turns}",
                self.node_id,
                turn + 1
            )));

            let response = llm
                .generate_content(LlmRequest {
                    model: model.to_string(),
                    system_prompt: rendered_system.clone(),
                    messages: messages.clone(),
                    functions: functions.clone(),
                    temperature: self.temperature,
                    max_tokens: None,
                })
                .await?;

            if let Some(content) = &response.content {
                final_content = content.clone();
            }

            if !response.has_function_calls() {
                break;
            }

            messages.push(ChatMessage {
                role: MessageRole::Assistant,
                content: response.content.clone().unwrap_or_default(),
            });

            for call in &response.function_calls {
                ctx.emit(NodeEvent::ToolCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
                let result = ctx
                    .deps
                    .tools
                    .execute_guarded(&call.name, call.arguments.clone())
                    .await;
                ctx.emit(NodeEvent::ToolResult {
                    name: call.name.clone(),
                    result: result.clone(),
                });
                messages.push(ChatMessage {
                    role: MessageRole::Function,
                    content: result.to_string(),
                });
            }
        }

        ctx.state_set(self.node_id.clone(), Value::String(final_content))
            .await;
        Ok(())
    }
}
