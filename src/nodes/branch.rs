//! `branch` node: evaluates an expression (writing `"true"`/`"false"`) or,
//! if `classify_with` is configured, asks an LLM to pick one of `labels`.
//! Downstream edges gate on the stored value via their own `condition`
//! expressions (e.g. `branch1 == "true"`).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{config_str, BuildDeps, NodeAgent, NodeBuilder, NodeContext, NodeEvent};
use crate::dag::NodeDefinition;
use crate::llm::{split_provider_model, ChatMessage, LlmRequest, MessageRole};
use crate::{CoreError, Result};

pub struct BranchNodeBuilder;

impl NodeBuilder for BranchNodeBuilder {
    fn build(&self, node: &NodeDefinition, _deps: Arc<BuildDeps>) -> Result<Arc<dyn NodeAgent>> {
        let expression = config_str(&node.config, "expression").map(str::to_string);
        let classify_with = config_str(&node.config, "classify_with").map(str::to_string);
        let prompt = config_str(&node.config, "prompt").map(str::to_string);
        let labels: Vec<String> = node
            .config
            .get("labels")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        if expression.is_none() && classify_with.is_none() {
            return Err(CoreError::Validation(format!(
                "node {}: branch requires `expression` or `classify_with`",
                node.id
            )));
        }

        Ok(Arc::new(BranchNode {
            node_id: node.id.clone(),
            expression,
            classify_with,
            prompt,
            labels,
        }))
    }
}

struct BranchNode {
    node_id: String,
    expression: Option<String>,
    classify_with: Option<String>,
    prompt: Option<String>,
    labels: Vec<String>,
}

#[async_trait]
impl NodeAgent for BranchNode {
    async fn run(&self, ctx: NodeContext) -> Result<()> {
        let label = if let Some(expr) = &self.expression {
            let result = ctx.evaluate_condition(expr).await;
            result.to_string()
        } else {
            self.classify(&ctx).await?
        };

        ctx.emit(NodeEvent::Log(format!("{}: branch -> {label}", self.node_id)));
        ctx.state_set(self.node_id.clone(), Value::String(label))
            .await;
        Ok(())
    }
}

impl BranchNode {
    async fn classify(&self, ctx: &NodeContext) -> Result<String> {
        let spec = self.classify_with.as_ref().expect("checked at build time");
        let (provider, model) = split_provider_model(spec)
            .ok_or_else(|| CoreError::Validation(format!("invalid classify_with: {spec}")))?;
        let llm = ctx
            .deps
            .llm
            .get(provider)
            .ok_or_else(|| CoreError::Validation(format!("provider not configured: {provider}")))?;

        let prompt = match &self.prompt {
            Some(p) => ctx.resolve_template(p).await,
            None => String::new(),
        };
        let labels = self.labels.join(", ");
        let system = format!(
            "Classify the input into exactly one of these labels: {labels}. Respond with only the label text."
        );

        let response = llm
            .generate_content(LlmRequest {
                model: model.to_string(),
                system_prompt: Some(system),
                messages: vec![ChatMessage {
                    role: MessageRole::User,
                    content: prompt,
                }],
                functions: vec![],
                temperature: Some(0.0),
                max_tokens: Some(32),
            })
            .await?;

        let raw = response.content.unwrap_or_default();
        let trimmed = raw.trim();
        Ok(self
            .labels
            .iter()
            .find(|l| l.eq_ignore_ascii_case(trimmed))
            .cloned()
            .unwrap_or_else(|| trimmed.to_string()))
    }
}
