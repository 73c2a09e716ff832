//! `tool` node: deterministic single tool invocation. Every string value in
//! the configured input map is template-resolved against run state before
//! the call. Build fails if `tool` names an unknown tool, so a typo
//! surfaces at workflow validation rather than mid-run.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{require_config_str, BuildDeps, NodeAgent, NodeBuilder, NodeContext, NodeEvent};
use crate::dag::NodeDefinition;
use crate::{CoreError, Result};

pub struct ToolNodeBuilder;

impl NodeBuilder for ToolNodeBuilder {
    fn build(&self, node: &NodeDefinition, deps: Arc<BuildDeps>) -> Result<Arc<dyn NodeAgent>> {
        let tool_name = require_config_str(&node.config, "tool", &node.id)?.to_string();
        if !deps.tools.contains(&tool_name) {
            return Err(CoreError::Validation(format!(
                "node {}: unknown tool `{tool_name}`",
                node.id
            )));
        }
        let input = node
            .config
            .get("input")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        Ok(Arc::new(ToolNode {
            node_id: node.id.clone(),
            tool_name,
            input,
        }))
    }
}

struct ToolNode {
    node_id: String,
    tool_name: String,
    input: Value,
}

#[async_trait]
impl NodeAgent for ToolNode {
    async fn run(&self, ctx: NodeContext) -> Result<()> {
        let resolved_input = self.resolve_input(&ctx).await;
        ctx.emit(NodeEvent::ToolCall {
            name: self.tool_name.clone(),
            arguments: resolved_input.clone(),
        });

        let tool = ctx.deps.tools.get(&self.tool_name).ok_or_else(|| {
            CoreError::FatalNode(format!("tool disappeared from registry: {}", self.tool_name))
        })?;
        let result = tool.execute(resolved_input).await?;

        ctx.emit(NodeEvent::ToolResult {
            name: self.tool_name.clone(),
            result: result.clone(),
        });
        ctx.state_set(self.node_id.clone(), result).await;
        Ok(())
    }
}

impl ToolNode {
    async fn resolve_input(&self, ctx: &NodeContext) -> Value {
        match &self.input {
            Value::Object(map) => {
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    let value = match v {
                        Value::String(s) => Value::String(ctx.resolve_template(s).await),
                        other => other.clone(),
                    };
                    resolved.insert(k.clone(), value);
                }
                Value::Object(resolved)
            }
            other => other.clone(),
        }
    }
}
