//! `subworkflow` node: looks up a child workflow by name and recursively
//! runs it via the injected [`super::SubworkflowRunner`], forwarding its
//! events and storing the final non-internal state as JSON under the
//! node's own id. A shared call-stack (carried per run) detects cycles —
//! invoking a workflow already on the stack fails fast — and caps
//! recursion depth at 10.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{require_config_str, BuildDeps, NodeAgent, NodeBuilder, NodeContext};
use crate::dag::NodeDefinition;
use crate::{CoreError, Result};

const MAX_DEPTH: usize = 10;

pub struct SubworkflowNodeBuilder;

impl NodeBuilder for SubworkflowNodeBuilder {
    fn build(&self, node: &NodeDefinition, _deps: Arc<BuildDeps>) -> Result<Arc<dyn NodeAgent>> {
        let workflow_name = require_config_str(&node.config, "workflow", &node.id)?.to_string();
        let inputs = node
            .config
            .get("inputs")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        Ok(Arc::new(SubworkflowNode {
            node_id: node.id.clone(),
            workflow_name,
            inputs,
        }))
    }
}

struct SubworkflowNode {
    node_id: String,
    workflow_name: String,
    inputs: serde_json::Map<String, Value>,
}

#[async_trait]
impl NodeAgent for SubworkflowNode {
    async fn run(&self, ctx: NodeContext) -> Result<()> {
        {
            let stack = ctx.call_stack.lock().await;
            if stack.iter().any(|name| name == &self.workflow_name) {
                return Err(CoreError::Validation(format!(
                    "subworkflow cycle detected: {} already on call stack",
                    self.workflow_name
                )));
            }
            if stack.len() >= MAX_DEPTH {
                return Err(CoreError::Validation(format!(
                    "subworkflow depth exceeded (>= {MAX_DEPTH}) invoking {}",
                    self.workflow_name
                )));
            }
        }

        let workflow = ctx
            .deps
            .workflows
            .lookup(&self.workflow_name)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("workflow not found: {}", self.workflow_name))
            })?;

        let mut resolved_inputs = HashMap::with_capacity(self.inputs.len());
        for (k, v) in &self.inputs {
            let value = match v {
                Value::String(s) => Value::String(ctx.resolve_template(s).await),
                other => other.clone(),
            };
            resolved_inputs.insert(k.clone(), value);
        }

        ctx.call_stack.lock().await.push(self.workflow_name.clone());
        let result = ctx
            .deps
            .subworkflow_runner
            .run_subworkflow(
                &workflow,
                resolved_inputs,
                ctx.events.clone(),
                ctx.call_stack.clone(),
                ctx.cancelled.clone(),
            )
            .await;
        ctx.call_stack.lock().await.pop();

        let delta = result?;
        let delta_json: serde_json::Map<String, Value> = delta.into_iter().collect();
        ctx.state_set(self.node_id.clone(), Value::Object(delta_json))
            .await;
        Ok(())
    }
}
