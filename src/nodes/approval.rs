//! `approval` node: a human-in-the-loop gate. Optionally sends a message
//! via a configured sender, emits a `waiting` event, then blocks on the
//! [`crate::handle::ExecutionHandle`] for up to `timeout` seconds (default
//! 3600) until an external `/resume` call supplies a payload. The payload
//! is stored under the node's own id and its `action` field (if present)
//! is also stored under `<id>_action`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{config_str, wait_for_cancel, BuildDeps, NodeAgent, NodeBuilder, NodeContext, NodeEvent};
use crate::dag::NodeDefinition;
use crate::{CoreError, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 3600;

pub struct ApprovalNodeBuilder;

impl NodeBuilder for ApprovalNodeBuilder {
    fn build(&self, node: &NodeDefinition, _deps: Arc<BuildDeps>) -> Result<Arc<dyn NodeAgent>> {
        Ok(Arc::new(ApprovalNode {
            node_id: node.id.clone(),
            connection: config_str(&node.config, "connection").map(str::to_string),
            message: config_str(&node.config, "message").map(str::to_string),
            timeout_secs: node
                .config
                .get("timeout")
                .and_then(|v| v.as_u64())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        }))
    }
}

struct ApprovalNode {
    node_id: String,
    connection: Option<String>,
    message: Option<String>,
    timeout_secs: u64,
}

#[async_trait]
impl NodeAgent for ApprovalNode {
    async fn run(&self, ctx: NodeContext) -> Result<()> {
        if let (Some(conn_id), Some(message)) = (&self.connection, &self.message) {
            let rendered = ctx.resolve_template(message).await;
            let connection = ctx.deps.connections.resolve(conn_id).await?;
            let sender = ctx.deps.senders.get(&connection.type_name)?;
            sender.send(&connection, &rendered).await?;
        }

        ctx.emit(NodeEvent::Waiting);

        let mut cancelled = ctx.cancelled.clone();
        let wait = ctx.handle.wait_for_resume(&self.node_id);
        tokio::pin!(wait);

        let payload = tokio::select! {
            result = &mut wait => result?,
            _ = tokio::time::sleep(Duration::from_secs(self.timeout_secs)) => {
                ctx.handle.cancel(&self.node_id);
                return Err(CoreError::NodeTimeout(format!(
                    "approval {} timed out after {}s",
                    self.node_id, self.timeout_secs
                )));
            }
            _ = wait_for_cancel(&mut cancelled) => {
                ctx.handle.cancel(&self.node_id);
                return Err(CoreError::Cancelled);
            }
        };

        let mut object: Map<String, Value> = payload.into_iter().collect();
        if let Some(action) = object.get("action").cloned() {
            ctx.state_set(format!("{}_action", self.node_id), action).await;
        }
        ctx.state_set(self.node_id.clone(), Value::Object(std::mem::take(&mut object)))
            .await;
        Ok(())
    }
}
