//! `notification` node: resolves a connection, optionally overrides its
//! channel, renders the message template, and sends through the
//! connection-type's registered sender.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{require_config_str, BuildDeps, NodeAgent, NodeBuilder, NodeContext};
use crate::dag::NodeDefinition;
use crate::Result;

pub struct NotificationNodeBuilder;

impl NodeBuilder for NotificationNodeBuilder {
    fn build(&self, node: &NodeDefinition, _deps: Arc<BuildDeps>) -> Result<Arc<dyn NodeAgent>> {
        let connection = require_config_str(&node.config, "connection", &node.id)?.to_string();
        let message = require_config_str(&node.config, "message", &node.id)?.to_string();
        let channel = node
            .config
            .get("channel")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(Arc::new(NotificationNode {
            node_id: node.id.clone(),
            connection,
            message,
            channel,
        }))
    }
}

struct NotificationNode {
    node_id: String,
    connection: String,
    message: String,
    channel: Option<String>,
}

#[async_trait]
impl NodeAgent for NotificationNode {
    async fn run(&self, ctx: NodeContext) -> Result<()> {
        let mut connection = ctx.deps.connections.resolve(&self.connection).await?;
        if let Some(channel) = &self.channel {
            if let Value::Object(ref mut map) = connection.config {
                map.insert("channel".to_string(), Value::String(channel.clone()));
            }
        }

        let rendered = ctx.resolve_template(&self.message).await;
        let sender = ctx.deps.senders.get(&connection.type_name)?;
        sender.send(&connection, &rendered).await?;

        ctx.state_set(self.node_id.clone(), Value::String(rendered))
            .await;
        Ok(())
    }
}
