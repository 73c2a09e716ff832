//! `input` node: reads `__user_input__<node_id>` from run state (written by
//! the trigger layer when a run starts) and republishes it under the
//! node's own id so downstream templates and conditions can reference it
//! directly.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{BuildDeps, NodeAgent, NodeBuilder, NodeContext};
use crate::dag::NodeDefinition;
use crate::state::RunState;
use crate::Result;

pub struct InputNodeBuilder;

impl NodeBuilder for InputNodeBuilder {
    fn build(&self, node: &NodeDefinition, _deps: Arc<BuildDeps>) -> Result<Arc<dyn NodeAgent>> {
        Ok(Arc::new(InputNode {
            node_id: node.id.clone(),
        }))
    }
}

struct InputNode {
    node_id: String,
}

#[async_trait]
impl NodeAgent for InputNode {
    async fn run(&self, ctx: NodeContext) -> Result<()> {
        let key = RunState::user_input_key(&self.node_id);
        let value = ctx.state_get(&key).await.unwrap_or(Value::Null);
        ctx.state_set(self.node_id.clone(), value).await;
        Ok(())
    }
}
