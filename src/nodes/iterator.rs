//! `iterator` node: resolves `source` (a template string, typically
//! pointing at a prior node's output), parses it as a JSON array — falling
//! back to splitting on non-empty lines if it isn't valid JSON — caps it at
//! `max_iterations`, and writes each item under `<item_key>` (default
//! `"item"`) and `<id>_index` as it goes, emitting one log event per item.
//! The full (possibly truncated) array is stored as JSON under the node's
//! own id once iteration completes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{config_str, BuildDeps, NodeAgent, NodeBuilder, NodeContext, NodeEvent};
use crate::dag::NodeDefinition;
use crate::Result;

const DEFAULT_MAX_ITERATIONS: usize = 1000;

pub struct IteratorNodeBuilder;

impl NodeBuilder for IteratorNodeBuilder {
    fn build(&self, node: &NodeDefinition, _deps: Arc<BuildDeps>) -> Result<Arc<dyn NodeAgent>> {
        let source = config_str(&node.config, "source").unwrap_or_default().to_string();
        let item_key = config_str(&node.config, "item_key")
            .unwrap_or("item")
            .to_string();
        let max_iterations = node
            .config
            .get("max_iterations")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_ITERATIONS);

        Ok(Arc::new(IteratorNode {
            node_id: node.id.clone(),
            source,
            item_key,
            max_iterations,
        }))
    }
}

struct IteratorNode {
    node_id: String,
    source: String,
    item_key: String,
    max_iterations: usize,
}

#[async_trait]
impl NodeAgent for IteratorNode {
    async fn run(&self, ctx: NodeContext) -> Result<()> {
        let resolved = ctx.resolve_template(&self.source).await;
        let mut items = parse_items(&resolved);
        if items.len() > self.max_iterations {
            items.truncate(self.max_iterations);
        }

        for (index, item) in items.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(crate::CoreError::Cancelled);
            }
            ctx.state_set(self.item_key.clone(), item.clone()).await;
            ctx.state_set(format!("{}_index", self.node_id), Value::from(index))
                .await;
            ctx.emit(NodeEvent::Log(format!(
                "{}: iteration {}/{}",
                self.node_id,
                index + 1,
                items.len()
            )));
        }

        ctx.state_set(self.node_id.clone(), Value::Array(items))
            .await;
        Ok(())
    }
}

/// Tries the source as a JSON array first; if that fails, splits on
/// newlines and keeps the non-empty, trimmed lines as string items.
fn parse_items(source: &str) -> Vec<Value> {
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(source) {
        return items;
    }
    source
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| Value::String(line.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_array() {
        let items = parse_items(r#"["a", "b", "c"]"#);
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn falls_back_to_line_split() {
        let items = parse_items("a\n\nb\nc\n");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Value::String("a".into()));
    }
}
