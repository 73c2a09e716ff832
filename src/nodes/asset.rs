//! `asset` node: loads a pre-uploaded file's extracted text from storage
//! and writes it under the node's own id. If no extracted text is on
//! record (extraction failed, or the file is binary), falls back to
//! `"[file: <filename>]"` rather than failing the node.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{require_config_str, BuildDeps, NodeAgent, NodeBuilder, NodeContext};
use crate::dag::NodeDefinition;
use crate::{CoreError, Result};

pub struct AssetNodeBuilder;

impl NodeBuilder for AssetNodeBuilder {
    fn build(&self, node: &NodeDefinition, _deps: Arc<BuildDeps>) -> Result<Arc<dyn NodeAgent>> {
        let asset_id = require_config_str(&node.config, "asset_id", &node.id)?.to_string();
        Ok(Arc::new(AssetNode {
            node_id: node.id.clone(),
            asset_id,
        }))
    }
}

struct AssetNode {
    node_id: String,
    asset_id: String,
}

#[async_trait]
impl NodeAgent for AssetNode {
    async fn run(&self, ctx: NodeContext) -> Result<()> {
        let record = ctx
            .deps
            .assets
            .get_asset(&self.asset_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("asset not found: {}", self.asset_id)))?;

        let text = record
            .extracted_text
            .unwrap_or_else(|| format!("[file: {}]", record.filename));

        ctx.state_set(self.node_id.clone(), Value::String(text))
            .await;
        Ok(())
    }
}
