//! `external` (remote) node: invokes a remote agent over HTTP at
//! `endpoint_url`. The wire format here is a minimal JSON request/response
//! envelope (`{"input": ...}` / `{"output": ...}`); the full externally
//! defined agent protocol (capability negotiation, streaming, auth) is an
//! out-of-scope collaborator per the specification (§1) — this node only
//! needs enough of it to round-trip one call.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{config_str, require_config_str, BuildDeps, NodeAgent, NodeBuilder, NodeContext};
use crate::dag::NodeDefinition;
use crate::{CoreError, Result};

pub struct ExternalNodeBuilder;

impl NodeBuilder for ExternalNodeBuilder {
    fn build(&self, node: &NodeDefinition, _deps: Arc<BuildDeps>) -> Result<Arc<dyn NodeAgent>> {
        let endpoint_url = require_config_str(&node.config, "endpoint_url", &node.id)?.to_string();
        let input = config_str(&node.config, "input").unwrap_or("").to_string();
        Ok(Arc::new(ExternalNode {
            node_id: node.id.clone(),
            endpoint_url,
            input,
        }))
    }
}

struct ExternalNode {
    node_id: String,
    endpoint_url: String,
    input: String,
}

#[async_trait]
impl NodeAgent for ExternalNode {
    async fn run(&self, ctx: NodeContext) -> Result<()> {
        let rendered_input = ctx.resolve_template(&self.input).await;
        let response = ctx
            .deps
            .http
            .post(&self.endpoint_url)
            .json(&json!({ "input": rendered_input }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(CoreError::RetryableTransient(format!(
                "external node {} http {status}",
                self.node_id
            )));
        }

        let body: Value = response.json().await?;
        let output = body.get("output").cloned().unwrap_or(body);
        ctx.state_set(self.node_id.clone(), output).await;
        Ok(())
    }
}
