//! `sensor` node, two flavors selected by `config.mode`:
//!
//! - `poll` (default when `url` is set): polls a URL every `interval`
//!   seconds until a condition expression evaluated against the response
//!   body (temporarily stored under `<id>_response`) is true, or `timeout`
//!   elapses. Responses are capped at 1 MiB; an HTTP status `>= 400` counts
//!   as a failed poll and is retried on the next tick rather than failing
//!   the node outright.
//! - `webhook`: identical suspend/resume behavior to the `approval` node
//!   but never sends a notification — it only waits for an external
//!   resume call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{config_str, wait_for_cancel, BuildDeps, NodeAgent, NodeBuilder, NodeContext, NodeEvent};
use crate::dag::NodeDefinition;
use crate::{CoreError, Result};

const MAX_RESPONSE_BYTES: usize = 1024 * 1024;
const DEFAULT_INTERVAL_SECS: u64 = 5;
const DEFAULT_TIMEOUT_SECS: u64 = 3600;

enum Mode {
    Poll { url: String, interval_secs: u64 },
    Webhook,
}

pub struct SensorNodeBuilder;

impl NodeBuilder for SensorNodeBuilder {
    fn build(&self, node: &NodeDefinition, _deps: Arc<BuildDeps>) -> Result<Arc<dyn NodeAgent>> {
        let mode_str = config_str(&node.config, "mode");
        let url = config_str(&node.config, "url").map(str::to_string);

        let mode = match (mode_str, url) {
            (Some("webhook"), _) => Mode::Webhook,
            (_, Some(url)) => Mode::Poll {
                url,
                interval_secs: node
                    .config
                    .get("interval")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(DEFAULT_INTERVAL_SECS),
            },
            _ => Mode::Webhook,
        };

        let condition = config_str(&node.config, "condition").unwrap_or("").to_string();
        let timeout_secs = node
            .config
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(Arc::new(SensorNode {
            node_id: node.id.clone(),
            mode,
            condition,
            timeout_secs,
        }))
    }
}

struct SensorNode {
    node_id: String,
    mode: Mode,
    condition: String,
    timeout_secs: u64,
}

#[async_trait]
impl NodeAgent for SensorNode {
    async fn run(&self, ctx: NodeContext) -> Result<()> {
        match &self.mode {
            Mode::Poll { url, interval_secs } => self.poll(&ctx, url, *interval_secs).await,
            Mode::Webhook => self.wait_webhook(&ctx).await,
        }
    }
}

impl SensorNode {
    async fn poll(&self, ctx: &NodeContext, url: &str, interval_secs: u64) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.timeout_secs);
        let response_key = format!("{}_response", self.node_id);

        loop {
            if ctx.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::NodeTimeout(format!(
                    "sensor {} poll timed out after {}s",
                    self.node_id, self.timeout_secs
                )));
            }

            match self.fetch(ctx, url).await {
                Ok(body) => {
                    ctx.state_set(response_key.clone(), Value::String(body)).await;
                    if ctx.evaluate_condition(&self.condition).await {
                        let final_value = ctx.state_get(&response_key).await.unwrap_or(Value::Null);
                        ctx.state_set(self.node_id.clone(), final_value).await;
                        return Ok(());
                    }
                }
                Err(err) => {
                    ctx.emit(NodeEvent::Log(format!(
                        "{}: poll failed, retrying: {err}",
                        self.node_id
                    )));
                }
            }

            let sleep = tokio::time::sleep(Duration::from_secs(interval_secs));
            let mut cancelled = ctx.cancelled.clone();
            tokio::select! {
                _ = sleep => {}
                _ = wait_for_cancel(&mut cancelled) => return Err(CoreError::Cancelled),
            }
        }
    }

    async fn fetch(&self, ctx: &NodeContext, url: &str) -> Result<String> {
        let resolved = ctx.resolve_template(url).await;
        let response = ctx.deps.http.get(&resolved).send().await?;
        if !response.status().is_success() && response.status().as_u16() >= 400 {
            return Err(CoreError::RetryableTransient(format!(
                "sensor poll http {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await?;
        let capped = &bytes[..bytes.len().min(MAX_RESPONSE_BYTES)];
        Ok(String::from_utf8_lossy(capped).into_owned())
    }

    async fn wait_webhook(&self, ctx: &NodeContext) -> Result<()> {
        ctx.emit(NodeEvent::Waiting);
        let mut cancelled = ctx.cancelled.clone();
        let wait = ctx.handle.wait_for_resume(&self.node_id);
        tokio::pin!(wait);

        let payload = tokio::select! {
            result = &mut wait => result?,
            _ = tokio::time::sleep(Duration::from_secs(self.timeout_secs)) => {
                ctx.handle.cancel(&self.node_id);
                return Err(CoreError::NodeTimeout(format!(
                    "sensor {} webhook wait timed out after {}s",
                    self.node_id, self.timeout_secs
                )));
            }
            _ = wait_for_cancel(&mut cancelled) => {
                ctx.handle.cancel(&self.node_id);
                return Err(CoreError::Cancelled);
            }
        };

        let object: serde_json::Map<String, Value> = payload.into_iter().collect();
        ctx.state_set(self.node_id.clone(), Value::Object(object))
            .await;
        Ok(())
    }
}
