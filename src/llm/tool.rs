//! Tool collaborator interface consumed by `tool` nodes and the `agent`
//! node's function-calling turn loop.

use async_trait::async_trait;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::Result;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;
    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value>;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Executes a tool by name, catching panics so a misbehaving tool
    /// cannot fail the node that invoked it — the specification requires
    /// this for the `agent` node's function-calling loop: a panicking tool
    /// returns `{"error": ...}` to the model instead of propagating.
    pub async fn execute_guarded(&self, name: &str, input: serde_json::Value) -> serde_json::Value {
        let Some(tool) = self.get(name) else {
            return serde_json::json!({"error": format!("unknown tool: {name}")});
        };
        let result = AssertUnwindSafe(tool.execute(input)).catch_unwind().await;
        match result {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => serde_json::json!({"error": err.to_string()}),
            Err(_) => serde_json::json!({"error": format!("tool '{name}' panicked")}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes input"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value> {
            Ok(input)
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "panics"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({})
        }
        async fn execute(&self, _input: serde_json::Value) -> Result<serde_json::Value> {
            panic!("boom")
        }
    }

    #[tokio::test]
    async fn unknown_tool_returns_error_object() {
        let registry = ToolRegistry::new();
        let result = registry.execute_guarded("missing", serde_json::json!({})).await;
        assert!(result.get("error").is_some());
    }

    #[tokio::test]
    async fn known_tool_executes() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let result = registry
            .execute_guarded("echo", serde_json::json!({"x": 1}))
            .await;
        assert_eq!(result, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn panicking_tool_is_recovered_as_error() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(PanicTool));
        let result = registry.execute_guarded("panics", serde_json::json!({})).await;
        assert!(result.get("error").is_some());
    }
}
