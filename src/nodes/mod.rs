//! Node registry and builders: a process-wide map from `node_type` to a
//! builder that turns a [`NodeDefinition`] plus a [`BuildDeps`] bundle into
//! a uniform node **agent** — an object exposing an async `run` that
//! mutates shared run state and streams [`NodeEvent`]s while it works.
//!
//! Thirteen built-in node types are registered by
//! [`NodeRegistry::with_builtins`]: `input`, `output`, `agent`, `tool`,
//! `branch`, `iterator`, `approval`, `sensor`, `notification`, `asset`,
//! `external`, `subworkflow`. Each, on terminal success, writes its final
//! output under its own node id into the shared run state so downstream
//! `{{id}}` templates and condition expressions resolve it.

pub mod agent;
pub mod approval;
pub mod asset;
pub mod branch;
pub mod external;
pub mod input;
pub mod iterator;
pub mod notification;
pub mod output;
pub mod sensor;
pub mod subworkflow;
pub mod tool;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::dag::{Dag, NodeDefinition, WorkflowDefinition};
use crate::handle::ExecutionHandle;
use crate::llm::connection::ConnectionResolver;
use crate::llm::sender::SenderRegistry;
use crate::llm::storage::AssetStorage;
use crate::llm::tool::ToolRegistry;
use crate::llm::LlmRegistry;
use crate::state::{RunState, Value};
use crate::{CoreError, Result};

/// Run state shared across every node task for one run. Mutations happen
/// serially in practice (a node only runs once its parents' `done` signals
/// have fired), but the type is `Mutex`-guarded because sibling tasks read
/// it concurrently during `shouldRun` condition evaluation.
pub type SharedState = Arc<AsyncMutex<RunState>>;

/// Sub-workflow recursion call-stack, shared for the lifetime of one run so
/// nested `subworkflow` nodes can detect cycles and depth.
pub type CallStack = Arc<AsyncMutex<Vec<String>>>;

/// An event a node agent emits while running. Terminal bookkeeping
/// (`started`/`completed`/`skipped`/`failed`) is the executor's
/// responsibility, not the node's — these are the interior events a node
/// can produce mid-flight.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Log(String),
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        name: String,
        result: serde_json::Value,
    },
    /// Emitted once by nodes that suspend (`approval`, webhook `sensor`)
    /// before they block on the execution handle.
    Waiting,
    /// A raw event forwarded from a `subworkflow`'s nested execution,
    /// carrying the child executor's own event as JSON so observers can
    /// still see into the nested run.
    Forwarded(serde_json::Value),
}

/// Looks up a workflow definition by name, consumed by the `subworkflow`
/// node builder. Implemented by the workflow repository.
#[async_trait]
pub trait WorkflowLookup: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Option<WorkflowDefinition>>;
}

/// Recursively runs a child workflow for a `subworkflow` node. Implemented
/// by the workflow service, which is the only component that knows how to
/// build and drive a [`crate::executor::DagExecutor`] — injecting it here
/// (rather than having `nodes` depend on `executor`) keeps the dependency
/// order in §2 acyclic.
#[async_trait]
pub trait SubworkflowRunner: Send + Sync {
    async fn run_subworkflow(
        &self,
        workflow: &WorkflowDefinition,
        inputs: HashMap<String, Value>,
        events: mpsc::UnboundedSender<NodeEvent>,
        call_stack: CallStack,
        cancelled: watch::Receiver<bool>,
    ) -> Result<HashMap<String, Value>>;
}

/// Everything a node builder or running agent may need to reach an
/// external collaborator (§6). Constructed once per workflow service and
/// shared across every build/run.
pub struct BuildDeps {
    pub llm: LlmRegistry,
    pub tools: ToolRegistry,
    pub connections: Arc<dyn ConnectionResolver>,
    pub senders: SenderRegistry,
    pub assets: Arc<dyn AssetStorage>,
    pub workflows: Arc<dyn WorkflowLookup>,
    pub subworkflow_runner: Arc<dyn SubworkflowRunner>,
    pub output_dir: PathBuf,
    pub http: reqwest::Client,
}

impl BuildDeps {
    pub fn new(
        llm: LlmRegistry,
        tools: ToolRegistry,
        connections: Arc<dyn ConnectionResolver>,
        senders: SenderRegistry,
        assets: Arc<dyn AssetStorage>,
        workflows: Arc<dyn WorkflowLookup>,
        subworkflow_runner: Arc<dyn SubworkflowRunner>,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            llm,
            tools,
            connections,
            senders,
            assets,
            workflows,
            subworkflow_runner,
            output_dir,
            http: reqwest::Client::new(),
        }
    }
}

/// Everything one node agent invocation needs at run time.
pub struct NodeContext {
    pub node_id: String,
    pub dag: Arc<Dag>,
    pub state: SharedState,
    pub events: mpsc::UnboundedSender<NodeEvent>,
    pub handle: Arc<ExecutionHandle>,
    pub cancelled: watch::Receiver<bool>,
    pub call_stack: CallStack,
    pub deps: Arc<BuildDeps>,
}

impl NodeContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    pub fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    pub async fn state_get(&self, key: &str) -> Option<Value> {
        self.state.lock().await.get(key).cloned()
    }

    pub async fn state_set(&self, key: impl Into<String>, value: Value) {
        self.state.lock().await.insert(key, value);
    }

    pub async fn resolve_template(&self, template: &str) -> String {
        let state = self.state.lock().await;
        crate::template::resolve(template, &state)
    }

    pub async fn evaluate_condition(&self, expr: &str) -> bool {
        let state = self.state.lock().await;
        crate::condition::evaluate(expr, &state)
    }
}

/// A uniform node agent: built once per run (per node), invoked once.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    async fn run(&self, ctx: NodeContext) -> Result<()>;
}

/// Builds a node agent from its definition. Each builtin builder validates
/// its `config` shape at build time, not run time, so a malformed
/// definition fails workflow validation before a run ever starts.
pub trait NodeBuilder: Send + Sync {
    fn build(&self, node: &NodeDefinition, deps: Arc<BuildDeps>) -> Result<Arc<dyn NodeAgent>>;
}

/// Process-wide map from `node_type` to its builder.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    builders: HashMap<String, Arc<dyn NodeBuilder>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node_type: impl Into<String>, builder: Arc<dyn NodeBuilder>) {
        self.builders.insert(node_type.into(), builder);
    }

    /// A registry with all thirteen built-in node types registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("input", Arc::new(input::InputNodeBuilder));
        registry.register("output", Arc::new(output::OutputNodeBuilder));
        registry.register("agent", Arc::new(agent::AgentNodeBuilder));
        registry.register("tool", Arc::new(tool::ToolNodeBuilder));
        registry.register("branch", Arc::new(branch::BranchNodeBuilder));
        registry.register("iterator", Arc::new(iterator::IteratorNodeBuilder));
        registry.register("approval", Arc::new(approval::ApprovalNodeBuilder));
        registry.register("sensor", Arc::new(sensor::SensorNodeBuilder));
        registry.register(
            "notification",
            Arc::new(notification::NotificationNodeBuilder),
        );
        registry.register("asset", Arc::new(asset::AssetNodeBuilder));
        registry.register("external", Arc::new(external::ExternalNodeBuilder));
        registry.register(
            "subworkflow",
            Arc::new(subworkflow::SubworkflowNodeBuilder),
        );
        registry
    }

    pub fn build(
        &self,
        node: &NodeDefinition,
        deps: Arc<BuildDeps>,
    ) -> Result<Arc<dyn NodeAgent>> {
        let builder = self.builders.get(&node.node_type).ok_or_else(|| {
            CoreError::Validation(format!("unknown node type: {}", node.node_type))
        })?;
        builder.build(node, deps)
    }

    /// Builds an agent for every node in the DAG, keyed by node id.
    pub fn build_all(
        &self,
        dag: &Dag,
        deps: Arc<BuildDeps>,
    ) -> Result<HashMap<String, Arc<dyn NodeAgent>>> {
        let mut agents = HashMap::with_capacity(dag.node_ids().len());
        for id in dag.node_ids() {
            let node = dag.node(id).expect("node id came from dag.node_ids()");
            agents.insert(id.clone(), self.build(node, deps.clone())?);
        }
        Ok(agents)
    }
}

/// Shared helper: config field lookup with a typed error on missing/wrong
/// shape, used by most builders for required string fields.
pub(crate) fn config_str<'a>(config: &'a serde_json::Value, field: &str) -> Option<&'a str> {
    config.get(field).and_then(|v| v.as_str())
}

pub(crate) fn require_config_str<'a>(
    config: &'a serde_json::Value,
    field: &str,
    node_id: &str,
) -> Result<&'a str> {
    config_str(config, field).ok_or_else(|| {
        CoreError::Validation(format!("node {node_id}: missing required config field `{field}`"))
    })
}

/// Resolves once the run's cancellation flag flips true, or the sender is
/// dropped. Shared by every node that suspends (`approval`, `sensor`).
pub(crate) async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
