//! Workflow service: composes the DAG executor, a per-run session, and the
//! executor-event classifier into the one entry point the trigger layer and
//! HTTP API call to start a run (§4.7).
//!
//! Validates a workflow (every `agent` node's `provider/model` provider must
//! be configured), builds the DAG and its node agents, opens a session
//! (fresh run state plus a fresh [`ExecutionHandle`]), writes the caller's
//! inputs into state under `__user_input__<id>`, and spawns the run on a
//! background task. Callers get back a [`RunHandles`] bundle: a stream of
//! translated [`WorkflowEvent`]s, a one-shot [`RunResult`], the
//! [`ExecutionHandle`] for `/resume` calls, and a cancellation sender for
//! `/cancel` calls.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};

use crate::dag::{Dag, WorkflowDefinition};
use crate::executor::{DagExecutor, ExecEvent, ExecEventKind};
use crate::handle::ExecutionHandle;
use crate::llm::connection::ConnectionResolver;
use crate::llm::sender::SenderRegistry;
use crate::llm::storage::AssetStorage;
use crate::llm::tool::ToolRegistry;
use crate::llm::LlmRegistry;
use crate::nodes::{BuildDeps, CallStack, NodeEvent, NodeRegistry, SharedState, SubworkflowRunner, WorkflowLookup};
use crate::state::{truthy, RunState, Value};
use crate::{CoreError, Result};

/// The uniform event taxonomy exposed to callers, translated from the
/// executor's raw [`ExecEvent`]s.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    NodeStarted { node_id: String },
    NodeCompleted { node_id: String },
    NodeSkipped { node_id: String },
    NodeWaiting { node_id: String },
    ToolCall { node_id: String, name: String, arguments: serde_json::Value },
    ToolResult { node_id: String, name: String, result: serde_json::Value },
    Log { node_id: String, message: String },
    Error { node_id: String, message: String },
}

fn translate(event: ExecEvent) -> WorkflowEvent {
    let node_id = event.node_id;
    match event.kind {
        ExecEventKind::Started => WorkflowEvent::NodeStarted { node_id },
        ExecEventKind::Completed => WorkflowEvent::NodeCompleted { node_id },
        ExecEventKind::Skipped => WorkflowEvent::NodeSkipped { node_id },
        ExecEventKind::Error { message } => WorkflowEvent::Error { node_id, message },
        ExecEventKind::Node(NodeEvent::Log(message)) => WorkflowEvent::Log { node_id, message },
        ExecEventKind::Node(NodeEvent::Waiting) => WorkflowEvent::NodeWaiting { node_id },
        ExecEventKind::Node(NodeEvent::ToolCall { name, arguments }) => {
            WorkflowEvent::ToolCall { node_id, name, arguments }
        }
        ExecEventKind::Node(NodeEvent::ToolResult { name, result }) => {
            WorkflowEvent::ToolResult { node_id, name, result }
        }
        // A forwarded sub-workflow event already carries its own shape as
        // JSON; surface it as a log line tagged with the parent node id
        // rather than inventing a nested variant.
        ExecEventKind::Node(NodeEvent::Forwarded(value)) => {
            WorkflowEvent::Log { node_id, message: value.to_string() }
        }
    }
}

/// The final outcome of one run: every non-internal state key plus an
/// `__output__` map keyed by `output`-node ids, per §4.7.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunResult {
    pub state: serde_json::Map<String, Value>,
    pub output: serde_json::Map<String, Value>,
}

/// What a caller gets back from starting a run.
pub struct RunHandles {
    pub events: mpsc::UnboundedReceiver<WorkflowEvent>,
    pub result: oneshot::Receiver<Result<RunResult>>,
    pub handle: Arc<ExecutionHandle>,
    pub cancel: watch::Sender<bool>,
}

pub struct WorkflowService {
    registry: NodeRegistry,
    llm: LlmRegistry,
    tools: ToolRegistry,
    connections: Arc<dyn ConnectionResolver>,
    senders: SenderRegistry,
    assets: Arc<dyn AssetStorage>,
    workflows: Arc<dyn WorkflowLookup>,
    output_dir: PathBuf,
    /// A weak self-reference, populated via [`Arc::new_cyclic`] at
    /// construction, so a `&self` method (like the [`SubworkflowRunner`]
    /// impl below) can still hand a real, recursing `Arc<dyn
    /// SubworkflowRunner>` down to a nested sub-workflow's own node deps —
    /// letting the call-stack depth cap in `nodes::subworkflow` be the
    /// thing that actually terminates deep nesting, rather than a no-op
    /// runner cutting recursion off one level in.
    self_ref: std::sync::Weak<WorkflowService>,
}

impl WorkflowService {
    pub fn new(
        llm: LlmRegistry,
        tools: ToolRegistry,
        connections: Arc<dyn ConnectionResolver>,
        senders: SenderRegistry,
        assets: Arc<dyn AssetStorage>,
        workflows: Arc<dyn WorkflowLookup>,
        output_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry: NodeRegistry::with_builtins(),
            llm,
            tools,
            connections,
            senders,
            assets,
            workflows,
            output_dir,
            self_ref: weak.clone(),
        })
    }

    /// Every `agent` node's `model` must name a configured provider. Run by
    /// the API layer before accepting a trigger, and again here as a
    /// defense against a workflow whose definition changed after that check.
    pub fn validate(&self, workflow: &WorkflowDefinition) -> Result<()> {
        for node in &workflow.nodes {
            if node.node_type != "agent" {
                continue;
            }
            let model = node
                .config
                .get("model")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    CoreError::Validation(format!("node {}: missing `model`", node.id))
                })?;
            let (provider, _) = crate::llm::split_provider_model(model).ok_or_else(|| {
                CoreError::Validation(format!(
                    "node {}: `model` must be `provider/model`, got `{model}`",
                    node.id
                ))
            })?;
            if !self.llm.is_configured(provider) {
                return Err(CoreError::Validation(format!(
                    "node {}: provider not configured: {provider}",
                    node.id
                )));
            }
        }
        Ok(())
    }

    fn build_deps(self: &Arc<Self>) -> Arc<BuildDeps> {
        self.build_deps_with(self.clone() as Arc<dyn SubworkflowRunner>)
    }

    /// Shared by [`Self::build_deps`] (top-level run) and
    /// [`Self::run_subworkflow`] (nested run) — only the
    /// `subworkflow_runner` handed to the built nodes differs between the
    /// two call sites.
    fn build_deps_with(&self, subworkflow_runner: Arc<dyn SubworkflowRunner>) -> Arc<BuildDeps> {
        Arc::new(BuildDeps::new(
            self.llm.clone(),
            self.tools.clone(),
            self.connections.clone(),
            self.senders.clone(),
            self.assets.clone(),
            self.workflows.clone(),
            subworkflow_runner,
            self.output_dir.clone(),
        ))
    }

    /// Starts a run: validates, builds the DAG and its agents, seeds state
    /// with `inputs` (keyed by input-node id), and spawns execution on a
    /// background task.
    pub fn start_run(
        self: &Arc<Self>,
        workflow: &WorkflowDefinition,
        inputs: HashMap<String, Value>,
    ) -> Result<RunHandles> {
        self.validate(workflow)?;
        let dag = Arc::new(Dag::build(workflow)?);
        let deps = self.build_deps();
        let executor = Arc::new(DagExecutor::build(dag, &self.registry, deps)?);

        let mut state = RunState::new();
        for (node_id, value) in inputs {
            state.insert(RunState::user_input_key(&node_id), value);
        }
        let state: SharedState = Arc::new(AsyncMutex::new(state));

        let handle = Arc::new(ExecutionHandle::new());
        let call_stack: CallStack = Arc::new(AsyncMutex::new(vec![workflow.name.clone()]));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<ExecEvent>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<WorkflowEvent>();
        let (result_tx, result_rx) = oneshot::channel();

        let output_ids: Vec<String> = workflow
            .nodes
            .iter()
            .filter(|n| n.node_type == "output")
            .map(|n| n.id.clone())
            .collect();

        tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                let _ = events_tx.send(translate(event));
            }
        });

        let run_state_for_result = state.clone();
        let handle_for_run = handle.clone();
        tokio::spawn(async move {
            let outcome = executor
                .run(state, handle_for_run, call_stack, raw_tx, cancel_rx)
                .await;
            let result = match outcome {
                Ok(()) => Ok(assemble_result(&run_state_for_result, &output_ids).await),
                Err(err) => Err(err),
            };
            let _ = result_tx.send(result);
        });

        Ok(RunHandles {
            events: events_rx,
            result: result_rx,
            handle,
            cancel: cancel_tx,
        })
    }
}

async fn assemble_result(state: &SharedState, output_ids: &[String]) -> RunResult {
    let guard = state.lock().await;
    let state_map = guard.to_json_map();
    let mut output = serde_json::Map::new();
    for id in output_ids {
        if let Some(value) = guard.get(id) {
            output.insert(id.clone(), value.clone());
        }
    }
    RunResult {
        state: state_map
            .into_iter()
            .filter(|(k, _)| !crate::state::is_internal_key(k))
            .collect(),
        output,
    }
}

#[async_trait]
impl SubworkflowRunner for WorkflowService {
    async fn run_subworkflow(
        &self,
        workflow: &WorkflowDefinition,
        inputs: HashMap<String, Value>,
        events: mpsc::UnboundedSender<NodeEvent>,
        call_stack: CallStack,
        cancelled: watch::Receiver<bool>,
    ) -> Result<HashMap<String, Value>> {
        self.validate(workflow)?;
        let dag = Arc::new(Dag::build(workflow)?);
        // Recover a real `Arc<Self>` from the weak self-reference so a
        // `subworkflow` node nested inside *this* sub-workflow can recurse
        // again, instead of being handed a dead-end runner — the
        // call-stack cycle/depth checks in `nodes::subworkflow` are what's
        // supposed to terminate deep nesting, not this layer. The upgrade
        // only fails if the service itself has already been dropped, which
        // can't happen while a run driven by it is still executing; the
        // null fallback exists purely so that pathological case fails
        // loudly instead of panicking.
        let runner: Arc<dyn SubworkflowRunner> = self
            .self_ref
            .upgrade()
            .map(|service| service as Arc<dyn SubworkflowRunner>)
            .unwrap_or_else(|| Arc::new(NullSubworkflowRunner));
        let deps = self.build_deps_with(runner);
        let executor = Arc::new(DagExecutor::build(dag, &self.registry, deps)?);

        let mut state = RunState::new();
        for (node_id, value) in inputs {
            state.insert(RunState::user_input_key(&node_id), value);
        }
        let state: SharedState = Arc::new(AsyncMutex::new(state));

        let handle = Arc::new(ExecutionHandle::new());
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<ExecEvent>();
        let forward = tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                let node_id = event.node_id.clone();
                let forwarded = match event.kind {
                    ExecEventKind::Node(inner) => inner,
                    other => NodeEvent::Forwarded(serde_json::json!({
                        "node_id": node_id,
                        "kind": format!("{other:?}"),
                    })),
                };
                let _ = events.send(forwarded);
            }
        });

        let run_state = state.clone();
        let outcome = executor.run(state, handle, call_stack, raw_tx, cancelled).await;
        let _ = forward.await;
        outcome?;

        let guard = run_state.lock().await;
        Ok(guard
            .non_internal_sorted()
            .into_iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Fallback used only if [`WorkflowService::self_ref`] fails to upgrade —
/// i.e. the service that's driving this very run has already been dropped.
/// Not reachable in normal operation; exists so that pathological case
/// fails loudly with a clear error instead of panicking.
struct NullSubworkflowRunner;

#[async_trait]
impl SubworkflowRunner for NullSubworkflowRunner {
    async fn run_subworkflow(
        &self,
        _workflow: &WorkflowDefinition,
        _inputs: HashMap<String, Value>,
        _events: mpsc::UnboundedSender<NodeEvent>,
        _call_stack: CallStack,
        _cancelled: watch::Receiver<bool>,
    ) -> Result<HashMap<String, Value>> {
        Err(CoreError::Validation(
            "sub-workflow nesting beyond one level is not supported by this runner".into(),
        ))
    }
}

/// `branch` node outcomes are just state values; this re-exports the
/// truthiness coercion so the API layer's input-validation endpoints can
/// share it without reaching into `state` directly.
pub fn is_truthy(value: &Value) -> bool {
    truthy(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{EdgeDefinition, NodeDefinition, TriggerRule};
    use crate::llm::connection::shared_static_resolver;
    use crate::llm::storage::InMemoryAssetStorage;
    use serde_json::json;

    struct EmptyWorkflowLookup;

    #[async_trait]
    impl WorkflowLookup for EmptyWorkflowLookup {
        async fn lookup(&self, _name: &str) -> Result<Option<WorkflowDefinition>> {
            Ok(None)
        }
    }

    fn service() -> Arc<WorkflowService> {
        WorkflowService::new(
            LlmRegistry::new(),
            ToolRegistry::new(),
            shared_static_resolver(),
            SenderRegistry::with_defaults(),
            Arc::new(InMemoryAssetStorage::new()),
            Arc::new(EmptyWorkflowLookup),
            std::env::temp_dir(),
        )
    }

    fn linear_workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "greet".into(),
            version: "1".into(),
            nodes: vec![
                NodeDefinition { id: "in1".into(), node_type: "input".into(), config: json!({}) },
                NodeDefinition { id: "out1".into(), node_type: "output".into(), config: json!({}) },
            ],
            edges: vec![EdgeDefinition {
                from: "in1".into(),
                to: "out1".into(),
                trigger_rule: TriggerRule::OnSuccess,
                condition: String::new(),
            }],
        }
    }

    #[tokio::test]
    async fn runs_a_linear_workflow_to_completion() {
        let service = service();
        let workflow = linear_workflow();
        let mut inputs = HashMap::new();
        inputs.insert("in1".to_string(), json!("hello"));

        let mut handles = service.start_run(&workflow, inputs).unwrap();
        while handles.events.recv().await.is_some() {}
        let result = handles.result.await.unwrap().unwrap();
        assert_eq!(result.output.get("out1"), Some(&json!("hello")));
    }

    #[test]
    fn validate_rejects_unconfigured_provider() {
        let service = service();
        let workflow = WorkflowDefinition {
            name: "w".into(),
            version: "1".into(),
            nodes: vec![NodeDefinition {
                id: "agent1".into(),
                node_type: "agent".into(),
                config: json!({ "model": "anthropic/claude-3-5-sonnet", "prompt": "hi" }),
            }],
            edges: vec![],
        };
        assert!(service.validate(&workflow).is_err());
    }
}
