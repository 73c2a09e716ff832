//! DAG executor: spawns one cooperative task per node, gates each on its
//! parents' recorded outcomes via the edge trigger-rule/condition pair,
//! and streams every node's events to a caller-supplied channel.
//!
//! Each node task owns a `tokio::sync::watch::channel<Option<NodeOutcome>>`
//! that starts `None` and is set exactly once — its "done" signal per §4.6.
//! A sibling's wait loop treats an unset-but-closed channel (the sender
//! dropped without ever sending) as `completed`, matching the
//! specification's explicit resolution of that legacy case. A single
//! `watch::channel<bool>` carries cooperative cancellation: the first
//! unhandled node failure flips it, and every suspension point in this
//! module and in `nodes` races it alongside whatever it's actually waiting
//! for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::dag::{Dag, NodeOutcome, TriggerRule};
use crate::handle::ExecutionHandle;
use crate::nodes::{BuildDeps, CallStack, NodeAgent, NodeContext, NodeEvent, NodeRegistry, SharedState};
use crate::{CoreError, Result};

/// One event surfaced by the executor: either its own bookkeeping
/// (`started`/`completed`/`skipped`/`error`) or a node-emitted interior
/// event, always tagged with the node id it came from.
#[derive(Debug, Clone)]
pub struct ExecEvent {
    pub node_id: String,
    pub kind: ExecEventKind,
}

#[derive(Debug, Clone)]
pub enum ExecEventKind {
    Started,
    Completed,
    Skipped,
    Error { message: String },
    Node(NodeEvent),
}

pub struct DagExecutor {
    dag: Arc<Dag>,
    agents: HashMap<String, Arc<dyn NodeAgent>>,
    deps: Arc<BuildDeps>,
}

impl DagExecutor {
    pub fn build(dag: Arc<Dag>, registry: &NodeRegistry, deps: Arc<BuildDeps>) -> Result<Self> {
        let agents = registry.build_all(&dag, deps.clone())?;
        Ok(Self { dag, agents, deps })
    }

    pub fn dag(&self) -> &Arc<Dag> {
        &self.dag
    }

    /// Runs every node task to completion. Returns `Ok(())` if the run
    /// finished without an unhandled node failure (individual nodes may
    /// still have recorded `failed` if a downstream `on_failure`/`always`
    /// edge absorbed it), `Err` if the run was cancelled by the first
    /// unhandled failure.
    /// `external_cancel` lets a caller (the workflow service's cancel
    /// endpoint, or a parent run cancelling a `subworkflow`) fold its own
    /// cancellation into this run's without owning its internal channel.
    pub async fn run(
        self: Arc<Self>,
        state: SharedState,
        handle: Arc<ExecutionHandle>,
        call_stack: CallStack,
        events_tx: mpsc::UnboundedSender<ExecEvent>,
        mut external_cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let fatal: Arc<SyncMutex<Option<String>>> = Arc::new(SyncMutex::new(None));
        let outcomes: Arc<DashMap<String, NodeOutcome>> = Arc::new(DashMap::new());

        if *external_cancel.borrow() {
            let _ = cancel_tx.send(true);
        } else {
            let forward_tx = cancel_tx.clone();
            tokio::spawn(async move {
                wait_cancelled(&mut external_cancel).await;
                let _ = forward_tx.send(true);
            });
        }

        let mut done_tx: HashMap<String, watch::Sender<Option<NodeOutcome>>> = HashMap::new();
        let mut done_rx: HashMap<String, watch::Receiver<Option<NodeOutcome>>> = HashMap::new();
        for id in self.dag.node_ids() {
            let (tx, rx) = watch::channel::<Option<NodeOutcome>>(None);
            done_tx.insert(id.clone(), tx);
            done_rx.insert(id.clone(), rx);
        }

        let mut joins = JoinSet::new();
        for id in self.dag.topological_order() {
            let id = id.clone();
            let parent_rx: Vec<(String, watch::Receiver<Option<NodeOutcome>>)> = self
                .dag
                .parents(&id)
                .iter()
                .map(|p| (p.clone(), done_rx[p].clone()))
                .collect();
            let done_tx_this = done_tx[&id].clone();
            let dag = self.dag.clone();
            let agent = self.agents.get(&id).cloned();
            let state = state.clone();
            let handle = handle.clone();
            let call_stack = call_stack.clone();
            let deps = self.deps.clone();
            let events_tx = events_tx.clone();
            let cancel_rx_task = cancel_rx.clone();
            let cancel_tx_task = cancel_tx.clone();
            let fatal = fatal.clone();
            let outcomes = outcomes.clone();

            joins.spawn(run_node_task(
                id,
                dag,
                agent,
                parent_rx,
                done_tx_this,
                cancel_rx_task,
                cancel_tx_task,
                fatal,
                outcomes,
                state,
                handle,
                call_stack,
                deps,
                events_tx,
            ));
        }

        while joins.join_next().await.is_some() {}

        let fatal_message = fatal.lock().unwrap().take();
        match fatal_message {
            Some(message) => Err(CoreError::FatalNode(message)),
            None => Ok(()),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_node_task(
    node_id: String,
    dag: Arc<Dag>,
    agent: Option<Arc<dyn NodeAgent>>,
    mut parent_rx: Vec<(String, watch::Receiver<Option<NodeOutcome>>)>,
    done_tx: watch::Sender<Option<NodeOutcome>>,
    mut cancel_rx: watch::Receiver<bool>,
    cancel_tx: watch::Sender<bool>,
    fatal: Arc<SyncMutex<Option<String>>>,
    outcomes: Arc<DashMap<String, NodeOutcome>>,
    state: SharedState,
    handle: Arc<ExecutionHandle>,
    call_stack: CallStack,
    deps: Arc<BuildDeps>,
    events_tx: mpsc::UnboundedSender<ExecEvent>,
) {
    let parent_outcomes = tokio::select! {
        biased;
        _ = wait_cancelled(&mut cancel_rx) => {
            // Cancelled before this node ever had a chance to run: record
            // `skipped` so dependents unblock without a spurious failure.
            let _ = done_tx.send(Some(NodeOutcome::Skipped));
            outcomes.insert(node_id, NodeOutcome::Skipped);
            return;
        }
        result = wait_parents(&mut parent_rx) => result,
    };

    let should_run = if dag.parents(&node_id).is_empty() {
        true
    } else {
        let mut any_active = false;
        for (i, outcome) in parent_outcomes.iter().enumerate() {
            let (parent_id, _) = &parent_rx[i];
            if let Some(edge) = dag.incoming_edge(parent_id, &node_id) {
                if edge.trigger_rule.matches(*outcome)
                    && evaluate_condition_sync(&state, &edge.condition).await
                {
                    any_active = true;
                    break;
                }
            }
        }
        any_active
    };

    if !should_run {
        let _ = events_tx.send(ExecEvent {
            node_id: node_id.clone(),
            kind: ExecEventKind::Skipped,
        });
        let _ = done_tx.send(Some(NodeOutcome::Skipped));
        outcomes.insert(node_id, NodeOutcome::Skipped);
        return;
    }

    let _ = events_tx.send(ExecEvent {
        node_id: node_id.clone(),
        kind: ExecEventKind::Started,
    });

    let Some(agent) = agent else {
        // Build already validated every node has a registered type; this
        // only happens if a caller constructs a DagExecutor by hand with a
        // partial agent map.
        let message = format!("no agent built for node: {node_id}");
        finish_failed(&node_id, message, &dag, &events_tx, &done_tx, &outcomes, &fatal, &cancel_tx);
        return;
    };

    let (node_tx, mut node_rx) = mpsc::unbounded_channel::<NodeEvent>();
    let ctx = NodeContext {
        node_id: node_id.clone(),
        dag: dag.clone(),
        state,
        events: node_tx,
        handle,
        cancelled: cancel_rx.clone(),
        call_stack,
        deps,
    };

    let run_fut = agent.run(ctx);
    tokio::pin!(run_fut);
    let result = loop {
        tokio::select! {
            biased;
            Some(event) = node_rx.recv() => {
                let _ = events_tx.send(ExecEvent {
                    node_id: node_id.clone(),
                    kind: ExecEventKind::Node(event),
                });
            }
            res = &mut run_fut => break res,
        }
    };
    while let Ok(event) = node_rx.try_recv() {
        let _ = events_tx.send(ExecEvent {
            node_id: node_id.clone(),
            kind: ExecEventKind::Node(event),
        });
    }

    match result {
        Ok(()) => {
            let _ = events_tx.send(ExecEvent {
                node_id: node_id.clone(),
                kind: ExecEventKind::Completed,
            });
            let _ = done_tx.send(Some(NodeOutcome::Completed));
            outcomes.insert(node_id, NodeOutcome::Completed);
        }
        Err(err) => {
            finish_failed(
                &node_id,
                err.to_string(),
                &dag,
                &events_tx,
                &done_tx,
                &outcomes,
                &fatal,
                &cancel_tx,
            );
        }
    }
}

/// Records a node failure and decides whether it cancels the run: any
/// outgoing edge with `trigger_rule ∈ {on_failure, always}` means a
/// downstream successor can handle it, so the error is swallowed and the
/// run continues. Otherwise the run's first fatal error is recorded and
/// cooperative cancellation is triggered.
fn finish_failed(
    node_id: &str,
    message: String,
    dag: &Dag,
    events_tx: &mpsc::UnboundedSender<ExecEvent>,
    done_tx: &watch::Sender<Option<NodeOutcome>>,
    outcomes: &DashMap<String, NodeOutcome>,
    fatal: &SyncMutex<Option<String>>,
    cancel_tx: &watch::Sender<bool>,
) {
    let _ = done_tx.send(Some(NodeOutcome::Failed));
    outcomes.insert(node_id.to_string(), NodeOutcome::Failed);

    let has_failure_handler = dag.children(node_id).iter().any(|child| {
        dag.edge(node_id, child)
            .map(|edge| matches!(edge.trigger_rule, TriggerRule::OnFailure | TriggerRule::Always))
            .unwrap_or(false)
    });

    let _ = events_tx.send(ExecEvent {
        node_id: node_id.to_string(),
        kind: ExecEventKind::Error {
            message: message.clone(),
        },
    });

    if !has_failure_handler {
        let mut guard = fatal.lock().unwrap();
        if guard.is_none() {
            *guard = Some(message);
        }
        drop(guard);
        let _ = cancel_tx.send(true);
    }
}

async fn wait_parents(
    parent_rx: &mut [(String, watch::Receiver<Option<NodeOutcome>>)],
) -> Vec<NodeOutcome> {
    let mut outcomes = Vec::with_capacity(parent_rx.len());
    for (_, rx) in parent_rx.iter_mut() {
        let outcome = loop {
            if let Some(o) = *rx.borrow() {
                break o;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without ever recording an outcome: the
                // specification mandates treating this legacy case as
                // `completed`.
                break NodeOutcome::Completed;
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// `shouldRun`'s condition check needs the run state but must not hold an
/// async lock across the `tokio::select!` above; this takes a synchronous
/// snapshot immediately before evaluating.
async fn evaluate_condition_sync(state: &SharedState, condition: &str) -> bool {
    let guard = state.lock().await;
    crate::condition::evaluate(condition, &guard)
}
