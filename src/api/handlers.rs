//! HTTP handlers backing the router in [`super`]. Each handler is a thin
//! binding over one of the core services — it does no business logic of
//! its own beyond translating HTTP in and out.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use tracing::error;
use uuid::Uuid;

use crate::dag::WorkflowDefinition;
use crate::history::{HistoryStore, ListFilter, RunRecord};
use crate::llm::connection::Connection;
use crate::repositories::{
    ConnectionRepository, ScheduleDefinition, TriggerDefinition, TriggerRepository,
    WorkflowRepository,
};
use crate::retry::execute_with_retry;
use crate::run_manager::EventRecord;
use crate::state::Value;
use crate::workflow_service::WorkflowEvent;
use crate::{CoreError, ErrorKind};

use super::types::{
    ConnectionRequest, ListQuery, RunAccepted, RunRequest, SchedulerStats, ScheduleRequest,
    StatusResponse, TriggerRequest, ConcurrencyStats,
};
use super::AppState;

/// Wraps [`CoreError`] so handlers can use `?` against it and get the §7
/// status-code mapping for free via [`CoreError::kind`].
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Timeout
            | ErrorKind::RetryableTransient
            | ErrorKind::FatalNode
            | ErrorKind::Cancelled
            | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "workflow-core",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "not found" })))
}

// ---------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------

pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkflowDefinition>>, ApiError> {
    Ok(Json(state.workflows.list().await?))
}

pub async fn get_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    Ok(Json(state.workflows.get(&name).await?))
}

pub async fn create_workflow(
    State(state): State<AppState>,
    Json(workflow): Json<WorkflowDefinition>,
) -> Result<(StatusCode, Json<WorkflowDefinition>), ApiError> {
    state.workflows.put(workflow.clone()).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

pub async fn update_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut workflow): Json<WorkflowDefinition>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    workflow.name = name;
    state.workflows.put(workflow.clone()).await?;
    Ok(Json(workflow))
}

pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.workflows.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/workflows/{name}/run`: validates, acquires a concurrency
/// slot, and dispatches the run through the retry executor on a detached
/// task, mirroring the dispatch shape in [`crate::webhook`] and
/// [`crate::scheduler`] for the manual-trigger path. Returns as soon as the
/// slot is acquired and the task is spawned — it does not wait for the run.
pub async fn run_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<RunRequest>,
) -> Result<(StatusCode, Json<RunAccepted>), ApiError> {
    let workflow = match req.workflow {
        Some(def) => def,
        None => state.workflows.get(&name).await?,
    };
    if workflow.name != name {
        return Err(CoreError::Validation(format!(
            "workflow name mismatch: path names `{name}`, body names `{}`",
            workflow.name
        ))
        .into());
    }

    let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let slot = state.concurrency.acquire(&workflow.name, cancel_rx).await?;

    let dispatch_id = Uuid::new_v4().to_string();
    let accepted_run_id = format!("{dispatch_id}-0");

    let service = state.service.clone();
    let history = state.history.clone();
    let run_manager = state.run_manager.clone();
    let policy = state.retry_policy.clone();
    let workflow_name = workflow.name.clone();
    let inputs = req.inputs;

    tokio::spawn(async move {
        let _slot = slot;
        let outcome = execute_with_retry(
            &policy,
            |attempt| format!("{dispatch_id}-{attempt}"),
            |attempt, retry_of| {
                let service = service.clone();
                let history = history.clone();
                let run_manager = run_manager.clone();
                let workflow = workflow.clone();
                let inputs = inputs.clone();
                let workflow_name = workflow_name.clone();
                let run_id = format!("{dispatch_id}-{attempt}");
                async move {
                    let _ = history.start_run(&run_id, &workflow_name, retry_of, attempt).await;
                    run_manager.register(run_id.clone());
                    let mut handles = service.start_run(&workflow, inputs)?;
                    let _ = run_manager.attach_handle(&run_id, handles.handle.clone()).await;
                    while let Some(event) = handles.events.recv().await {
                        let _ = run_manager.append(&run_id, event).await;
                    }
                    let result = handles
                        .result
                        .await
                        .map_err(|_| CoreError::Other(anyhow::anyhow!("run task dropped")))?;
                    match &result {
                        Ok(value) => {
                            let _ = history.complete_run(&run_id).await;
                            let _ = run_manager.complete(&run_id, value.clone()).await;
                        }
                        Err(err) => {
                            let _ = history.fail_run(&run_id, err.to_string()).await;
                            let _ = run_manager.fail(&run_id, err.to_string()).await;
                        }
                    }
                    result
                }
            },
        )
        .await;

        if let Err(err) = &outcome.result {
            error!(dispatch_id = %dispatch_id, error = %err, "manual run exhausted retries");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(RunAccepted { run_id: accepted_run_id })))
}

// ---------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------

pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<RunRecord>>, ApiError> {
    let filter: ListFilter = query.filter();
    let records = match &query.workflow {
        Some(name) => state.history.list_by_workflow(name, filter).await?,
        None => state.history.list_all(filter).await?,
    };
    Ok(Json(records))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunRecord>, ApiError> {
    Ok(Json(state.history.get(&run_id).await?))
}

fn event_type_name(event: &WorkflowEvent) -> &'static str {
    match event {
        WorkflowEvent::NodeStarted { .. } => "node_started",
        WorkflowEvent::NodeCompleted { .. } => "node_completed",
        WorkflowEvent::NodeSkipped { .. } => "node_skipped",
        WorkflowEvent::NodeWaiting { .. } => "node_waiting",
        WorkflowEvent::ToolCall { .. } => "tool_call",
        WorkflowEvent::ToolResult { .. } => "tool_result",
        WorkflowEvent::Log { .. } => "log",
        WorkflowEvent::Error { .. } => "error",
    }
}

fn record_to_sse(record: EventRecord) -> Event {
    let data = serde_json::to_string(&record.event).unwrap_or_else(|_| "null".to_string());
    Event::default()
        .id(record.seq.to_string())
        .event(event_type_name(&record.event))
        .data(data)
}

/// `GET /api/runs/{id}/events`: streams buffered + live events as SSE,
/// honoring `Last-Event-ID` for reconnect, finishing with a `done` frame
/// (§6). A disconnecting client does not cancel the run (§5) — this
/// handler simply stops reading; the run keeps executing and buffering in
/// [`crate::run_manager::RunManager`] regardless.
pub async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, ApiError> {
    let start_seq = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(|last| last + 1)
        .unwrap_or(0);

    let sub = state.run_manager.subscribe(&run_id, start_seq)?;

    struct Cursor {
        sub: crate::run_manager::EventSubscription,
        run_id: String,
        pending: std::collections::VecDeque<Event>,
        done: bool,
    }

    let cursor = Cursor {
        sub,
        run_id,
        pending: std::collections::VecDeque::new(),
        done: false,
    };

    let stream = futures::stream::unfold(cursor, |mut cursor| async move {
        loop {
            if let Some(event) = cursor.pending.pop_front() {
                return Some((Ok::<_, Infallible>(event), cursor));
            }
            if cursor.done {
                return None;
            }
            let batch = cursor.sub.next_batch().await;
            if batch.is_empty() {
                cursor.done = true;
                if let Some(result) = cursor.sub.final_result().await {
                    let payload = match result {
                        Ok(run_result) => serde_json::json!({
                            "status": "success",
                            "session_id": cursor.run_id,
                            "run_id": cursor.run_id,
                            "state": run_result.state,
                        }),
                        Err(message) => serde_json::json!({
                            "status": "failed",
                            "session_id": cursor.run_id,
                            "run_id": cursor.run_id,
                            "error": message,
                        }),
                    };
                    cursor
                        .pending
                        .push_back(Event::default().event("done").data(payload.to_string()));
                }
                continue;
            }
            for record in batch {
                cursor.pending.push_back(record_to_sse(record));
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive")))
}

/// `POST /api/runs/{id}/nodes/{nodeId}/resume`: delivers a resume payload
/// to whichever node is currently parked in [`crate::handle::ExecutionHandle::wait_for_resume`].
pub async fn resume_node(
    State(state): State<AppState>,
    Path((run_id, node_id)): Path<(String, String)>,
    Json(payload): Json<HashMap<String, Value>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let handle = state
        .run_manager
        .handle(&run_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("run not waiting on any node: {run_id}")))?;
    handle.resume(&node_id, payload)?;
    Ok(Json(StatusResponse::new("resumed")))
}

// ---------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------

pub async fn list_schedules(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScheduleDefinition>>, ApiError> {
    Ok(Json(state.scheduler.list().await?))
}

pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ScheduleDefinition>, ApiError> {
    Ok(Json(state.scheduler.get(&id).await?))
}

fn schedule_from_request(req: ScheduleRequest, id_override: Option<String>) -> ScheduleDefinition {
    let cron_expr = req.cron_with_timezone();
    ScheduleDefinition {
        id: id_override.or(req.id).unwrap_or_else(|| Uuid::new_v4().to_string()),
        workflow_name: req.workflow_name,
        cron_expr,
        inputs: req.inputs,
        enabled: req.enabled,
        last_run_at: None,
        next_run_at: None,
    }
}

pub async fn create_schedule(
    State(state): State<AppState>,
    Json(req): Json<ScheduleRequest>,
) -> Result<(StatusCode, Json<ScheduleDefinition>), ApiError> {
    let definition = schedule_from_request(req, None);
    state.scheduler.add(definition.clone()).await?;
    let stored = state.scheduler.get(&definition.id).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ScheduleRequest>,
) -> Result<Json<ScheduleDefinition>, ApiError> {
    let definition = schedule_from_request(req, Some(id));
    state.scheduler.update(definition.clone()).await?;
    let stored = state.scheduler.get(&definition.id).await?;
    Ok(Json(stored))
}

pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pause_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.scheduler.pause(&id).await?;
    Ok(Json(StatusResponse::new("paused")))
}

pub async fn resume_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.scheduler.resume(&id).await?;
    Ok(Json(StatusResponse::new("resumed")))
}

pub async fn trigger_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.scheduler.trigger_now(&id).await?;
    Ok(Json(StatusResponse::new("triggered")))
}

// ---------------------------------------------------------------------
// Triggers (webhooks)
// ---------------------------------------------------------------------

pub async fn list_triggers(
    State(state): State<AppState>,
) -> Result<Json<Vec<TriggerDefinition>>, ApiError> {
    Ok(Json(state.triggers.list().await?))
}

pub async fn get_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TriggerDefinition>, ApiError> {
    Ok(Json(state.triggers.get(&id).await?))
}

fn trigger_from_request(req: TriggerRequest, id_override: Option<String>) -> TriggerDefinition {
    TriggerDefinition {
        id: id_override.or(req.id).unwrap_or_else(|| Uuid::new_v4().to_string()),
        workflow_name: req.workflow_name,
        secret: req.secret,
        enabled: req.enabled,
        input_mapping: req.input_mapping,
    }
}

pub async fn create_trigger(
    State(state): State<AppState>,
    Json(req): Json<TriggerRequest>,
) -> Result<(StatusCode, Json<TriggerDefinition>), ApiError> {
    let trigger = trigger_from_request(req, None);
    state.triggers.put(trigger.clone()).await?;
    Ok((StatusCode::CREATED, Json(trigger)))
}

pub async fn update_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TriggerRequest>,
) -> Result<Json<TriggerDefinition>, ApiError> {
    let trigger = trigger_from_request(req, Some(id));
    state.triggers.put(trigger.clone()).await?;
    Ok(Json(trigger))
}

pub async fn delete_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.triggers.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/hooks/{trigger_id}` (§4.12): the externally-facing webhook
/// intake. Raw body is read unconditionally — malformed JSON inside it is
/// tolerated by [`crate::webhook::WebhookIntake::handle`], not rejected
/// here.
pub async fn webhook_intake(
    State(state): State<AppState>,
    Path(trigger_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let signature = headers
        .get("x-webhook-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let run_id = state.webhook.handle(&trigger_id, &body, signature).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "accepted", "trigger": trigger_id, "run_id": run_id})),
    ))
}

// ---------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------

pub async fn list_connections(
    State(state): State<AppState>,
) -> Result<Json<Vec<Connection>>, ApiError> {
    Ok(Json(state.connections.list().await?))
}

pub async fn get_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Connection>, ApiError> {
    Ok(Json(state.connections.get(&id).await?))
}

fn connection_from_request(req: ConnectionRequest, id_override: Option<String>) -> Connection {
    Connection {
        id: id_override.or(req.id).unwrap_or_else(|| Uuid::new_v4().to_string()),
        type_name: req.type_name,
        config: req.config,
    }
}

pub async fn create_connection(
    State(state): State<AppState>,
    Json(req): Json<ConnectionRequest>,
) -> Result<(StatusCode, Json<Connection>), ApiError> {
    let connection = connection_from_request(req, None);
    state.connections.put(connection.clone()).await?;
    Ok((StatusCode::CREATED, Json(connection)))
}

pub async fn update_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConnectionRequest>,
) -> Result<Json<Connection>, ApiError> {
    let connection = connection_from_request(req, Some(id));
    state.connections.put(connection.clone()).await?;
    Ok(Json(connection))
}

pub async fn delete_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.connections.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------
// Scheduler stats
// ---------------------------------------------------------------------

pub async fn scheduler_stats(State(state): State<AppState>) -> Json<SchedulerStats> {
    let active_runs = state
        .limits
        .global_max
        .saturating_sub(state.concurrency.available_global());
    Json(SchedulerStats {
        concurrency: ConcurrencyStats {
            active_runs,
            global_max: state.limits.global_max,
            per_workflow: state.limits.per_workflow_max,
        },
    })
}
