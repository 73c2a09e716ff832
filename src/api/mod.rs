//! HTTP API surface (§6): binds the core services to an axum router.
//!
//! Wiring lives here; handler bodies live in [`handlers`] and wire types in
//! [`types`]. [`AppState`] is the one `Clone`-able bundle every handler
//! extracts from — every field is already an `Arc`/cheap-clone internally,
//! so cloning the state per request is free.

pub mod handlers;
pub mod types;

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::concurrency::ConcurrencyLimiter;
use crate::history::HistoryStore;
use crate::repositories::{ConnectionRepository, TriggerRepository, WorkflowRepository};
use crate::retry::RetryPolicy;
use crate::run_manager::RunManager;
use crate::scheduler::Scheduler;
use crate::webhook::WebhookIntake;
use crate::workflow_service::WorkflowService;

pub use handlers::ApiError;

/// The two concurrency ceilings [`ConcurrencyLimiter`] was built with,
/// surfaced so `GET /api/scheduler/stats` can report utilization without
/// the limiter itself needing to expose its configured maxima.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimits {
    pub global_max: usize,
    pub per_workflow_max: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub workflows: Arc<dyn WorkflowRepository>,
    pub service: Arc<WorkflowService>,
    pub run_manager: Arc<RunManager>,
    pub history: Arc<dyn HistoryStore>,
    pub scheduler: Arc<Scheduler>,
    pub triggers: Arc<dyn TriggerRepository>,
    pub connections: Arc<dyn ConnectionRepository>,
    pub concurrency: Arc<ConcurrencyLimiter>,
    pub webhook: Arc<WebhookIntake>,
    pub retry_policy: RetryPolicy,
    pub limits: ConcurrencyLimits,
}

/// Assembles the full route table. CORS is wide open (the platform's
/// front end and any workflow-authoring tool are expected to call this
/// from arbitrary origins) and every request is traced via
/// [`TraceLayer`], matching the rest of the crate's `tracing` usage.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/workflows", get(handlers::list_workflows).post(handlers::create_workflow))
        .route(
            "/api/workflows/:name",
            get(handlers::get_workflow)
                .put(handlers::update_workflow)
                .delete(handlers::delete_workflow),
        )
        .route("/api/workflows/:name/run", post(handlers::run_workflow))
        .route("/api/runs", get(handlers::list_runs))
        .route("/api/runs/:run_id", get(handlers::get_run))
        .route("/api/runs/:run_id/events", get(handlers::run_events))
        .route("/api/runs/:run_id/nodes/:node_id/resume", post(handlers::resume_node))
        .route("/api/schedules", get(handlers::list_schedules).post(handlers::create_schedule))
        .route(
            "/api/schedules/:id",
            get(handlers::get_schedule)
                .put(handlers::update_schedule)
                .delete(handlers::delete_schedule),
        )
        .route("/api/schedules/:id/pause", post(handlers::pause_schedule))
        .route("/api/schedules/:id/resume", post(handlers::resume_schedule))
        .route("/api/schedules/:id/trigger", post(handlers::trigger_schedule))
        .route("/api/triggers", get(handlers::list_triggers).post(handlers::create_trigger))
        .route(
            "/api/triggers/:id",
            get(handlers::get_trigger)
                .put(handlers::update_trigger)
                .delete(handlers::delete_trigger),
        )
        .route("/api/hooks/:trigger_id", post(handlers::webhook_intake))
        .route(
            "/api/connections",
            get(handlers::list_connections).post(handlers::create_connection),
        )
        .route(
            "/api/connections/:id",
            put(handlers::update_connection).delete(handlers::delete_connection).get(handlers::get_connection),
        )
        .route("/api/scheduler/stats", get(handlers::scheduler_stats))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
