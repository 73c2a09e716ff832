//! The HTTP server binary: wires every repository, service, and the
//! scheduler into an [`api::AppState`] and serves the resulting router.
//! Run with: cargo run --bin server

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use workflow_core::api::{self, AppState, ConcurrencyLimits};
use workflow_core::concurrency::ConcurrencyLimiter;
use workflow_core::config::AppConfig;
use workflow_core::history::InMemoryHistoryStore;
use workflow_core::llm::provider::{AnthropicProvider, OpenAiProvider};
use workflow_core::llm::sender::SenderRegistry;
use workflow_core::llm::storage::InMemoryAssetStorage;
use workflow_core::llm::tool::ToolRegistry;
use workflow_core::llm::LlmRegistry;
use workflow_core::repositories::{
    InMemoryConnectionRepository, InMemoryScheduleRepository, InMemoryTriggerRepository,
    InMemoryWorkflowRepository,
};
use workflow_core::retry::RetryPolicy;
use workflow_core::run_manager::RunManager;
use workflow_core::scheduler::Scheduler;
use workflow_core::webhook::WebhookIntake;
use workflow_core::workflow_service::WorkflowService;
use workflow_core::Result;

fn build_llm_registry(config: &AppConfig) -> LlmRegistry {
    let mut registry = LlmRegistry::new();
    if let Some(key) = &config.providers.anthropic_api_key {
        registry.register(Arc::new(AnthropicProvider::new(key.clone(), None)));
    }
    if let Some(key) = &config.providers.openai_api_key {
        registry.register(Arc::new(OpenAiProvider::new("openai", key.clone(), None)));
    }
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    let workflows = InMemoryWorkflowRepository::new();
    let schedules = InMemoryScheduleRepository::new();
    let triggers = InMemoryTriggerRepository::new();
    let connections = InMemoryConnectionRepository::new();

    let llm = build_llm_registry(&config);
    let tools = ToolRegistry::new();
    let senders = SenderRegistry::with_defaults();
    let assets = Arc::new(InMemoryAssetStorage::new());

    let service = WorkflowService::new(
        llm,
        tools,
        connections.clone(),
        senders,
        assets,
        workflows.clone(),
        PathBuf::from("."),
    );

    let history = InMemoryHistoryStore::new();
    let run_manager = Arc::new(RunManager::new(std::time::Duration::from_secs(config.run_ttl_secs)));
    run_manager.spawn_gc();

    let concurrency = Arc::new(ConcurrencyLimiter::new(
        config.concurrency.global_max,
        config.concurrency.per_workflow_max,
    ));
    let retry_policy = RetryPolicy::default();

    let webhook = Arc::new(WebhookIntake::new(
        triggers.clone(),
        workflows.clone(),
        service.clone(),
        concurrency.clone(),
        history.clone(),
        run_manager.clone(),
        retry_policy.clone(),
    ));

    let scheduler = Scheduler::new(
        schedules,
        workflows.clone(),
        service.clone(),
        concurrency.clone(),
        history.clone(),
        run_manager.clone(),
        retry_policy.clone(),
    );
    scheduler.start().await?;

    let state = AppState {
        workflows,
        service,
        run_manager,
        history,
        scheduler,
        triggers,
        connections,
        concurrency: concurrency.clone(),
        webhook,
        retry_policy,
        limits: ConcurrencyLimits {
            global_max: config.concurrency.global_max,
            per_workflow_max: config.concurrency.per_workflow_max,
        },
    };

    let router = api::router(state);
    let addr: std::net::SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|err| workflow_core::CoreError::Other(anyhow::anyhow!(err)))?;
    info!(%addr, "starting workflow-core server");

    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await
        .map_err(|err| workflow_core::CoreError::Other(anyhow::anyhow!(err)))?;

    Ok(())
}
