//! Admin CLI: a thin `reqwest` client over a running server's HTTP API,
//! for operators who need to inspect schedules, triggers, and run history
//! without a browser.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "workflow-admin")]
#[command(about = "Administrative CLI for a running workflow-core server")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base URL of the server to administer.
    #[arg(long, env = "WORKFLOW_SERVER_URL", default_value = "http://localhost:8080")]
    server_url: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Cron schedules.
    Schedules {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Webhook triggers.
    Triggers {
        #[command(subcommand)]
        action: TriggerAction,
    },
    /// Run history.
    Runs {
        #[command(subcommand)]
        action: RunAction,
    },
    /// Scheduler/concurrency state.
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all schedules.
    List,
    /// Pause a schedule by id.
    Pause { id: String },
    /// Resume a paused schedule by id.
    Resume { id: String },
    /// Fire a schedule immediately, outside its normal cadence.
    Trigger { id: String },
}

#[derive(Subcommand)]
enum TriggerAction {
    /// List all webhook triggers.
    List,
}

#[derive(Subcommand)]
enum RunAction {
    /// List runs, optionally filtered by workflow name or status.
    List {
        #[arg(long)]
        workflow: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one run by id.
    Get { run_id: String },
}

#[derive(Subcommand)]
enum SchedulerAction {
    /// Show concurrency utilization.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let client = reqwest::Client::new();

    let result = match cli.command {
        Commands::Schedules { action } => schedule_command(&client, &cli.server_url, action).await,
        Commands::Triggers { action } => trigger_command(&client, &cli.server_url, action).await,
        Commands::Runs { action } => run_command(&client, &cli.server_url, action).await,
        Commands::Scheduler { action } => scheduler_command(&client, &cli.server_url, action).await,
    };

    if let Err(err) = &result {
        error!(error = %err, "admin command failed");
    }
    result
}

async fn get_json(client: &reqwest::Client, url: String) -> Result<()> {
    let body: serde_json::Value = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("requesting {url}"))?
        .error_for_status()
        .with_context(|| format!("server returned an error for {url}"))?
        .json()
        .await
        .context("decoding response body")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn post_json(client: &reqwest::Client, url: String) -> Result<()> {
    let body: serde_json::Value = client
        .post(&url)
        .send()
        .await
        .with_context(|| format!("requesting {url}"))?
        .error_for_status()
        .with_context(|| format!("server returned an error for {url}"))?
        .json()
        .await
        .context("decoding response body")?;
    info!(%url, "command accepted");
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn schedule_command(client: &reqwest::Client, base: &str, action: ScheduleAction) -> Result<()> {
    match action {
        ScheduleAction::List => get_json(client, format!("{base}/api/schedules")).await,
        ScheduleAction::Pause { id } => post_json(client, format!("{base}/api/schedules/{id}/pause")).await,
        ScheduleAction::Resume { id } => post_json(client, format!("{base}/api/schedules/{id}/resume")).await,
        ScheduleAction::Trigger { id } => post_json(client, format!("{base}/api/schedules/{id}/trigger")).await,
    }
}

async fn trigger_command(client: &reqwest::Client, base: &str, action: TriggerAction) -> Result<()> {
    match action {
        TriggerAction::List => get_json(client, format!("{base}/api/triggers")).await,
    }
}

async fn run_command(client: &reqwest::Client, base: &str, action: RunAction) -> Result<()> {
    match action {
        RunAction::List { workflow, status } => {
            let mut url = format!("{base}/api/runs");
            let mut query = Vec::new();
            if let Some(workflow) = &workflow {
                query.push(format!("workflow={workflow}"));
            }
            if let Some(status) = &status {
                query.push(format!("status={status}"));
            }
            if !query.is_empty() {
                url.push('?');
                url.push_str(&query.join("&"));
            }
            get_json(client, url).await
        }
        RunAction::Get { run_id } => get_json(client, format!("{base}/api/runs/{run_id}")).await,
    }
}

async fn scheduler_command(client: &reqwest::Client, base: &str, action: SchedulerAction) -> Result<()> {
    match action {
        SchedulerAction::Stats => get_json(client, format!("{base}/api/scheduler/stats")).await,
    }
}
