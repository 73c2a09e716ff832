//! Cron scheduler: the trigger layer's time-based entry point (§4.13).
//!
//! Each enabled [`ScheduleDefinition`] is parsed into a [`cron::Schedule`]
//! and re-registered on [`Scheduler::start`]. A background tick loop wakes
//! once a second, and for any schedule whose computed next fire time has
//! passed, runs [`Scheduler::execute_scheduled_run`]: acquire a concurrency
//! slot, look up the workflow, hand it to the retry executor, drain its
//! events into history, then stamp `last_run_at`/`next_run_at`.
//!
//! Cron expressions accept a standard 5-field form (minute hour
//! day-of-month month day-of-week, seconds implied `0`) or the `cron`
//! crate's native 6-field form, tried in that order, with an optional
//! `CRON_TZ=<zone>` prefix naming the zone the expression is evaluated in.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::concurrency::ConcurrencyLimiter;
use crate::history::HistoryStore;
use crate::nodes::WorkflowLookup;
use crate::repositories::{ScheduleDefinition, ScheduleRepository};
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::run_manager::RunManager;
use crate::state::Value;
use crate::workflow_service::WorkflowService;
use crate::{CoreError, Result};

/// Parses a cron expression, accepting a 5-field standard form (seconds
/// field implied as `0`) or the `cron` crate's native form, in that order,
/// with an optional `CRON_TZ=<zone>` prefix.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let (tz_prefix, rest) = match expr.strip_prefix("CRON_TZ=") {
        Some(after) => {
            let mut parts = after.splitn(2, char::is_whitespace);
            let tz = parts.next().unwrap_or_default();
            let rest = parts.next().unwrap_or_default().trim();
            (Some(tz.to_string()), rest.to_string())
        }
        None => (None, expr.to_string()),
    };

    let field_count = rest.split_whitespace().count();
    let mut candidates = Vec::new();
    if field_count == 5 {
        candidates.push(format!("0 {rest}"));
    }
    candidates.push(rest.clone());

    let mut last_err = None;
    for candidate in candidates {
        let full = match &tz_prefix {
            Some(tz) => format!("CRON_TZ={tz} {candidate}"),
            None => candidate,
        };
        match Schedule::from_str(&full) {
            Ok(schedule) => return Ok(schedule),
            Err(err) => last_err = Some(err.to_string()),
        }
    }
    Err(CoreError::Cron(format!(
        "invalid cron expression `{expr}`: {}",
        last_err.unwrap_or_default()
    )))
}

struct Entry {
    schedule: Schedule,
}

pub struct Scheduler {
    repo: Arc<dyn ScheduleRepository>,
    workflow_lookup: Arc<dyn WorkflowLookup>,
    workflow_service: Arc<WorkflowService>,
    concurrency: Arc<ConcurrencyLimiter>,
    history: Arc<dyn HistoryStore>,
    run_manager: Arc<RunManager>,
    retry_policy: RetryPolicy,
    entries: DashMap<String, Entry>,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn ScheduleRepository>,
        workflow_lookup: Arc<dyn WorkflowLookup>,
        workflow_service: Arc<WorkflowService>,
        concurrency: Arc<ConcurrencyLimiter>,
        history: Arc<dyn HistoryStore>,
        run_manager: Arc<RunManager>,
        retry_policy: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            workflow_lookup,
            workflow_service,
            concurrency,
            history,
            run_manager,
            retry_policy,
            entries: DashMap::new(),
        })
    }

    /// Loads every enabled schedule from the repository and registers it,
    /// then spawns the tick loop. Call once at process start.
    pub async fn start(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>> {
        for definition in self.repo.list_enabled().await? {
            if let Err(err) = self.register(&definition) {
                warn!(schedule_id = %definition.id, error = %err, "skipping schedule with invalid cron expression");
            }
        }
        let scheduler = self.clone();
        Ok(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                scheduler.tick().await;
            }
        }))
    }

    fn register(&self, definition: &ScheduleDefinition) -> Result<()> {
        let schedule = parse_cron(&definition.cron_expr)?;
        self.entries.insert(definition.id.clone(), Entry { schedule });
        Ok(())
    }

    /// Persists a schedule, computing `next_run_at` first so callers (and
    /// any UI reading it back) never observe a zero/absent value (§4.11).
    pub async fn add(&self, mut definition: ScheduleDefinition) -> Result<()> {
        let schedule = parse_cron(&definition.cron_expr)?;
        definition.next_run_at = schedule.upcoming(Utc).next();
        self.repo.put(definition.clone()).await?;
        if definition.enabled {
            self.register(&definition)?;
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<ScheduleDefinition> {
        self.repo.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<ScheduleDefinition>> {
        self.repo.list().await
    }

    pub async fn update(&self, definition: ScheduleDefinition) -> Result<()> {
        self.add(definition).await
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let mut definition = self.repo.get(id).await?;
        definition.enabled = false;
        self.repo.put(definition).await?;
        self.entries.remove(id);
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        let mut definition = self.repo.get(id).await?;
        definition.enabled = true;
        self.repo.put(definition.clone()).await?;
        self.register(&definition)?;
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.repo.delete(id).await?;
        self.entries.remove(id);
        Ok(())
    }

    /// Fires a schedule immediately, outside its normal cron cadence.
    pub async fn trigger_now(&self, id: &str) -> Result<()> {
        let definition = self.repo.get(id).await?;
        self.execute_scheduled_run(definition).await
    }

    async fn tick(&self) {
        let now = Utc::now();
        let due: Vec<String> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let mut upcoming = entry.schedule.after(&(now - chrono::Duration::seconds(1)));
                match upcoming.next() {
                    Some(next) if next <= now => Some(entry.key().clone()),
                    _ => None,
                }
            })
            .collect();

        for id in due {
            let definition = match self.repo.get(&id).await {
                Ok(d) => d,
                Err(err) => {
                    warn!(schedule_id = %id, error = %err, "schedule vanished between tick and fire");
                    continue;
                }
            };
            if let Err(err) = self.execute_scheduled_run(definition).await {
                error!(schedule_id = %id, error = %err, "scheduled run failed to start");
            }
        }
    }

    /// Looks up the workflow, takes a non-blocking concurrency slot (log and
    /// skip this tick if none is free, per §4.11 step 1 — the tick loop must
    /// never wedge behind a saturated workflow), then drives the run through
    /// the retry executor and stamps the schedule's bookkeeping. Runs the
    /// attempts on a detached task so the tick loop never blocks on one
    /// schedule's execution.
    async fn execute_scheduled_run(&self, definition: ScheduleDefinition) -> Result<()> {
        let workflow = self
            .workflow_lookup
            .lookup(&definition.workflow_name)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("workflow not found: {}", definition.workflow_name))
            })?;

        let Some(slot) = self.concurrency.try_acquire(&definition.workflow_name) else {
            info!(
                schedule_id = %definition.id,
                workflow_name = %definition.workflow_name,
                "concurrency limit reached, skipping scheduled run"
            );
            return Ok(());
        };

        let service = self.workflow_service.clone();
        let history = self.history.clone();
        let run_manager = self.run_manager.clone();
        let policy = self.retry_policy.clone();
        let repo = self.repo.clone();
        let schedule_id = definition.id.clone();
        let workflow_name = definition.workflow_name.clone();
        let inputs: HashMap<String, Value> = definition.inputs.clone();

        tokio::spawn(async move {
            let _slot = slot;
            let outcome = execute_with_retry(
                &policy,
                |attempt| format!("{schedule_id}-{attempt}"),
                |attempt, retry_of| {
                    let service = service.clone();
                    let history = history.clone();
                    let run_manager = run_manager.clone();
                    let workflow = workflow.clone();
                    let inputs = inputs.clone();
                    let workflow_name = workflow_name.clone();
                    let run_id = format!("{schedule_id}-{attempt}");
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

            match &outcome.result {
                Ok(_) => info!(schedule_id = %schedule_id, "scheduled run completed"),
                Err(err) => error!(schedule_id = %schedule_id, error = %err, "scheduled run exhausted retries"),
            }

            if let Ok(mut def) = repo.get(&schedule_id).await {
                def.last_run_at = Some(Utc::now());
                def.next_run_at = parse_cron(&def.cron_expr)
                    .ok()
                    .and_then(|s| s.upcoming(Utc).next());
                let _ = repo.put(def).await;
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expression_parses() {
        assert!(parse_cron("0 9 * * MON-FRI").is_ok());
    }

    #[test]
    fn six_field_expression_parses() {
        assert!(parse_cron("0 0 9 * * MON-FRI").is_ok());
    }

    #[test]
    fn cron_tz_prefix_is_accepted() {
        assert!(parse_cron("CRON_TZ=America/New_York 0 9 * * *").is_ok());
    }

    #[test]
    fn malformed_expression_is_rejected() {
        assert!(parse_cron("not a cron expression").is_err());
    }
}
