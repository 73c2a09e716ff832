//! Request/response DTOs for the HTTP API surface (§6). Kept separate from
//! the domain types in [`crate::dag`], [`crate::repositories`], and
//! [`crate::history`] so wire-format concerns (optional ids, a `timezone`
//! convenience field folded into `cron_expr`) don't leak into the
//! scheduler/executor/service layers those types are shared with.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dag::WorkflowDefinition;
use crate::history::RunStatus;
use crate::state::Value;

/// Body of `POST /api/workflows/{name}/run`. An inline `workflow` lets a
/// caller exercise a definition it hasn't stored yet; omitting it looks the
/// named workflow up in the repository.
#[derive(Debug, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    pub workflow: Option<WorkflowDefinition>,
}

#[derive(Debug, Serialize)]
pub struct RunAccepted {
    pub run_id: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub id: Option<String>,
    pub workflow_name: String,
    pub cron_expr: String,
    /// IANA zone name; folded into `cron_expr` as a `CRON_TZ=<zone>` prefix
    /// if `cron_expr` doesn't already carry one (§6 "Timezone field on
    /// schedule").
    pub timezone: Option<String>,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ScheduleRequest {
    pub fn cron_with_timezone(&self) -> String {
        if self.cron_expr.trim_start().starts_with("CRON_TZ=") {
            return self.cron_expr.clone();
        }
        match &self.timezone {
            Some(tz) if !tz.is_empty() && !tz.eq_ignore_ascii_case("utc") => {
                format!("CRON_TZ={tz} {}", self.cron_expr)
            }
            _ => self.cron_expr.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub id: Option<String>,
    pub workflow_name: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionRequest {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub workflow: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: usize,
}

impl ListQuery {
    pub fn status(&self) -> Option<RunStatus> {
        match self.status.as_deref() {
            Some("running") => Some(RunStatus::Running),
            Some("completed") | Some("success") => Some(RunStatus::Completed),
            Some("failed") => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn filter(&self) -> crate::history::ListFilter {
        crate::history::ListFilter {
            status: self.status(),
            offset: self.offset,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SchedulerStats {
    pub concurrency: ConcurrencyStats,
}

#[derive(Debug, Serialize)]
pub struct ConcurrencyStats {
    pub active_runs: usize,
    pub global_max: usize,
    pub per_workflow: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

impl StatusResponse {
    pub fn new(status: &'static str) -> Self {
        Self { status }
    }
}
