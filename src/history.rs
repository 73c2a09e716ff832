//! Run history: a durable-shaped record of every run, independent of the
//! live event buffer in [`crate::run_manager`] (§4.11). Where `run_manager`
//! exists to serve SSE reconnect for runs that are still live or recently
//! finished, history is the long-lived audit trail: one [`RunRecord`] per
//! run, retained indefinitely, queryable by workflow and status.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeRunRecord {
    pub node_id: String,
    pub status: RunStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// The run id this one retried, if it's a retry attempt.
    pub retry_of: Option<String>,
    pub attempt: u32,
    pub node_runs: HashMap<String, NodeRunRecord>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilter {
    pub status: Option<RunStatus>,
    pub offset: usize,
    pub limit: usize,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn start_run(
        &self,
        run_id: &str,
        workflow_name: &str,
        retry_of: Option<String>,
        attempt: u32,
    ) -> Result<()>;
    async fn complete_run(&self, run_id: &str) -> Result<()>;
    async fn fail_run(&self, run_id: &str, error: String) -> Result<()>;
    async fn update_node_run(&self, run_id: &str, node: NodeRunRecord) -> Result<()>;
    async fn update_run_retry_meta(
        &self,
        run_id: &str,
        retry_of: Option<String>,
        attempt: u32,
    ) -> Result<()>;
    async fn get(&self, run_id: &str) -> Result<RunRecord>;
    async fn list_all(&self, filter: ListFilter) -> Result<Vec<RunRecord>>;
    async fn list_by_workflow(&self, workflow_name: &str, filter: ListFilter) -> Result<Vec<RunRecord>>;
}

/// In-memory history store. A real deployment backs this with a database;
/// the specification treats durable storage as an external collaborator
/// (§6), so this implementation exists to make the crate runnable and
/// testable standalone.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    records: RwLock<HashMap<String, RunRecord>>,
    /// Declaration order, oldest first, so listings can paginate stably.
    order: RwLock<Vec<String>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn start_run(
        &self,
        run_id: &str,
        workflow_name: &str,
        retry_of: Option<String>,
        attempt: u32,
    ) -> Result<()> {
        let record = RunRecord {
            run_id: run_id.to_string(),
            workflow_name: workflow_name.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            retry_of,
            attempt,
            node_runs: HashMap::new(),
        };
        self.records.write().await.insert(run_id.to_string(), record);
        self.order.write().await.push(run_id.to_string());
        Ok(())
    }

    async fn complete_run(&self, run_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(run_id)
            .ok_or_else(|| CoreError::NotFound(format!("run not found: {run_id}")))?;
        record.status = RunStatus::Completed;
        record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail_run(&self, run_id: &str, error: String) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(run_id)
            .ok_or_else(|| CoreError::NotFound(format!("run not found: {run_id}")))?;
        record.status = RunStatus::Failed;
        record.completed_at = Some(Utc::now());
        record.error = Some(error);
        Ok(())
    }

    async fn update_node_run(&self, run_id: &str, node: NodeRunRecord) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(run_id)
            .ok_or_else(|| CoreError::NotFound(format!("run not found: {run_id}")))?;
        record.node_runs.insert(node.node_id.clone(), node);
        Ok(())
    }

    async fn update_run_retry_meta(
        &self,
        run_id: &str,
        retry_of: Option<String>,
        attempt: u32,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(run_id)
            .ok_or_else(|| CoreError::NotFound(format!("run not found: {run_id}")))?;
        record.retry_of = retry_of;
        record.attempt = attempt;
        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<RunRecord> {
        self.records
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("run not found: {run_id}")))
    }

    async fn list_all(&self, filter: ListFilter) -> Result<Vec<RunRecord>> {
        let order = self.order.read().await;
        let records = self.records.read().await;
        Ok(paginate(&order, &records, |_| true, filter))
    }

    async fn list_by_workflow(&self, workflow_name: &str, filter: ListFilter) -> Result<Vec<RunRecord>> {
        let order = self.order.read().await;
        let records = self.records.read().await;
        Ok(paginate(&order, &records, |r| r.workflow_name == workflow_name, filter))
    }
}

fn paginate(
    order: &[String],
    records: &HashMap<String, RunRecord>,
    predicate: impl Fn(&RunRecord) -> bool,
    filter: ListFilter,
) -> Vec<RunRecord> {
    let limit = if filter.limit == 0 { usize::MAX } else { filter.limit };
    order
        .iter()
        .rev()
        .filter_map(|id| records.get(id))
        .filter(|r| predicate(r))
        .filter(|r| filter.status.map(|s| s == r.status).unwrap_or(true))
        .skip(filter.offset)
        .take(limit)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_then_complete_updates_status() {
        let store = InMemoryHistoryStore::new();
        store.start_run("r1", "greet", None, 0).await.unwrap();
        store.complete_run("r1").await.unwrap();
        let record = store.get("r1").await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn list_by_workflow_filters_and_orders_newest_first() {
        let store = InMemoryHistoryStore::new();
        store.start_run("r1", "greet", None, 0).await.unwrap();
        store.start_run("r2", "other", None, 0).await.unwrap();
        store.start_run("r3", "greet", None, 0).await.unwrap();
        let results = store
            .list_by_workflow("greet", ListFilter::default())
            .await
            .unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["r3", "r1"]);
    }

    #[tokio::test]
    async fn retry_meta_links_attempts() {
        let store = InMemoryHistoryStore::new();
        store.start_run("r1", "greet", None, 0).await.unwrap();
        store.fail_run("r1", "timeout".into()).await.unwrap();
        store.start_run("r2", "greet", Some("r1".into()), 1).await.unwrap();
        let record = store.get("r2").await.unwrap();
        assert_eq!(record.retry_of.as_deref(), Some("r1"));
        assert_eq!(record.attempt, 1);
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let store = InMemoryHistoryStore::new();
        assert!(store.get("missing").await.is_err());
    }
}
