//! Persistence-facing traits for workflow definitions, schedules, and
//! webhook triggers, plus in-memory implementations (§4.12). Real storage is
//! an external collaborator per the specification; these in-memory
//! implementations make the crate runnable and testable standalone, and
//! [`WorkflowRepository`] doubles as the concrete [`crate::nodes::WorkflowLookup`]
//! the `subworkflow` node builder depends on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::dag::WorkflowDefinition;
use crate::llm::connection::{Connection, ConnectionResolver};
use crate::nodes::WorkflowLookup;
use crate::{CoreError, Result};

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn get(&self, name: &str) -> Result<WorkflowDefinition>;
    async fn put(&self, workflow: WorkflowDefinition) -> Result<()>;
    async fn delete(&self, name: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<WorkflowDefinition>>;
}

#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn get(&self, name: &str) -> Result<WorkflowDefinition> {
        self.workflows
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("workflow not found: {name}")))
    }

    async fn put(&self, workflow: WorkflowDefinition) -> Result<()> {
        // Validate the graph shape before it's stored so a bad definition
        // never reaches a trigger.
        crate::dag::Dag::build(&workflow)?;
        self.workflows.write().await.insert(workflow.name.clone(), workflow);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.workflows
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("workflow not found: {name}")))
    }

    async fn list(&self) -> Result<Vec<WorkflowDefinition>> {
        Ok(self.workflows.read().await.values().cloned().collect())
    }
}

#[async_trait]
impl WorkflowLookup for InMemoryWorkflowRepository {
    async fn lookup(&self, name: &str) -> Result<Option<WorkflowDefinition>> {
        match self.get(name).await {
            Ok(def) => Ok(Some(def)),
            Err(CoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScheduleDefinition {
    pub id: String,
    pub workflow_name: String,
    pub cron_expr: String,
    pub inputs: HashMap<String, crate::state::Value>,
    pub enabled: bool,
    pub last_run_at: Option<chrono::DateTime<chrono::Utc>>,
    pub next_run_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<ScheduleDefinition>;
    async fn put(&self, schedule: ScheduleDefinition) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<ScheduleDefinition>>;
    async fn list_enabled(&self) -> Result<Vec<ScheduleDefinition>>;
}

#[derive(Default)]
pub struct InMemoryScheduleRepository {
    schedules: RwLock<HashMap<String, ScheduleDefinition>>,
}

impl InMemoryScheduleRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn get(&self, id: &str) -> Result<ScheduleDefinition> {
        self.schedules
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("schedule not found: {id}")))
    }

    async fn put(&self, schedule: ScheduleDefinition) -> Result<()> {
        self.schedules.write().await.insert(schedule.id.clone(), schedule);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.schedules
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("schedule not found: {id}")))
    }

    async fn list(&self) -> Result<Vec<ScheduleDefinition>> {
        Ok(self.schedules.read().await.values().cloned().collect())
    }

    async fn list_enabled(&self) -> Result<Vec<ScheduleDefinition>> {
        Ok(self
            .schedules
            .read()
            .await
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TriggerDefinition {
    pub id: String,
    pub workflow_name: String,
    pub secret: String,
    pub enabled: bool,
    /// Maps a field on the inbound webhook body to a target input-node id.
    pub input_mapping: HashMap<String, String>,
}

#[async_trait]
pub trait TriggerRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<TriggerDefinition>;
    async fn put(&self, trigger: TriggerDefinition) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<TriggerDefinition>>;
}

#[derive(Default)]
pub struct InMemoryTriggerRepository {
    triggers: RwLock<HashMap<String, TriggerDefinition>>,
}

impl InMemoryTriggerRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TriggerRepository for InMemoryTriggerRepository {
    async fn get(&self, id: &str) -> Result<TriggerDefinition> {
        self.triggers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("trigger not found: {id}")))
    }

    async fn put(&self, trigger: TriggerDefinition) -> Result<()> {
        self.triggers.write().await.insert(trigger.id.clone(), trigger);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.triggers
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("trigger not found: {id}")))
    }

    async fn list(&self) -> Result<Vec<TriggerDefinition>> {
        Ok(self.triggers.read().await.values().cloned().collect())
    }
}

#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Connection>;
    async fn put(&self, connection: Connection) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<Connection>>;
}

/// Backs both `/api/connections` CRUD and the `ConnectionResolver` that
/// `notification`/`approval` nodes read from — one store, two interfaces,
/// so a connection created through the API is immediately resolvable by a
/// run.
#[derive(Default)]
pub struct InMemoryConnectionRepository {
    connections: RwLock<HashMap<String, Connection>>,
}

impl InMemoryConnectionRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ConnectionRepository for InMemoryConnectionRepository {
    async fn get(&self, id: &str) -> Result<Connection> {
        self.connections
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("connection not found: {id}")))
    }

    async fn put(&self, connection: Connection) -> Result<()> {
        self.connections.write().await.insert(connection.id.clone(), connection);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.connections
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("connection not found: {id}")))
    }

    async fn list(&self) -> Result<Vec<Connection>> {
        Ok(self.connections.read().await.values().cloned().collect())
    }
}

#[async_trait]
impl ConnectionResolver for InMemoryConnectionRepository {
    async fn resolve(&self, id: &str) -> Result<Connection> {
        self.get(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{NodeDefinition, WorkflowDefinition};

    fn simple_workflow(name: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.to_string(),
            version: "1".into(),
            nodes: vec![NodeDefinition {
                id: "in1".into(),
                node_type: "input".into(),
                config: serde_json::json!({}),
            }],
            edges: vec![],
        }
    }

    #[tokio::test]
    async fn put_rejects_an_invalid_graph() {
        let repo = InMemoryWorkflowRepository::new();
        let mut workflow = simple_workflow("bad");
        workflow.edges.push(crate::dag::EdgeDefinition {
            from: "in1".into(),
            to: "missing".into(),
            trigger_rule: crate::dag::TriggerRule::OnSuccess,
            condition: String::new(),
        });
        assert!(repo.put(workflow).await.is_err());
    }

    #[tokio::test]
    async fn workflow_lookup_returns_none_not_error_for_missing() {
        let repo = InMemoryWorkflowRepository::new();
        let found: Option<WorkflowDefinition> = repo.lookup("missing").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn stored_workflow_round_trips() {
        let repo = InMemoryWorkflowRepository::new();
        repo.put(simple_workflow("greet")).await.unwrap();
        let found = repo.lookup("greet").await.unwrap();
        assert!(found.is_some());
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn schedule_repository_filters_enabled() {
        let repo = InMemoryScheduleRepository::new();
        repo.put(ScheduleDefinition {
            id: "s1".into(),
            workflow_name: "greet".into(),
            cron_expr: "0 * * * *".into(),
            inputs: HashMap::new(),
            enabled: true,
            last_run_at: None,
            next_run_at: None,
        })
        .await
        .unwrap();
        repo.put(ScheduleDefinition {
            id: "s2".into(),
            workflow_name: "greet".into(),
            cron_expr: "0 * * * *".into(),
            inputs: HashMap::new(),
            enabled: false,
            last_run_at: None,
            next_run_at: None,
        })
        .await
        .unwrap();
        let enabled = repo.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "s1");
    }

    #[tokio::test]
    async fn connection_repository_resolves_what_it_stores() {
        let repo = InMemoryConnectionRepository::new();
        repo.put(Connection {
            id: "slack1".into(),
            type_name: "slack".into(),
            config: serde_json::json!({"webhook_url": "https://example.test"}),
        })
        .await
        .unwrap();
        let resolved = ConnectionResolver::resolve(&*repo, "slack1").await.unwrap();
        assert_eq!(resolved.type_name, "slack");
        assert!(repo.get("missing").await.is_err());
    }
}
