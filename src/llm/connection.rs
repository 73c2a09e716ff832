//! Connection resolver: resolves a named connection (notification channel,
//! external system credential reference) consumed by `notification` and
//! `approval` nodes. Secret material and real adapters are an external
//! collaborator per the specification; this module only defines the trait
//! shape and a static in-memory resolver for tests and default wiring.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{CoreError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub type_name: String,
    pub config: serde_json::Value,
}

#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn resolve(&self, id: &str) -> Result<Connection>;
}

#[derive(Default)]
pub struct StaticConnectionResolver {
    connections: DashMap<String, Connection>,
}

impl StaticConnectionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Connection) {
        self.connections.insert(connection.id.clone(), connection);
    }
}

#[async_trait]
impl ConnectionResolver for StaticConnectionResolver {
    async fn resolve(&self, id: &str) -> Result<Connection> {
        self.connections
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::NotFound(format!("connection not found: {id}")))
    }
}

pub fn shared_static_resolver() -> Arc<StaticConnectionResolver> {
    Arc::new(StaticConnectionResolver::new())
}
