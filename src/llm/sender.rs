//! Sender registry: resolves a connection's `type_name` to a concrete
//! notification sender, consumed by the `notification` and `approval` node
//! builders. Secret material and real provider adapters (Slack, email,
//! SMS, ...) are an external collaborator per the specification; this
//! module defines the trait shape plus a log-based default used by tests
//! and development wiring.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::connection::Connection;
use crate::{CoreError, Result};

#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, connection: &Connection, message: &str) -> Result<()>;
}

/// Writes the message to the application log instead of dispatching it
/// anywhere. Registered under `"log"` by default so workflows exercise the
/// `notification`/`approval` path without a real channel configured.
pub struct LogSender;

#[async_trait]
impl Sender for LogSender {
    async fn send(&self, connection: &Connection, message: &str) -> Result<()> {
        info!(connection = %connection.id, "{}", message);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct SenderRegistry {
    senders: HashMap<String, Arc<dyn Sender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `"log"` sender pre-registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("log", Arc::new(LogSender));
        registry
    }

    pub fn register(&mut self, type_name: impl Into<String>, sender: Arc<dyn Sender>) {
        self.senders.insert(type_name.into(), sender);
    }

    pub fn get(&self, type_name: &str) -> Result<Arc<dyn Sender>> {
        self.senders
            .get(type_name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("no sender registered for type: {type_name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_sender_resolves_by_default() {
        let registry = SenderRegistry::with_defaults();
        let sender = registry.get("log").unwrap();
        let conn = Connection {
            id: "c1".into(),
            type_name: "log".into(),
            config: serde_json::json!({}),
        };
        sender.send(&conn, "hello").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_sender_type_is_not_found() {
        let registry = SenderRegistry::new();
        assert!(registry.get("slack").is_err());
    }
}
