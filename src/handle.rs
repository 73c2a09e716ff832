//! Execution handle: a per-run rendezvous object keyed by node id, used by
//! human-in-the-loop nodes (`approval`, webhook `sensor`) to suspend until
//! an external caller (an HTTP resume endpoint) supplies a payload.
//!
//! One-shot per node id: a second concurrent waiter on the same id within
//! one run is not supported, matching the specification.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::state::Value;
use crate::{CoreError, Result};

/// The payload an external resume call supplies.
pub type ResumePayload = HashMap<String, Value>;

/// Per-run suspend/resume registry. Cheap to clone (backed by an `Arc`).
#[derive(Clone, Default)]
pub struct ExecutionHandle {
    waiters: Arc<DashMap<String, oneshot::Sender<ResumePayload>>>,
}

impl ExecutionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until [`ExecutionHandle::resume`] is called for `node_id`, or
    /// the handle is dropped (run cancelled/completed), in which case this
    /// returns `CoreError::Cancelled`.
    pub async fn wait_for_resume(&self, node_id: &str) -> Result<ResumePayload> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(node_id.to_string(), tx);
        rx.await.map_err(|_| CoreError::Cancelled)
    }

    /// Delivers a resume payload to the waiter registered for `node_id`.
    /// Returns `not_found` if no node is currently waiting under that id.
    pub fn resume(&self, node_id: &str, payload: ResumePayload) -> Result<()> {
        match self.waiters.remove(node_id) {
            Some((_, tx)) => tx
                .send(payload)
                .map_err(|_| CoreError::NotFound(format!("waiter for {node_id} already gone"))),
            None => Err(CoreError::NotFound(format!(
                "no node waiting for resume: {node_id}"
            ))),
        }
    }

    /// Unregisters a waiter without delivering a payload — used when a
    /// `waiting` node's run is cancelled. The waiter's `wait_for_resume`
    /// future resolves to `Cancelled` because dropping the sender closes
    /// the oneshot channel.
    pub fn cancel(&self, node_id: &str) {
        self.waiters.remove(node_id);
    }

    pub fn is_waiting(&self, node_id: &str) -> bool {
        self.waiters.contains_key(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resume_delivers_payload() {
        let handle = ExecutionHandle::new();
        let h2 = handle.clone();
        let waiter = tokio::spawn(async move { h2.wait_for_resume("n1").await });
        // Give the waiter a chance to register.
        tokio::task::yield_now().await;
        let mut payload = ResumePayload::new();
        payload.insert("action".into(), json!("approve"));
        handle.resume("n1", payload.clone()).unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.get("action"), payload.get("action"));
    }

    #[test]
    fn resume_without_waiter_is_not_found() {
        let handle = ExecutionHandle::new();
        assert!(handle.resume("missing", ResumePayload::new()).is_err());
    }

    #[tokio::test]
    async fn cancel_resolves_waiter_as_cancelled() {
        let handle = ExecutionHandle::new();
        let h2 = handle.clone();
        let waiter = tokio::spawn(async move { h2.wait_for_resume("n1").await });
        tokio::task::yield_now().await;
        handle.cancel("n1");
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }
}
