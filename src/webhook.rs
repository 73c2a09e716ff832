//! Webhook intake: the trigger layer's HTTP-event entry point (§4.14).
//!
//! Verifies `hex(HMAC-SHA256(secret, raw_body))` against the caller-supplied
//! signature using a constant-time comparison, looks up the trigger by id,
//! rejects a disabled trigger or an unknown one, applies its
//! `input_mapping` to the parsed JSON body, and dispatches the run through
//! the retry executor on a detached task — the HTTP handler itself returns
//! as soon as dispatch is accepted (§6's 202 contract), it does not wait for
//! the run to finish.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{error, info};
use uuid::Uuid;

use crate::concurrency::ConcurrencyLimiter;
use crate::history::HistoryStore;
use crate::nodes::WorkflowLookup;
use crate::repositories::{TriggerDefinition, TriggerRepository};
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::run_manager::RunManager;
use crate::state::Value;
use crate::workflow_service::WorkflowService;
use crate::{CoreError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Verifies `signature_hex` against `hex(HMAC-SHA256(secret, body))` in
/// constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_hex = hex_encode(&expected);
    expected_hex.as_bytes().ct_eq(signature_hex.as_bytes()).into()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String never fails");
    }
    out
}

/// Applies a trigger's `input_mapping` (target input-node id -> body field
/// name) to a parsed webhook body, producing the `inputs` map a run starts
/// with. An empty mapping forwards the entire payload (each top-level key
/// of the body object, unchanged) rather than dropping it, per §4.12.
fn apply_input_mapping(body: &Value, mapping: &HashMap<String, String>) -> HashMap<String, Value> {
    if mapping.is_empty() {
        return body
            .as_object()
            .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
    }

    let mut inputs = HashMap::with_capacity(mapping.len());
    for (node_id, field) in mapping {
        let value = body.get(field).cloned().unwrap_or(Value::Null);
        inputs.insert(node_id.clone(), value);
    }
    inputs
}

pub struct WebhookIntake {
    triggers: Arc<dyn TriggerRepository>,
    workflow_lookup: Arc<dyn WorkflowLookup>,
    workflow_service: Arc<WorkflowService>,
    concurrency: Arc<ConcurrencyLimiter>,
    history: Arc<dyn HistoryStore>,
    run_manager: Arc<RunManager>,
    retry_policy: RetryPolicy,
}

impl WebhookIntake {
    pub fn new(
        triggers: Arc<dyn TriggerRepository>,
        workflow_lookup: Arc<dyn WorkflowLookup>,
        workflow_service: Arc<WorkflowService>,
        concurrency: Arc<ConcurrencyLimiter>,
        history: Arc<dyn HistoryStore>,
        run_manager: Arc<RunManager>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            triggers,
            workflow_lookup,
            workflow_service,
            concurrency,
            history,
            run_manager,
            retry_policy,
        }
    }

    /// Handles one inbound webhook call. Returns the accepted run id on
    /// success (the caller maps this to a 202); errors map onto
    /// `not_found`/`unauthorized`/`forbidden` per [`CoreError::kind`].
    pub async fn handle(&self, trigger_id: &str, raw_body: &[u8], signature_hex: &str) -> Result<String> {
        let trigger = self.lookup_enabled_trigger(trigger_id).await?;

        // A trigger with no configured secret skips verification entirely;
        // one with a secret rejects on any mismatch or absent signature.
        if !trigger.secret.is_empty() && !verify_signature(&trigger.secret, raw_body, signature_hex) {
            return Err(CoreError::Unauthorized("webhook signature mismatch".into()));
        }

        let body: Value = serde_json::from_slice(raw_body).unwrap_or(Value::Null);
        let inputs = apply_input_mapping(&body, &trigger.input_mapping);

        let workflow = self
            .workflow_lookup
            .lookup(&trigger.workflow_name)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("workflow not found: {}", trigger.workflow_name))
            })?;

        let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        let slot = self.concurrency.acquire(&trigger.workflow_name, cancel_rx).await?;

        let service = self.workflow_service.clone();
        let history = self.history.clone();
        let run_manager = self.run_manager.clone();
        let policy = self.retry_policy.clone();
        let workflow_name = trigger.workflow_name.clone();
        let dispatch_id = Uuid::new_v4().to_string();
        let accepted_run_id = format!("{dispatch_id}-0");

        tokio::spawn(async move {
            let _slot = slot;
            let outcome = execute_with_retry(
                &policy,
                |attempt| format!("{dispatch_id}-{attempt}"),
                |attempt, retry_of| {
                    let service = service.clone();
                    let history = history.clone();
                    let run_manager = run_manager.clone();
                    let workflow = workflow.clone();
                    let inputs = inputs.clone();
                    let workflow_name = workflow_name.clone();
                    let run_id = format!("{dispatch_id}-{attempt}");
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
                Ok(_) => info!(dispatch_id = %dispatch_id, "webhook-triggered run completed"),
                Err(err) => error!(dispatch_id = %dispatch_id, error = %err, "webhook-triggered run exhausted retries"),
            }
        });

        Ok(accepted_run_id)
    }

    async fn lookup_enabled_trigger(&self, trigger_id: &str) -> Result<TriggerDefinition> {
        let trigger = self.triggers.get(trigger_id).await?;
        if !trigger.enabled {
            return Err(CoreError::Forbidden(format!("trigger disabled: {trigger_id}")));
        }
        Ok(trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_round_trips() {
        let secret = "shh";
        let body = br#"{"a":1}"#;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let signature = hex_encode(&mac.finalize().into_bytes());
        assert!(verify_signature(secret, body, &signature));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let secret = "shh";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(b"original");
        let signature = hex_encode(&mac.finalize().into_bytes());
        assert!(!verify_signature(secret, b"tampered", &signature));
    }

    #[test]
    fn input_mapping_pulls_named_fields() {
        let body = json!({"name": "ada", "count": 3});
        let mut mapping = HashMap::new();
        mapping.insert("in1".to_string(), "name".to_string());
        mapping.insert("in2".to_string(), "missing_field".to_string());
        let inputs = apply_input_mapping(&body, &mapping);
        assert_eq!(inputs.get("in1"), Some(&json!("ada")));
        assert_eq!(inputs.get("in2"), Some(&Value::Null));
    }

    #[test]
    fn empty_mapping_forwards_whole_payload() {
        let body = json!({"name": "ada", "count": 3});
        let inputs = apply_input_mapping(&body, &HashMap::new());
        assert_eq!(inputs.get("name"), Some(&json!("ada")));
        assert_eq!(inputs.get("count"), Some(&json!(3)));
    }
}
