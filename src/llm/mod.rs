//! LLM collaborator interface and supporting registries.
//!
//! The specification treats the LLM provider, the tool registry, the
//! connection resolver, the sender registry, and asset storage as external
//! collaborators (§6) consumed by node builders. This module defines their
//! minimal trait shapes — grounded in the teacher's provider-client pattern
//! (`LLMProviderClient`) — plus small in-memory implementations so the
//! crate is runnable and testable without a real backend wired in.

pub mod connection;
pub mod provider;
pub mod sender;
pub mod storage;
pub mod tool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

/// A native function/tool declaration offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A function call the model asked the caller to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub functions: Vec<FunctionDeclaration>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A single response turn from the model: either text content, or one or
/// more function calls the caller must execute and feed back.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmResponse {
    pub content: Option<String>,
    pub function_calls: Vec<FunctionCall>,
}

impl LlmResponse {
    pub fn has_function_calls(&self) -> bool {
        !self.function_calls.is_empty()
    }
}

/// The `LLM` collaborator interface consumed by the `agent`/`branch` node
/// builders: `GenerateContent(ctx, req, stream) -> stream of (response,
/// err)`. Modeled here as a single async call returning the final response;
/// providers that support incremental streaming may still emit partial
/// `log` events through the node's own event stream, but the contract the
/// rest of the core relies on is the final `LlmResponse`.
#[async_trait]
pub trait Llm: Send + Sync {
    async fn generate_content(&self, request: LlmRequest) -> Result<LlmResponse>;

    /// Which `provider/model` strings this client can serve, e.g.
    /// `"anthropic/claude-3-5-sonnet"`. Used by workflow validation (§4.7).
    fn provider_name(&self) -> &str;
}

/// Registry of configured LLM clients keyed by provider name, used to
/// resolve the `provider/model` string on an `agent` node's config.
#[derive(Default, Clone)]
pub struct LlmRegistry {
    providers: std::collections::HashMap<String, std::sync::Arc<dyn Llm>>,
}

impl LlmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: std::sync::Arc<dyn Llm>) {
        self.providers
            .insert(client.provider_name().to_string(), client);
    }

    pub fn get(&self, provider: &str) -> Option<std::sync::Arc<dyn Llm>> {
        self.providers.get(provider).cloned()
    }

    pub fn is_configured(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }
}

/// Splits an `agent` node's `provider/model` config string into its parts.
pub fn split_provider_model(value: &str) -> Option<(&str, &str)> {
    value.split_once('/')
}
