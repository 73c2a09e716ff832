//! Concrete LLM provider clients.
//!
//! Mirrors the teacher's flat `providers.rs` pattern: one `reqwest::Client`
//! per provider struct, a header builder, and a request/response converter
//! function, rather than the teacher's later per-provider directory split —
//! this crate only needs enough providers to exercise the `agent` node's
//! turn loop, not a full router/cost/security stack.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{ChatMessage, FunctionCall, Llm, LlmRequest, LlmResponse, MessageRole};
use crate::{CoreError, Result};

/// Anthropic Claude provider.
pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client builds"),
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            api_key: api_key.into(),
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(v) = HeaderValue::from_str(&self.api_key) {
            headers.insert("x-api-key", v);
        }
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers
    }

    fn convert_request(&self, request: &LlmRequest) -> serde_json::Value {
        let tools: Vec<_> = request
            .functions
            .iter()
            .map(|f| {
                json!({
                    "name": f.name,
                    "description": f.description,
                    "input_schema": f.parameters,
                })
            })
            .collect();

        json!({
            "model": request.model,
            "system": request.system_prompt,
            "messages": request.messages.iter().map(convert_message).collect::<Vec<_>>(),
            "max_tokens": request.max_tokens.unwrap_or(1024),
            "temperature": request.temperature.unwrap_or(0.7),
            "tools": tools,
            "stream": false,
        })
    }
}

fn convert_message(msg: &ChatMessage) -> serde_json::Value {
    json!({
        "role": match msg.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Function => "assistant",
        },
        "content": msg.content,
    })
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
    name: Option<String>,
    input: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[async_trait]
impl Llm for AnthropicProvider {
    async fn generate_content(&self, request: LlmRequest) -> Result<LlmResponse> {
        let body = self.convert_request(&request);
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(CoreError::RetryableTransient(format!(
                "anthropic http {status}: {text}"
            )));
        }

        let parsed: AnthropicResponse = resp.json().await?;
        let mut content = String::new();
        let mut function_calls = Vec::new();
        for block in parsed.content {
            match block.block_type.as_str() {
                "text" => {
                    if let Some(text) = block.text {
                        content.push_str(&text);
                    }
                }
                "tool_use" => {
                    if let Some(name) = block.name {
                        function_calls.push(FunctionCall {
                            name,
                            arguments: block.input.unwrap_or(serde_json::json!({})),
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(LlmResponse {
            content: if content.is_empty() { None } else { Some(content) },
            function_calls,
        })
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }
}

/// OpenAI-compatible provider (also fronts Ollama/vLLM-style servers that
/// mirror the chat-completions schema).
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    provider_name: String,
}

impl OpenAiProvider {
    pub fn new(provider_name: impl Into<String>, api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client builds"),
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key: api_key.into(),
            provider_name: provider_name.into(),
        }
    }

    fn convert_request(&self, request: &LlmRequest) -> serde_json::Value {
        let mut messages: Vec<serde_json::Value> = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(request.messages.iter().map(convert_message));

        let functions: Vec<_> = request
            .functions
            .iter()
            .map(|f| {
                json!({
                    "type": "function",
                    "function": {
                        "name": f.name,
                        "description": f.description,
                        "parameters": f.parameters,
                    }
                })
            })
            .collect();

        json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(1024),
            "temperature": request.temperature.unwrap_or(0.7),
            "tools": functions,
            "stream": false,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[async_trait]
impl Llm for OpenAiProvider {
    async fn generate_content(&self, request: LlmRequest) -> Result<LlmResponse> {
        let body = self.convert_request(&request);
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(CoreError::RetryableTransient(format!(
                "{} http {status}: {text}",
                self.provider_name
            )));
        }

        let parsed: OpenAiResponse = resp.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::FatalNode("empty choices from provider".into()))?;

        let function_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|tc| FunctionCall {
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::json!({})),
            })
            .collect();

        Ok(LlmResponse {
            content: choice.message.content,
            function_calls,
        })
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_converts_request_shape() {
        let provider = AnthropicProvider::new("test-key", None);
        let req = LlmRequest {
            model: "claude-3-5-sonnet".into(),
            system_prompt: Some("be terse".into()),
            messages: vec![ChatMessage {
                role: MessageRole::User,
                content: "hi".into(),
            }],
            functions: vec![],
            temperature: Some(0.5),
            max_tokens: Some(100),
        };
        let body = provider.convert_request(&req);
        assert_eq!(body["model"], "claude-3-5-sonnet");
        assert_eq!(body["max_tokens"], 100);
    }
}
