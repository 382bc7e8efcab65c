//! OpenAI Chat Completions provider.
//!
//! Talks to `/v1/chat/completions` directly over `reqwest` rather than
//! through a vendor SDK, so the only third-party surface this module
//! depends on is the crate's own shared HTTP stack.

use async_trait::async_trait;
use futures_util::stream;
use std::error::Error;
use std::sync::Arc;

use crate::engine::llm_provider::{
    ChatMessage, ChatProvider, ChatRequest, ChatRole, ChatStream, StreamItem, ToolCallIntent,
};

/// Client for OpenAI's Chat Completions API, or any OpenAI-compatible
/// endpoint when constructed with a custom base URL.
pub struct OpenAIProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAIProvider {
    /// Construct a client against the official OpenAI endpoint.
    pub fn new(api_key: impl Into<String>) -> Self {
        OpenAIProvider {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    /// Construct a client against a custom OpenAI-compatible base URL
    /// (self-hosted gateways, proxies). `base_url` should not have a
    /// trailing slash.
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        OpenAIProvider {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn role_str(role: ChatRole) -> &'static str {
        match role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAIProvider {
    async fn chat(&self, request: ChatRequest<'_>) -> Result<ChatStream, Box<dyn Error + Send + Sync>> {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                let mut obj = serde_json::json!({
                    "role": Self::role_str(m.role),
                    "content": m.content,
                });
                if let Some(id) = &m.tool_call_id {
                    obj["tool_call_id"] = serde_json::json!(id);
                }
                obj
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(temp) = request.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(tools) = request.tools {
            let functions: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| serde_json::json!({ "type": "function", "function": t.to_schema() }))
                .collect();
            body["tools"] = serde_json::json!(functions);
        }
        if let Some(format) = request.response_format {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": { "name": format.name, "schema": format.schema },
            });
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                log::error!("OpenAIProvider::chat: transport error: {}", e);
                Box::new(e) as Box<dyn Error + Send + Sync>
            })?;

        let status = response.status();
        let payload: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let message = payload
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown OpenAI API error");
            log::error!("OpenAIProvider::chat: API error: {}", message);
            return Err(message.to_string().into());
        }

        let choice = payload
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or("OpenAI response had no choices")?;
        let message = &choice["message"];
        let finish_reason = choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .unwrap_or("stop")
            .to_string();

        let mut items = Vec::new();
        if let Some(tool_calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
            for call in tool_calls {
                let id = call
                    .get("id")
                    .and_then(|i| i.as_str())
                    .unwrap_or_default()
                    .to_string();
                let name = call["function"]["name"].as_str().unwrap_or_default().to_string();
                let arguments_raw = call["function"]["arguments"].as_str().unwrap_or("{}");
                let arguments: serde_json::Value =
                    serde_json::from_str(arguments_raw).unwrap_or(serde_json::Value::Null);
                items.push(Ok(StreamItem::ToolCall(ToolCallIntent { id, name, arguments })));
            }
        } else if let Some(content) = message.get("content").and_then(|c| c.as_str()) {
            if !content.is_empty() {
                items.push(Ok(StreamItem::Delta(content.to_string())));
            }
        }

        let structured_payload = if finish_reason == "stop" {
            message
                .get("content")
                .and_then(|c| c.as_str())
                .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
        } else {
            None
        };

        items.push(Ok(StreamItem::Final {
            finish_reason,
            structured_payload,
        }));

        Ok(Box::pin(stream::iter(items)))
    }

    async fn health_check(&self) -> bool {
        self.http
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Construct a shared, `Arc`-wrapped provider — the shape callers most
/// commonly want when handing the provider to multiple specialists.
pub fn shared(api_key: impl Into<String>) -> Arc<dyn ChatProvider> {
    Arc::new(OpenAIProvider::new(api_key))
}
