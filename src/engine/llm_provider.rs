//! LLM provider contract (§6).
//!
//! Generalizes a concrete-SDK-per-client pattern into a single abstract
//! `ChatProvider` trait so the specialist loop and router never
//! depend on a specific vendor. A provider is consumed as a stream of
//! [`StreamItem`]s: text deltas, structured tool-call intents, and a final
//! summary item carrying the finish reason and any structured payload.

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::pin::Pin;

use crate::engine::tool_registry::ToolDescriptor;

/// One message in a chat-completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Present on a `Tool` role message: which tool-call this is answering.
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::System,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::User,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A structured tool-call intent from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallIntent {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One item pulled off a chat stream.
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// A text delta to append to the running assistant message.
    Delta(String),
    /// A fully-formed tool-call intent. Providers that batch tool calls
    /// into the final message instead of streaming them incrementally may
    /// emit these just before `Final`.
    ToolCall(ToolCallIntent),
    /// Terminal item for this stream: carries the finish reason and, if a
    /// structured `response_format` was requested, the parsed payload.
    Final {
        finish_reason: String,
        structured_payload: Option<serde_json::Value>,
    },
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamItem, Box<dyn Error + Send + Sync>>> + Send>>;

/// Optional constraint on the final message's shape, used by the
/// specialist loop's structured-output validation (§4.5).
#[derive(Debug, Clone)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: serde_json::Value,
}

/// Parameters for one chat-completion call.
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub tools: Option<&'a [ToolDescriptor]>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub response_format: Option<&'a ResponseFormat>,
}

/// The abstract chat-completion interface every LLM provider implements.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Issue a chat-completion call and receive it as a stream of deltas,
    /// tool-call intents, and a terminal item.
    async fn chat(&self, request: ChatRequest<'_>) -> Result<ChatStream, Box<dyn Error + Send + Sync>>;

    /// Cheap liveness probe used by the orchestrator before starting a
    /// turn that depends on this provider.
    async fn health_check(&self) -> bool {
        true
    }

    /// Human-readable provider name for logs.
    fn name(&self) -> &str;
}

/// Collect a `ChatStream` into its full text and any tool calls, retrying
/// transport failures with bounded exponential backoff (§5 retry policy:
/// up to 3 attempts, 500ms base, jittered).
pub async fn collect_with_retry(
    provider: &dyn ChatProvider,
    request_builder: impl Fn() -> ChatRequest<'_>,
) -> Result<(String, Vec<ToolCallIntent>, Option<serde_json::Value>), Box<dyn Error + Send + Sync>> {
    use futures_util::StreamExt;

    let mut attempt = 0;
    loop {
        attempt += 1;
        let stream_result = provider.chat(request_builder()).await;
        let mut stream = match stream_result {
            Ok(stream) => stream,
            Err(e) if attempt < 3 => {
                backoff(attempt).await;
                log::warn!("chat provider transport error (attempt {}): {}", attempt, e);
                continue;
            }
            Err(e) => return Err(e),
        };

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut structured = None;
        let mut transport_failed = false;

        while let Some(item) = stream.next().await {
            match item {
                Ok(StreamItem::Delta(chunk)) => text.push_str(&chunk),
                Ok(StreamItem::ToolCall(call)) => tool_calls.push(call),
                Ok(StreamItem::Final {
                    structured_payload, ..
                }) => structured = structured_payload,
                Err(e) => {
                    log::warn!("chat stream error (attempt {}): {}", attempt, e);
                    transport_failed = true;
                    break;
                }
            }
        }

        if transport_failed && attempt < 3 {
            backoff(attempt).await;
            continue;
        }

        return Ok((text, tool_calls, structured));
    }
}

async fn backoff(attempt: u32) {
    let base_ms = 500u64 * (1 << (attempt - 1));
    // Deterministic jitter derived from the wall clock's sub-second
    // component rather than pulling in a dedicated RNG crate for one call
    // site.
    let jitter_ms = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_millis())
        .unwrap_or(0)
        % 100) as u64;
    tokio::time::sleep(std::time::Duration::from_millis(base_ms + jitter_ms)).await;
}
