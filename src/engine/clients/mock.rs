//! An in-memory [`ChatProvider`] used by tests so the specialist loop and
//! orchestrator can be exercised without a network call.

use async_trait::async_trait;
use futures_util::stream;
use std::error::Error;
use std::sync::Mutex;

use crate::engine::llm_provider::{ChatProvider, ChatRequest, ChatStream, StreamItem, ToolCallIntent};

enum Script {
    Text(String),
    ToolCall(String, serde_json::Value),
    /// Returns each scripted response in order, one per call — used to
    /// simulate a tool failing once then succeeding (S4).
    Sequence(Mutex<Vec<Script>>),
}

/// A scripted provider: construct it to always return a fixed text answer
/// or a fixed tool call, or to play back a sequence of responses across
/// successive calls.
pub struct MockChatProvider {
    script: Script,
}

impl MockChatProvider {
    pub fn with_text(text: impl Into<String>) -> Self {
        MockChatProvider {
            script: Script::Text(text.into()),
        }
    }

    pub fn with_tool_call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        MockChatProvider {
            script: Script::ToolCall(name.into(), arguments),
        }
    }

    pub fn with_sequence(responses: Vec<MockChatProvider>) -> Self {
        let scripts = responses.into_iter().map(|p| p.script).collect();
        MockChatProvider {
            script: Script::Sequence(Mutex::new(scripts)),
        }
    }

    fn next_items(&self) -> Vec<Result<StreamItem, Box<dyn Error + Send + Sync>>> {
        match &self.script {
            Script::Text(text) => vec![
                Ok(StreamItem::Delta(text.clone())),
                Ok(StreamItem::Final {
                    finish_reason: "stop".to_string(),
                    structured_payload: None,
                }),
            ],
            Script::ToolCall(name, arguments) => vec![
                Ok(StreamItem::ToolCall(ToolCallIntent {
                    id: format!("call_{}", name),
                    name: name.clone(),
                    arguments: arguments.clone(),
                })),
                Ok(StreamItem::Final {
                    finish_reason: "tool_calls".to_string(),
                    structured_payload: None,
                }),
            ],
            Script::Sequence(scripts) => {
                let mut scripts = scripts.lock().unwrap();
                if scripts.is_empty() {
                    return vec![Ok(StreamItem::Final {
                        finish_reason: "stop".to_string(),
                        structured_payload: None,
                    })];
                }
                let next = scripts.remove(0);
                match next {
                    Script::Text(text) => vec![
                        Ok(StreamItem::Delta(text)),
                        Ok(StreamItem::Final {
                            finish_reason: "stop".to_string(),
                            structured_payload: None,
                        }),
                    ],
                    Script::ToolCall(name, arguments) => vec![
                        Ok(StreamItem::ToolCall(ToolCallIntent {
                            id: format!("call_{}", name),
                            name,
                            arguments,
                        })),
                        Ok(StreamItem::Final {
                            finish_reason: "tool_calls".to_string(),
                            structured_payload: None,
                        }),
                    ],
                    Script::Sequence(_) => vec![Ok(StreamItem::Final {
                        finish_reason: "stop".to_string(),
                        structured_payload: None,
                    })],
                }
            }
        }
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    async fn chat(&self, _request: ChatRequest<'_>) -> Result<ChatStream, Box<dyn Error + Send + Sync>> {
        let items = self.next_items();
        Ok(Box::pin(stream::iter(items)))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
