//! Specialist Agent Loop (C5).
//!
//! Each [`Specialist`] is a named agent configuration — system prompt plus
//! a curated tool subset plus an LLM descriptor — that runs a ReAct-style
//! loop: assemble a prompt, call the LLM, execute any requested tools,
//! append the observations, repeat until the LLM answers without calling a
//! tool, the iteration cap is hit, or the turn is cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::error::EngineError;
use crate::engine::event_bus::{EngineEvent, EventBus};
use crate::engine::execution_tree::{ExecutionTree, NodeKind};
use crate::engine::llm_provider::{
    collect_with_retry, ChatMessage, ChatProvider, ChatRequest, ResponseFormat,
};
use crate::engine::tool_registry::{ToolContext, ToolRegistry};

/// Configuration for one named specialist.
pub struct Specialist {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    /// Capability tags used to scope which tools `list_for` returns.
    pub capabilities: Vec<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub response_format: Option<ResponseFormat>,
}

impl Specialist {
    pub fn new(name: impl Into<String>, description: impl Into<String>, model: impl Into<String>) -> Self {
        Specialist {
            name: name.into(),
            description: description.into(),
            system_prompt: String::new(),
            capabilities: Vec::new(),
            model: model.into(),
            temperature: 0.2,
            max_tokens: 2048,
            response_format: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }
}

/// Terminal outcome of one specialist loop.
#[derive(Debug, Clone)]
pub enum StepResult {
    /// The LLM answered without requesting a tool call.
    Final {
        text: String,
        structured: Option<serde_json::Value>,
    },
    /// The specialist handed off to a named peer with a short summary.
    Handoff { specialist: String, message: String },
    /// The loop could not make progress.
    Error(EngineError),
}

/// Shared, per-turn state every specialist loop needs: the tool registry,
/// the execution tree, the event bus, and the tool-call dedup cache +
/// budget counter that the orchestrator enforces across the whole turn
/// (§4.6: tool-call deduplication, §5: tool_call_budget_per_turn).
pub struct TurnContext<'a> {
    pub registry: &'a ToolRegistry,
    pub environment: &'a crate::engine::environment::Environment,
    pub tree: &'a ExecutionTree,
    pub bus: &'a EventBus,
    pub user_id: &'a str,
    pub session_id: &'a str,
    pub dedup_cache: Arc<Mutex<HashMap<(String, String), crate::engine::tool_registry::ToolResult>>>,
    pub tool_calls_used: Arc<AtomicUsize>,
    pub tool_call_budget: usize,
}

impl<'a> TurnContext<'a> {
    /// Canonicalize `(tool_name, arguments)` into a dedup key. Arguments
    /// are serialized through `serde_json::Value`'s `Ord`-free but
    /// deterministic `to_string` — `serde_json` preserves key insertion
    /// order, so two logically-identical calls built the same way collide
    /// as intended; call sites that care about true canonical equality
    /// should serialize arguments with sorted keys upstream.
    fn dedup_key(tool_name: &str, arguments: &serde_json::Value) -> (String, String) {
        (tool_name.to_string(), arguments.to_string())
    }
}

impl Specialist {
    /// Run the ReAct loop to completion.
    ///
    /// `seed_messages` is the assembled prompt minus the system prompt:
    /// recent history, an Environment description, and the current user
    /// message (including any incoming handoff).
    pub async fn run(
        &self,
        provider: &dyn ChatProvider,
        tool_registry_view: &[&crate::engine::tool_registry::ToolDescriptor],
        seed_messages: Vec<ChatMessage>,
        turn: &TurnContext<'_>,
        iteration_cap: usize,
        parent_node_id: Option<u64>,
    ) -> StepResult {
        let node_id = turn.tree.start_node(
            self.name.clone(),
            NodeKind::Agent,
            parent_node_id,
            Some(format!("{} starting", self.name)),
            None,
        );
        turn.bus
            .publish(EngineEvent::AgentStepStart {
                step_id: node_id,
                agent_name: self.name.clone(),
                step_order: 0,
            })
            .await;

        let mut messages = Vec::with_capacity(seed_messages.len() + 1);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend(seed_messages);

        let mut last_text = String::new();

        for iteration in 0..iteration_cap {
            if turn.bus.is_closed() {
                turn.tree.fail_node(node_id, "cancelled");
                return StepResult::Error(EngineError::Timeout("cancelled".to_string()));
            }

            let tools_slice: Vec<crate::engine::tool_registry::ToolDescriptor> =
                tool_registry_view.iter().map(|t| (*t).clone()).collect();

            let response_format = self.response_format.clone();
            let outcome = collect_with_retry(provider, || ChatRequest {
                model: &self.model,
                messages: &messages,
                tools: if tools_slice.is_empty() { None } else { Some(tools_slice.as_slice()) },
                temperature: Some(self.temperature),
                max_tokens: Some(self.max_tokens),
                response_format: response_format.as_ref(),
            })
            .await;

            let (text, tool_calls, structured) = match outcome {
                Ok(result) => result,
                Err(e) => {
                    turn.tree.fail_node(node_id, e.to_string());
                    turn.bus
                        .publish(EngineEvent::StepError {
                            step: self.name.clone(),
                            error: e.to_string(),
                        })
                        .await;
                    return StepResult::Error(EngineError::LlmTransport(e.to_string()));
                }
            };

            if !text.is_empty() {
                turn.bus
                    .publish(EngineEvent::AgentStepContent {
                        step_id: node_id,
                        content_chunk: text.clone(),
                    })
                    .await;
            }
            last_text = text.clone();

            if tool_calls.is_empty() {
                if let Some(format) = &self.response_format {
                    let validated = structured
                        .clone()
                        .or_else(|| serde_json::from_str(&text).ok())
                        .filter(|v| validates_against(v, &format.schema));
                    if validated.is_none() {
                        // one corrective retry
                        messages.push(ChatMessage::assistant(text.clone()));
                        messages.push(ChatMessage::user(format!(
                            "That response did not match the required schema for \"{}\". \
                             Reply again with only valid JSON matching the schema.",
                            format.name
                        )));
                        let retry = collect_with_retry(provider, || ChatRequest {
                            model: &self.model,
                            messages: &messages,
                            tools: None,
                            temperature: Some(self.temperature),
                            max_tokens: Some(self.max_tokens),
                            response_format: Some(format),
                        })
                        .await;
                        match retry {
                            Ok((retry_text, _, retry_structured)) => {
                                let retry_validated = retry_structured
                                    .or_else(|| serde_json::from_str(&retry_text).ok())
                                    .filter(|v| validates_against(v, &format.schema));
                                match retry_validated {
                                    Some(payload) => {
                                        turn.tree.complete_node(node_id, "structured output", Some(payload.clone()));
                                        turn.bus
                                            .publish(EngineEvent::AgentStepComplete {
                                                step_id: node_id,
                                                agent_name: self.name.clone(),
                                                content: retry_text.clone(),
                                                is_structured: true,
                                            })
                                            .await;
                                        return StepResult::Final {
                                            text: retry_text,
                                            structured: Some(payload),
                                        };
                                    }
                                    None => {
                                        turn.tree.fail_node(node_id, "structured_output_mismatch");
                                        return StepResult::Error(EngineError::LlmOutput(
                                            "structured_output_mismatch".to_string(),
                                        ));
                                    }
                                }
                            }
                            Err(e) => {
                                turn.tree.fail_node(node_id, e.to_string());
                                return StepResult::Error(EngineError::LlmTransport(e.to_string()));
                            }
                        }
                    }
                    turn.tree.complete_node(node_id, "structured output", validated.clone());
                    turn.bus
                        .publish(EngineEvent::AgentStepComplete {
                            step_id: node_id,
                            agent_name: self.name.clone(),
                            content: text.clone(),
                            is_structured: true,
                        })
                        .await;
                    return StepResult::Final {
                        text,
                        structured: validated,
                    };
                }

                if let Some(handoff) = parse_handoff(&text) {
                    turn.tree.complete_node(node_id, format!("handoff to {}", handoff.0), None);
                    turn.bus
                        .publish(EngineEvent::AgentStepComplete {
                            step_id: node_id,
                            agent_name: self.name.clone(),
                            content: text.clone(),
                            is_structured: false,
                        })
                        .await;
                    return StepResult::Handoff {
                        specialist: handoff.0,
                        message: handoff.1,
                    };
                }

                turn.tree.complete_node(node_id, "final answer", None);
                turn.bus
                    .publish(EngineEvent::AgentStepComplete {
                        step_id: node_id,
                        agent_name: self.name.clone(),
                        content: text.clone(),
                        is_structured: false,
                    })
                    .await;
                return StepResult::Final {
                    text,
                    structured: None,
                };
            }

            messages.push(ChatMessage::assistant(text.clone()));

            for call in tool_calls {
                if turn.tool_calls_used.load(Ordering::SeqCst) >= turn.tool_call_budget {
                    messages.push(ChatMessage::tool_result(
                        call.id.clone(),
                        "tool call budget exhausted for this turn".to_string(),
                    ));
                    continue;
                }

                let key = TurnContext::dedup_key(&call.name, &call.arguments);
                let cached = turn.dedup_cache.lock().unwrap().get(&key).cloned();
                let is_dedup_hit = cached.is_some();

                let tool_node = turn.tree.start_node(
                    call.name.clone(),
                    NodeKind::Tool,
                    Some(node_id),
                    Some(call.arguments.to_string()),
                    Some(call.arguments.clone()),
                );

                // A dedup hit replays the prior result into this iteration's
                // messages but does not surface a second tool_call/tool_result
                // event pair for what is, from the stream's point of view,
                // the same call.
                if !is_dedup_hit {
                    turn.bus
                        .publish(EngineEvent::ToolCall {
                            tool_name: call.name.clone(),
                            arguments: call.arguments.clone(),
                            agent_name: self.name.clone(),
                        })
                        .await;
                }

                let result = if let Some(cached) = cached {
                    turn.tree.annotate(tool_node, "deduplicated", serde_json::json!(true));
                    cached
                } else {
                    turn.tool_calls_used.fetch_add(1, Ordering::SeqCst);
                    let ctx = ToolContext {
                        environment: turn.environment,
                        user_id: turn.user_id,
                        session_id: turn.session_id,
                    };
                    let invoked = turn
                        .registry
                        .invoke(&call.name, call.arguments.clone(), &ctx)
                        .await
                        .unwrap_or_else(|e| crate::engine::tool_registry::ToolResult::failure(e.to_string()));
                    turn.dedup_cache.lock().unwrap().insert(key, invoked.clone());
                    invoked
                };

                if result.success {
                    turn.tree.complete_node(tool_node, result.summary.clone(), result.data.clone());
                } else {
                    turn.tree.fail_node(tool_node, result.error.clone().unwrap_or_default());
                }
                if !is_dedup_hit {
                    turn.bus
                        .publish(EngineEvent::ToolResult {
                            tool_name: call.name.clone(),
                            output_summary: result.summary.clone(),
                            truncated_output: result.truncated_preview(500),
                        })
                        .await;
                }

                if let Some(data) = &result.data {
                    turn.environment.add(
                        format!("{}.result", call.name),
                        crate::engine::environment::Value::Json { value: data.clone() },
                        None,
                    );
                }

                let observation = if result.success {
                    result.truncated_preview(2000)
                } else {
                    format!("error: {}", result.error.unwrap_or_default())
                };
                messages.push(ChatMessage::tool_result(call.id, observation));
            }

            if iteration + 1 == iteration_cap {
                turn.bus
                    .publish(EngineEvent::StepError {
                        step: self.name.clone(),
                        error: "iteration cap reached".to_string(),
                    })
                    .await;
            }
        }

        turn.tree.complete_node(node_id, "iteration cap reached", None);
        turn.bus
            .publish(EngineEvent::AgentStepComplete {
                step_id: node_id,
                agent_name: self.name.clone(),
                content: last_text.clone(),
                is_structured: false,
            })
            .await;
        StepResult::Final {
            text: last_text,
            structured: None,
        }
    }
}

/// Very small schema validator: checks that every property the schema
/// marks `required` is present in the payload. Good enough for the
/// engine's own structured outputs (coordinator decisions, sentiment
/// summaries) without pulling in a full JSON-Schema validator crate.
fn validates_against(payload: &serde_json::Value, schema: &serde_json::Value) -> bool {
    let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
        return true;
    };
    let Some(obj) = payload.as_object() else {
        return false;
    };
    required
        .iter()
        .filter_map(|r| r.as_str())
        .all(|key| obj.contains_key(key))
}

/// Parse a trailing `HANDOFF: <specialist> | <message>` marker from free
/// text — the fallback path for providers that return handoffs embedded in
/// text rather than as a structured response. Handoff messages are capped
/// per the design note against context bloat.
fn parse_handoff(text: &str) -> Option<(String, String)> {
    let marker = "HANDOFF:";
    let idx = text.rfind(marker)?;
    let rest = &text[idx + marker.len()..];
    let (specialist, message) = rest.split_once('|')?;
    let specialist = specialist.trim().to_string();
    let message: String = message.trim().split_whitespace().take(100).collect::<Vec<_>>().join(" ");
    if specialist.is_empty() {
        return None;
    }
    Some((specialist, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clients::mock::MockChatProvider;
    use crate::engine::environment::Environment;
    use async_trait::async_trait;
    use std::error::Error;
    use std::sync::Arc;

    struct EchoTool;

    #[async_trait]
    impl crate::engine::tool_registry::ToolHandler for EchoTool {
        async fn invoke(
            &self,
            arguments: serde_json::Value,
            _context: &ToolContext<'_>,
        ) -> Result<crate::engine::tool_registry::ToolResult, Box<dyn Error + Send + Sync>> {
            Ok(crate::engine::tool_registry::ToolResult::success("ok", Some(arguments)))
        }
    }

    fn turn_context<'a>(
        registry: &'a ToolRegistry,
        environment: &'a crate::engine::environment::Environment,
        tree: &'a ExecutionTree,
        bus: &'a EventBus,
    ) -> TurnContext<'a> {
        TurnContext {
            registry,
            environment,
            tree,
            bus,
            user_id: "u1",
            session_id: "s1",
            dedup_cache: Arc::new(Mutex::new(HashMap::new())),
            tool_calls_used: Arc::new(AtomicUsize::new(0)),
            tool_call_budget: 50,
        }
    }

    #[tokio::test]
    async fn final_text_without_tool_calls_terminates_the_loop() {
        let provider = MockChatProvider::with_text("The average rating is 4.2 stars.");
        let specialist = Specialist::new("general_assistant", "d", "mock-model")
            .with_system_prompt("Answer helpfully.");

        let registry = ToolRegistry::new();
        let environment = Environment::new();
        let tree = ExecutionTree::new("q");
        let (bus, stream) = crate::engine::event_bus::channel(16);
        let turn = turn_context(&registry, &environment, &tree, &bus);

        let result = specialist
            .run(&provider, &[], vec![ChatMessage::user("rate reviews")], &turn, 8, None)
            .await;
        drop(bus);
        let _ = stream.collect().await;

        match result {
            StepResult::Final { text, .. } => assert!(text.contains("4.2")),
            other => panic!("expected Final, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn handoff_marker_is_parsed_from_text() {
        let provider =
            MockChatProvider::with_text("I've gathered the raw data. HANDOFF: report_writer | Sentiment is 62% positive.");
        let specialist = Specialist::new("data_discovery", "d", "mock-model");

        let registry = ToolRegistry::new();
        let environment = Environment::new();
        let tree = ExecutionTree::new("q");
        let (bus, stream) = crate::engine::event_bus::channel(16);
        let turn = turn_context(&registry, &environment, &tree, &bus);

        let result = specialist
            .run(&provider, &[], vec![ChatMessage::user("go")], &turn, 8, None)
            .await;
        drop(bus);
        let _ = stream.collect().await;

        match result {
            StepResult::Handoff { specialist, message } => {
                assert_eq!(specialist, "report_writer");
                assert!(message.contains("62%"));
            }
            other => panic!("expected Handoff, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn tool_call_is_invoked_and_observation_fed_back() {
        let provider = MockChatProvider::with_sequence(vec![
            MockChatProvider::with_tool_call("echo", serde_json::json!({"x": 1})),
            MockChatProvider::with_text("done"),
        ]);
        let mut registry = ToolRegistry::new();
        registry
            .register(crate::engine::tool_registry::ToolDescriptor::new(
                "echo",
                "d",
                Arc::new(EchoTool),
            ))
            .unwrap();

        let specialist = Specialist::new("coder", "d", "mock-model");
        let environment = Environment::new();
        let tree = ExecutionTree::new("q");
        let (bus, stream) = crate::engine::event_bus::channel(16);
        let turn = turn_context(&registry, &environment, &tree, &bus);
        let tools: Vec<_> = registry.list_for(&[]);

        let result = specialist
            .run(&provider, &tools, vec![ChatMessage::user("go")], &turn, 8, None)
            .await;
        drop(bus);
        let events = stream.collect().await;

        assert!(events.iter().any(|e| matches!(e, EngineEvent::ToolCall { .. })));
        assert!(events.iter().any(|e| matches!(e, EngineEvent::ToolResult { .. })));
        match result {
            StepResult::Final { text, .. } => assert_eq!(text, "done"),
            other => panic!("expected Final, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn repeated_identical_tool_call_emits_only_one_event_pair() {
        let provider = MockChatProvider::with_sequence(vec![
            MockChatProvider::with_tool_call("echo", serde_json::json!({"x": 1})),
            MockChatProvider::with_tool_call("echo", serde_json::json!({"x": 1})),
            MockChatProvider::with_text("done"),
        ]);
        let mut registry = ToolRegistry::new();
        registry
            .register(crate::engine::tool_registry::ToolDescriptor::new(
                "echo",
                "d",
                Arc::new(EchoTool),
            ))
            .unwrap();

        let specialist = Specialist::new("coder", "d", "mock-model");
        let environment = Environment::new();
        let tree = ExecutionTree::new("q");
        let (bus, stream) = crate::engine::event_bus::channel(16);
        let turn = turn_context(&registry, &environment, &tree, &bus);
        let tools: Vec<_> = registry.list_for(&[]);

        let result = specialist
            .run(&provider, &tools, vec![ChatMessage::user("go")], &turn, 8, None)
            .await;
        drop(bus);
        let events = stream.collect().await;

        let tool_calls = events.iter().filter(|e| matches!(e, EngineEvent::ToolCall { .. })).count();
        let tool_results = events.iter().filter(|e| matches!(e, EngineEvent::ToolResult { .. })).count();
        assert_eq!(tool_calls, 1);
        assert_eq!(tool_results, 1);
        assert_eq!(turn.tool_calls_used.load(Ordering::SeqCst), 1);
        assert!(matches!(result, StepResult::Final { .. }));
    }

    #[tokio::test]
    async fn iteration_cap_terminates_gracefully() {
        let provider = MockChatProvider::with_tool_call("echo", serde_json::json!({}));
        let mut registry = ToolRegistry::new();
        registry
            .register(crate::engine::tool_registry::ToolDescriptor::new(
                "echo",
                "d",
                Arc::new(EchoTool),
            ))
            .unwrap();

        let specialist = Specialist::new("looping", "d", "mock-model");
        let environment = Environment::new();
        let tree = ExecutionTree::new("q");
        let (bus, stream) = crate::engine::event_bus::channel(64);
        let turn = turn_context(&registry, &environment, &tree, &bus);
        let tools: Vec<_> = registry.list_for(&[]);

        let result = specialist
            .run(&provider, &tools, vec![ChatMessage::user("go")], &turn, 3, None)
            .await;
        drop(bus);
        let _ = stream.collect().await;

        assert!(matches!(result, StepResult::Final { .. }));
    }
}
