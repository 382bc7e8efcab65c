//! Streaming Event Bus (C3).
//!
//! A bounded, ordered, single-producer/multi-pull-consumer channel of
//! [`EngineEvent`]s from the engine to the caller. Every turn emits exactly
//! one terminal event (`Complete` or `Error`); nothing follows it.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// The complete, fixed set of event kinds the engine emits. Names are
/// final — no aliases, per the design note resolving streaming-name drift
/// across the system's several parallel implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    Connected,
    Status {
        status: String,
        message: String,
    },
    Routing {
        specialist: Option<String>,
        confidence: f64,
        reasoning: String,
        entities: Vec<String>,
    },
    AgentStepStart {
        step_id: u64,
        agent_name: String,
        step_order: usize,
    },
    AgentStepContent {
        step_id: u64,
        content_chunk: String,
    },
    AgentStepComplete {
        step_id: u64,
        agent_name: String,
        content: String,
        is_structured: bool,
    },
    ToolCall {
        tool_name: String,
        arguments: serde_json::Value,
        agent_name: String,
    },
    ToolResult {
        tool_name: String,
        output_summary: String,
        truncated_output: String,
    },
    Content {
        content: String,
    },
    StepError {
        step: String,
        error: String,
    },
    Error {
        error: String,
    },
    Complete {
        message_id: String,
        message: String,
        metadata: serde_json::Value,
    },
}

impl EngineEvent {
    /// Whether this event kind terminates the turn's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineEvent::Complete { .. } | EngineEvent::Error { .. })
    }
}

/// Producer handle. Owned by the orchestrator and specialist loop; cloning
/// is cheap (wraps an `mpsc::Sender`).
#[derive(Clone)]
pub struct EventBus {
    sender: mpsc::Sender<EngineEvent>,
}

/// Consumer handle returned alongside an `EventBus` from [`channel`].
pub struct EventStream {
    receiver: mpsc::Receiver<EngineEvent>,
}

/// Default bus capacity. Small and bounded: a slow consumer applies
/// backpressure to the producer rather than letting memory grow unbounded.
pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// Create a bounded event channel.
pub fn channel(capacity: usize) -> (EventBus, EventStream) {
    let (sender, receiver) = mpsc::channel(capacity);
    (EventBus { sender }, EventStream { receiver })
}

impl EventBus {
    /// Publish an event. Once the turn has emitted a terminal event no
    /// further publishes are expected; callers are responsible for
    /// respecting that contract (the bus does not enforce it to keep the
    /// hot path allocation-free).
    pub async fn publish(&self, event: EngineEvent) {
        // A closed receiver means the consumer disconnected; this is the
        // cancellation signal propagating back to the producer side. It is
        // not an error the orchestrator needs to react to beyond stopping.
        let _ = self.sender.send(event).await;
    }

    /// Whether the consumer has gone away (used to short-circuit further
    /// work once cancellation is observed).
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl EventStream {
    /// Pull the next event, or `None` once the producer side is dropped
    /// (which only happens after the terminal event has been sent and the
    /// bus itself is discarded).
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.receiver.recv().await
    }

    /// Drain all remaining events into a `Vec`, useful in tests that want
    /// to assert on the full sequence.
    pub async fn collect(mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.receiver.recv().await {
            events.push(event);
        }
        events
    }
}
