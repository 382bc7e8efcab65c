//! Server-sent-event encoding for the outbound stream (§6).
//!
//! The engine itself only produces [`EngineEvent`](crate::engine::event_bus::EngineEvent)
//! values; this module is the thin adapter that renders them onto the wire
//! format an HTTP layer would write to the response body.

use crate::engine::event_bus::EngineEvent;

/// Encode one event as an SSE frame: `data: <json>\n\n`.
pub fn encode(event: &EngineEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("data: {}\n\n", json)
}

/// Headers an HTTP layer should set on the streaming response.
pub const SSE_HEADERS: &[(&str, &str)] = &[
    ("Cache-Control", "no-cache"),
    ("Connection", "keep-alive"),
    ("X-Accel-Buffering", "no"),
];
