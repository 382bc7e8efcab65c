//! Error taxonomy for the engine.
//!
//! Every fallible engine operation returns `Result<T, EngineError>`. The
//! variants mirror the failure classes that the orchestrator needs to treat
//! differently (recoverable vs. terminal, retryable vs. not) and each one
//! carries the reason string that ends up in a `step_error` or `error`
//! event.

use std::error::Error;
use std::fmt;

/// The closed set of failure classes the engine can produce.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Malformed input: bad tool arguments, an over-long query, an invalid
    /// session id.
    Validation(String),

    /// A tool ran but failed to produce a usable result. Not terminal —
    /// fed back to the specialist loop as an observation.
    ToolExecution(String),

    /// Network/transport failure talking to an LLM provider.
    LlmTransport(String),

    /// The LLM produced output the engine could not parse or validate
    /// against the requested structured schema.
    LlmOutput(String),

    /// A guardrail rejected the query or the response.
    SafetyViolation(String),

    /// A turn exceeded its wall-clock budget.
    Timeout(String),

    /// Anything else: a broken invariant, a logic bug.
    Internal(String),
}

impl EngineError {
    /// The `error` event reason code this failure maps to (§6 exit codes).
    pub fn reason_code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::ToolExecution(_) => "tool_execution_error",
            EngineError::LlmTransport(_) => "llm_unavailable",
            EngineError::LlmOutput(_) => "llm_invalid_output",
            EngineError::SafetyViolation(_) => "safety_violation",
            EngineError::Timeout(_) => "timeout",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Whether this failure class is recoverable within a specialist loop
    /// (fed back as an observation) rather than terminal for the turn.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::ToolExecution(_) | EngineError::LlmOutput(_)
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation error: {}", msg),
            EngineError::ToolExecution(msg) => write!(f, "tool execution error: {}", msg),
            EngineError::LlmTransport(msg) => write!(f, "LLM transport error: {}", msg),
            EngineError::LlmOutput(msg) => write!(f, "LLM output error: {}", msg),
            EngineError::SafetyViolation(msg) => write!(f, "safety violation: {}", msg),
            EngineError::Timeout(msg) => write!(f, "timeout: {}", msg),
            EngineError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl Error for EngineError {}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::LlmOutput(format!("JSON error: {}", e))
    }
}
