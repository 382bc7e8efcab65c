//! Engine configuration.
//!
//! Constructed explicitly by the embedding application and threaded through
//! the orchestrator's constructor — the engine never reads environment
//! variables mid-request.

/// Tunables for one orchestrator instance. All fields have defaults matching
/// the values named in the external interface's configuration table.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model id used for complex-tier specialists.
    pub default_model: String,
    /// Cheap model id used for tier classification.
    pub router_model: String,
    /// Model id for the simple tier.
    pub simple_model: String,
    /// Model id for the medium tier.
    pub medium_model: String,
    /// Maximum depth of the complex-tier handoff graph.
    pub max_graph_depth: usize,
    /// Wall-clock budget for a single turn, in seconds.
    pub turn_timeout_seconds: u64,
    /// Number of prior messages fed into a specialist prompt.
    pub history_window: usize,
    /// Row count above which a table is persisted as metadata only.
    pub large_table_row_threshold: usize,
    /// Maximum tool calls a single turn may issue.
    pub tool_call_budget_per_turn: usize,
    /// Whether the pre/post LLM safety guardrail runs.
    pub enable_security_guardrail: bool,
    /// Maximum ReAct iterations for a single specialist loop.
    pub specialist_iteration_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_model: "gpt-4.1".to_string(),
            router_model: "gpt-4.1-nano".to_string(),
            simple_model: "gpt-4.1-mini".to_string(),
            medium_model: "gpt-4.1-mini".to_string(),
            max_graph_depth: 10,
            turn_timeout_seconds: 300,
            history_window: 10,
            large_table_row_threshold: 1000,
            tool_call_budget_per_turn: 50,
            enable_security_guardrail: true,
            specialist_iteration_cap: 8,
        }
    }
}

impl EngineConfig {
    /// Start from defaults and override the model used for the complex
    /// tier's specialists.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Override the router's classification model.
    pub fn with_router_model(mut self, model: impl Into<String>) -> Self {
        self.router_model = model.into();
        self
    }

    /// Override the maximum handoff graph depth.
    pub fn with_max_graph_depth(mut self, depth: usize) -> Self {
        self.max_graph_depth = depth;
        self
    }

    /// Override the per-turn wall-clock budget.
    pub fn with_turn_timeout_seconds(mut self, seconds: u64) -> Self {
        self.turn_timeout_seconds = seconds;
        self
    }

    /// Disable the security guardrail phase entirely.
    pub fn without_security_guardrail(mut self) -> Self {
        self.enable_security_guardrail = false;
        self
    }
}
