//! Built-in domain tool handlers.
//!
//! Concrete tool bodies (SQL-ish retrieval, sentiment, keyword search, web
//! search, chart specs) are intentionally lightweight reference
//! implementations behind the [`crate::engine::tool_registry::ToolHandler`]
//! trait — a deployment with real SQL, vector, or rendering backends swaps
//! these out without the registry or the specialists noticing.

pub mod chart;
pub mod semantic_search;
pub mod sentiment;
pub mod sql_query;
pub mod web_search;

pub use chart::ChartTool;
pub use semantic_search::SemanticSearchTool;
pub use sentiment::SentimentTool;
pub use sql_query::SqlQueryTool;
pub use web_search::WebSearchTool;

use crate::engine::tool_registry::ToolRegistry;

/// Register every built-in tool with a fresh registry. The caller is free
/// to register additional, deployment-specific tools alongside these.
pub fn register_all(registry: &mut ToolRegistry) -> Result<(), crate::engine::tool_registry::RegistryError> {
    registry.register(sql_query::descriptor())?;
    registry.register(sentiment::descriptor())?;
    registry.register(semantic_search::descriptor())?;
    registry.register(web_search::descriptor())?;
    registry.register(chart::descriptor())?;
    Ok(())
}
