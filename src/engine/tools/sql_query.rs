//! Dataset retrieval tool (`get_dataset_data_from_sql`).
//!
//! Reads a previously loaded table out of the Environment under
//! `dataset_data.<name>` and applies a small filter/limit language — enough
//! to answer "show me the first N rows" or "rows where column = value"
//! style requests without embedding a real SQL engine.

use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;

use crate::engine::environment::Value;
use crate::engine::tool_registry::{
    ParamType, ToolContext, ToolDescriptor, ToolHandler, ToolParameter, ToolResult,
};

pub struct SqlQueryTool;

#[async_trait]
impl ToolHandler for SqlQueryTool {
    async fn invoke(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext<'_>,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let dataset = arguments["dataset_name"]
            .as_str()
            .ok_or("missing required argument: dataset_name")?;
        let limit = arguments["limit"].as_u64().unwrap_or(100) as usize;
        let filter_column = arguments["filter_column"].as_str();
        let filter_value = arguments.get("filter_value");

        let key = format!("dataset_data.{}", dataset);
        let rows = match context.environment.get(&key) {
            Some(Value::Table { rows }) => rows,
            Some(Value::TableMetadata { note, .. }) => {
                return Ok(ToolResult::failure(format!(
                    "dataset '{}' was downgraded to metadata-only ({}); re-run the tool that produced it",
                    dataset, note
                )));
            }
            Some(_) => {
                return Ok(ToolResult::failure(format!(
                    "'{}' is not a table value",
                    dataset
                )));
            }
            None => {
                return Ok(ToolResult::failure(format!(
                    "dataset '{}' not found in context; load it first",
                    dataset
                )));
            }
        };

        let filtered: Vec<_> = rows
            .into_iter()
            .filter(|row| match (filter_column, filter_value) {
                (Some(col), Some(val)) => row.get(col) == Some(val),
                _ => true,
            })
            .take(limit)
            .collect();

        let summary = format!("fetched {} rows from '{}'", filtered.len(), dataset);
        Ok(ToolResult::success(
            summary,
            Some(serde_json::json!({ "rows": filtered, "dataset": dataset })),
        ))
    }
}

/// Build the registered descriptor for this tool.
pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "get_dataset_data_from_sql",
        "Fetch rows from a previously loaded dataset, optionally filtered by one column.",
        Arc::new(SqlQueryTool),
    )
    .with_parameter(ToolParameter::new("dataset_name", ParamType::String).required())
    .with_parameter(
        ToolParameter::new("limit", ParamType::Integer)
            .with_description("maximum rows to return, default 100"),
    )
    .with_parameter(ToolParameter::new("filter_column", ParamType::String))
    .with_capability("data_discovery")
}
