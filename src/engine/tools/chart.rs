//! Chart specification tool (`generate_chart`).
//!
//! Builds a `ChartSpec` Environment value from a dataset already loaded by
//! `get_dataset_data_from_sql`. Actual image rendering is out of scope here
//! (the engine treats rendering as an external collaborator); this tool
//! only produces the structured spec a frontend chart library consumes.

use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;

use crate::engine::environment::Value;
use crate::engine::tool_registry::{
    ParamType, ToolContext, ToolDescriptor, ToolHandler, ToolParameter, ToolResult,
};

pub struct ChartTool;

#[async_trait]
impl ToolHandler for ChartTool {
    async fn invoke(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext<'_>,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let dataset = arguments["dataset_name"]
            .as_str()
            .ok_or("missing required argument: dataset_name")?;
        let chart_type = arguments["chart_type"].as_str().unwrap_or("bar");
        let x_column = arguments["x_column"].as_str().ok_or("missing required argument: x_column")?;
        let y_column = arguments["y_column"].as_str().ok_or("missing required argument: y_column")?;
        let title = arguments["title"].as_str().unwrap_or(dataset).to_string();

        let key = format!("dataset_data.{}", dataset);
        let rows = match context.environment.get(&key) {
            Some(Value::Table { rows }) => rows,
            _ => {
                return Ok(ToolResult::failure(format!(
                    "dataset '{}' not found or not a table; load it first",
                    dataset
                )));
            }
        };

        let series: Vec<serde_json::Value> = rows
            .iter()
            .filter_map(|row| {
                let x = row.get(x_column)?;
                let y = row.get(y_column)?;
                Some(serde_json::json!({ "x": x, "y": y }))
            })
            .collect();

        let spec = serde_json::json!({
            "chart_type": chart_type,
            "title": title,
            "x_column": x_column,
            "y_column": y_column,
            "series": series,
        });

        context.environment.add(
            format!("chart_spec.{}", dataset),
            Value::ChartSpec {
                chart_type: chart_type.to_string(),
                title: title.clone(),
                spec: spec.clone(),
                image_uri: None,
            },
            None,
        );

        let summary = format!("built a {} chart \"{}\" with {} points", chart_type, title, series.len());
        Ok(ToolResult::success(summary, Some(spec)))
    }
}

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "generate_chart",
        "Build a chart specification (type, axes, series) from a loaded dataset.",
        Arc::new(ChartTool),
    )
    .with_parameter(ToolParameter::new("dataset_name", ParamType::String).required())
    .with_parameter(ToolParameter::new("chart_type", ParamType::String))
    .with_parameter(ToolParameter::new("x_column", ParamType::String).required())
    .with_parameter(ToolParameter::new("y_column", ParamType::String).required())
    .with_parameter(ToolParameter::new("title", ParamType::String))
    .with_capability("visualization")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::environment::Environment;

    fn ctx(env: &Environment) -> ToolContext<'_> {
        ToolContext {
            environment: env,
            user_id: "u1",
            session_id: "s1",
        }
    }

    #[tokio::test]
    async fn builds_series_from_two_columns() {
        let env = Environment::new();
        let mut rows = Vec::new();
        for (month, total) in [("jan", 10), ("feb", 20)] {
            let mut row = serde_json::Map::new();
            row.insert("month".to_string(), serde_json::json!(month));
            row.insert("total".to_string(), serde_json::json!(total));
            rows.push(row);
        }
        env.add("dataset_data.sales", Value::Table { rows }, None);

        let tool = ChartTool;
        let result = tool
            .invoke(
                serde_json::json!({"dataset_name": "sales", "x_column": "month", "y_column": "total"}),
                &ctx(&env),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.data.unwrap()["series"].as_array().unwrap().len(), 2);
        assert!(matches!(env.get("chart_spec.sales"), Some(Value::ChartSpec { .. })));
    }
}
