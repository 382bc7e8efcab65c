//! Semantic search tool (`semantic_search`).
//!
//! A keyword-overlap ranking over a loaded dataset's text column —
//! generalizes the embedding-vector-similarity tools in the corpus into a
//! dependency-free ranker so the engine doesn't need a vector store
//! configured to be exercised end to end. A real deployment can swap this
//! handler for one backed by an actual embedding index without touching the
//! tool contract.

use async_trait::async_trait;
use std::collections::HashSet;
use std::error::Error;
use std::sync::Arc;

use crate::engine::environment::Value;
use crate::engine::tool_registry::{
    ParamType, ToolContext, ToolDescriptor, ToolHandler, ToolParameter, ToolResult,
};

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect()
}

fn overlap_score(query_tokens: &HashSet<String>, candidate: &str) -> f64 {
    let candidate_tokens = tokenize(candidate);
    if candidate_tokens.is_empty() || query_tokens.is_empty() {
        return 0.0;
    }
    let hits = query_tokens.intersection(&candidate_tokens).count();
    hits as f64 / query_tokens.len() as f64
}

pub struct SemanticSearchTool;

#[async_trait]
impl ToolHandler for SemanticSearchTool {
    async fn invoke(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext<'_>,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let dataset = arguments["dataset_name"]
            .as_str()
            .ok_or("missing required argument: dataset_name")?;
        let query = arguments["query"].as_str().ok_or("missing required argument: query")?;
        let text_column = arguments["text_column"].as_str().unwrap_or("text");
        let top_k = arguments["top_k"].as_u64().unwrap_or(5) as usize;

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

        let query_tokens = tokenize(query);
        let mut scored: Vec<(f64, &serde_json::Map<String, serde_json::Value>)> = rows
            .iter()
            .map(|row| {
                let text = row.get(text_column).and_then(|v| v.as_str()).unwrap_or("");
                (overlap_score(&query_tokens, text), row)
            })
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let matches: Vec<serde_json::Value> = scored
            .into_iter()
            .take(top_k)
            .map(|(score, row)| {
                let mut entry = serde_json::Map::new();
                entry.insert("score".to_string(), serde_json::json!(score));
                entry.insert("row".to_string(), serde_json::Value::Object(row.clone()));
                serde_json::Value::Object(entry)
            })
            .collect();

        let summary = format!("found {} matches for \"{}\" in '{}'", matches.len(), query, dataset);
        Ok(ToolResult::success(
            summary,
            Some(serde_json::json!({ "matches": matches })),
        ))
    }
}

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "semantic_search",
        "Rank rows of a loaded dataset by keyword overlap with a free-text query.",
        Arc::new(SemanticSearchTool),
    )
    .with_parameter(ToolParameter::new("dataset_name", ParamType::String).required())
    .with_parameter(ToolParameter::new("query", ParamType::String).required())
    .with_parameter(ToolParameter::new("text_column", ParamType::String))
    .with_parameter(ToolParameter::new("top_k", ParamType::Integer))
    .with_capability("research")
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
    async fn ranks_rows_by_keyword_overlap() {
        let env = Environment::new();
        let mut rows = Vec::new();
        for text in ["shipping was slow", "great pricing and fast delivery", "app crashes often"] {
            let mut row = serde_json::Map::new();
            row.insert("text".to_string(), serde_json::json!(text));
            rows.push(row);
        }
        env.add("dataset_data.reviews", Value::Table { rows }, None);

        let tool = SemanticSearchTool;
        let result = tool
            .invoke(
                serde_json::json!({"dataset_name": "reviews", "query": "pricing"}),
                &ctx(&env),
            )
            .await
            .unwrap();
        assert!(result.success);
        let matches = result.data.unwrap()["matches"].as_array().unwrap().clone();
        assert_eq!(matches.len(), 1);
    }
}
