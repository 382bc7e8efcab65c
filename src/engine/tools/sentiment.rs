//! Sentiment analysis tool (`analyze_sentiment`).
//!
//! A lexicon-based polarity scorer over a text column of a loaded dataset.
//! Generalizes a TextBlob-backed sentiment report into a self-contained
//! heuristic so the engine has no external NLP service dependency.

use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;

use crate::engine::environment::Value;
use crate::engine::tool_registry::{
    ParamType, ToolContext, ToolDescriptor, ToolHandler, ToolParameter, ToolResult,
};

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "excellent", "love", "amazing", "fantastic", "helpful", "easy", "happy",
    "pleased", "recommend", "best", "wonderful", "perfect",
];
const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "hate", "broken", "useless", "disappointed", "poor", "worst",
    "slow", "confusing", "refund", "annoying", "horrible",
];

fn polarity(text: &str) -> f64 {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let positive = words.iter().filter(|w| POSITIVE_WORDS.contains(w)).count();
    let negative = words.iter().filter(|w| NEGATIVE_WORDS.contains(w)).count();
    (positive as f64 - negative as f64) / words.len() as f64
}

pub struct SentimentTool;

#[async_trait]
impl ToolHandler for SentimentTool {
    async fn invoke(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext<'_>,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let dataset = arguments["dataset_name"]
            .as_str()
            .ok_or("missing required argument: dataset_name")?;
        let text_column = arguments["text_column"].as_str().unwrap_or("text");

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

        if rows.is_empty() {
            return Ok(ToolResult::success(
                format!("dataset '{}' has no rows to analyze", dataset),
                Some(serde_json::json!({"positive": 0, "neutral": 0, "negative": 0, "mean_polarity": 0.0})),
            ));
        }

        let mut positive = 0;
        let mut neutral = 0;
        let mut negative = 0;
        let mut total_polarity = 0.0;

        for row in &rows {
            let text = row.get(text_column).and_then(|v| v.as_str()).unwrap_or("");
            let score = polarity(text);
            total_polarity += score;
            if score > 0.05 {
                positive += 1;
            } else if score < -0.05 {
                negative += 1;
            } else {
                neutral += 1;
            }
        }

        let total = rows.len() as f64;
        let mean_polarity = total_polarity / total;
        let positive_pct = (positive as f64 / total * 100.0).round();
        let negative_pct = (negative as f64 / total * 100.0).round();

        let summary = format!(
            "{}% positive, {}% negative across {} records (mean polarity {:.2})",
            positive_pct,
            negative_pct,
            rows.len(),
            mean_polarity
        );

        Ok(ToolResult::success(
            summary,
            Some(serde_json::json!({
                "positive": positive,
                "neutral": neutral,
                "negative": negative,
                "mean_polarity": mean_polarity,
            })),
        ))
    }
}

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "analyze_sentiment",
        "Score the sentiment of a text column across a loaded dataset.",
        Arc::new(SentimentTool),
    )
    .with_parameter(ToolParameter::new("dataset_name", ParamType::String).required())
    .with_parameter(
        ToolParameter::new("text_column", ParamType::String)
            .with_description("defaults to \"text\" if omitted"),
    )
    .with_capability("analytics")
}
