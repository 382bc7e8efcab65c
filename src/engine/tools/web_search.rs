//! Web search tool (`web_search`).
//!
//! Hits DuckDuckGo's HTML-only endpoint directly over `reqwest`, mirroring
//! `clients::openai::OpenAIProvider`'s house style of talking to a REST
//! endpoint without a vendor SDK. Used when a query needs external facts the
//! local datasets can't answer.

use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;

use crate::engine::tool_registry::{
    ParamType, ToolContext, ToolDescriptor, ToolHandler, ToolParameter, ToolResult,
};

pub struct WebSearchTool {
    http: reqwest::Client,
}

impl WebSearchTool {
    pub fn new() -> Self {
        WebSearchTool {
            http: reqwest::Client::new(),
        }
    }

    /// Pull `<a class="result__a">` anchor texts out of DuckDuckGo's HTML
    /// lite results page. Deliberately crude string scanning rather than a
    /// full HTML parser — the engine only needs titles and links, not a DOM.
    fn extract_titles(html: &str, max_results: usize) -> Vec<String> {
        let marker = "result__a\"";
        let mut titles = Vec::new();
        let mut rest = html;
        while titles.len() < max_results {
            let Some(idx) = rest.find(marker) else { break };
            rest = &rest[idx + marker.len()..];
            let Some(gt) = rest.find('>') else { break };
            rest = &rest[gt + 1..];
            let Some(close) = rest.find("</a>") else { break };
            let title = rest[..close].trim();
            if !title.is_empty() {
                titles.push(title.to_string());
            }
            rest = &rest[close..];
        }
        titles
    }
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for WebSearchTool {
    async fn invoke(
        &self,
        arguments: serde_json::Value,
        _context: &ToolContext<'_>,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let query = arguments["query"].as_str().ok_or("missing required argument: query")?;
        let max_results = arguments["max_results"].as_u64().unwrap_or(5) as usize;

        let response = self
            .http
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", query)])
            .header("User-Agent", "insight-engine/0.1")
            .send()
            .await;

        let body = match response {
            Ok(resp) => resp.text().await.unwrap_or_default(),
            Err(e) => {
                log::warn!("web_search: transport error: {}", e);
                return Ok(ToolResult::failure(format!("web search unavailable: {}", e)));
            }
        };

        let titles = Self::extract_titles(&body, max_results);
        if titles.is_empty() {
            return Ok(ToolResult::success(
                format!("no web results found for \"{}\"", query),
                Some(serde_json::json!({ "results": [], "query": query })),
            ));
        }

        let summary = format!("found {} web results for \"{}\"", titles.len(), query);
        Ok(ToolResult::success(
            summary,
            Some(serde_json::json!({ "results": titles, "query": query })),
        ))
    }
}

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "web_search",
        "Search the public web for current information not present in local datasets.",
        Arc::new(WebSearchTool::new()),
    )
    .with_parameter(ToolParameter::new("query", ParamType::String).required())
    .with_parameter(ToolParameter::new("max_results", ParamType::Integer))
    .with_capability("research")
}
