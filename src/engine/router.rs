//! Query Router — tier classification (§4.6 Phase R3).
//!
//! Classifies an incoming turn into one of three complexity tiers using a
//! cheap LLM call against `EngineConfig::router_model`, with a heuristic
//! fallback if that call fails (a classifier outage should degrade, not
//! take the whole turn down with it).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::llm_provider::{collect_with_retry, ChatMessage, ChatProvider, ChatRequest};
use crate::engine::session::Session;

/// Coarse complexity bucket chosen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Simple,
    Medium,
    Complex,
}

/// Full router decision, published as the `routing` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterDecision {
    pub tier: Tier,
    pub specialist: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
    pub detected_entities: Vec<String>,
    pub suggested_tools: Vec<String>,
}

/// The coordinator's structured decision when the complex-tier graph is
/// active: exactly one of transferring to a specialist, shortcutting
/// straight to a tool, or declaring the answer ready for synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CoordinatorDecision {
    TransferTo { specialist: String, handoff_message: String },
    RunTool { tool_name: String, arguments: serde_json::Value },
    Finish { summary: String },
}

const FOLLOW_UP_MARKERS: &[&str] = &[
    "that", "those", "it", "more detail", "more details", "again", "the above",
];

/// Classifies a query + session history into a `RouterDecision`.
pub struct Router<'a> {
    provider: &'a dyn ChatProvider,
    model: &'a str,
}

impl<'a> Router<'a> {
    pub fn new(provider: &'a dyn ChatProvider, model: &'a str) -> Self {
        Router { provider, model }
    }

    /// Classify `query` given the session's existing history. Tries an LLM
    /// call first; on transport failure, falls back to the keyword
    /// heuristic below so a classifier outage degrades gracefully rather
    /// than failing the whole turn.
    pub async fn classify(&self, query: &str, session: &Session) -> RouterDecision {
        match self.classify_via_llm(query, session).await {
            Ok(decision) => decision,
            Err(e) => {
                log::warn!("router: LLM classification failed, using heuristic: {}", e);
                self.classify_heuristically(query, session)
            }
        }
    }

    async fn classify_via_llm(
        &self,
        query: &str,
        session: &Session,
    ) -> Result<RouterDecision, Box<dyn std::error::Error + Send + Sync>> {
        let system = ChatMessage::system(
            "You are a query router. Classify the user's message into exactly one tier: \
             \"simple\" (conversational, no data access needed), \"medium\" (a follow-up \
             referencing prior turns, no new data retrieval), or \"complex\" (requires \
             dataset analysis or tool use). Respond with strict JSON: \
             {\"tier\": \"simple\"|\"medium\"|\"complex\", \"confidence\": 0..1, \
             \"reasoning\": \"...\", \"entities\": [...]}.",
        );
        let has_history = !session.history.is_empty();
        let user = ChatMessage::user(format!(
            "Has prior turns: {}\nMessage: {}",
            has_history, query
        ));
        let messages = vec![system, user];

        let (text, _, structured) = collect_with_retry(self.provider, || ChatRequest {
            model: self.model,
            messages: &messages,
            tools: None,
            temperature: Some(0.0),
            max_tokens: Some(300),
            response_format: None,
        })
        .await?;

        let payload = structured
            .or_else(|| serde_json::from_str(&text).ok())
            .ok_or("router model did not return parseable JSON")?;

        let tier = match payload["tier"].as_str() {
            Some("simple") => Tier::Simple,
            Some("medium") => Tier::Medium,
            Some("complex") => Tier::Complex,
            _ => return Err("router model returned an unknown tier".into()),
        };

        Ok(RouterDecision {
            tier,
            specialist: None,
            confidence: payload["confidence"].as_f64().unwrap_or(0.5),
            reasoning: payload["reasoning"].as_str().unwrap_or("").to_string(),
            detected_entities: payload["entities"]
                .as_array()
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            suggested_tools: Vec::new(),
        })
    }

    fn classify_heuristically(&self, query: &str, session: &Session) -> RouterDecision {
        let lowered = query.to_lowercase();
        let has_history = !session.history.is_empty();
        let references_prior = has_history && FOLLOW_UP_MARKERS.iter().any(|m| lowered.contains(m));

        let needs_data = ["dataset", "review", "sentiment", "trend", "chart", "analyze", "table"]
            .iter()
            .any(|kw| lowered.contains(kw));

        let tier = if references_prior && !needs_data {
            Tier::Medium
        } else if needs_data {
            Tier::Complex
        } else {
            Tier::Simple
        };

        RouterDecision {
            tier,
            specialist: None,
            confidence: 0.6,
            reasoning: "heuristic fallback: keyword and follow-up-marker match".to_string(),
            detected_entities: Vec::new(),
            suggested_tools: Vec::new(),
        }
    }
}

/// A coordinator is itself a specialist-shaped decision point; this trait
/// exists only to keep the orchestrator's call site readable — its real
/// implementation lives in `specialist::Specialist` configured with a
/// structured `CoordinatorDecision` response format.
#[async_trait]
pub trait Coordinate {
    async fn decide(&self, context: &str) -> Result<CoordinatorDecision, Box<dyn std::error::Error + Send + Sync>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clients::mock::MockChatProvider;

    #[tokio::test]
    async fn llm_classification_parses_structured_json() {
        let provider = MockChatProvider::with_text(
            r#"{"tier": "complex", "confidence": 0.92, "reasoning": "needs sentiment tool", "entities": ["my_reviews"]}"#,
        );
        let router = Router::new(&provider, "mock-router");
        let session = Session::new("s1", "u1");
        let decision = router.classify("Summarize sentiment for my_reviews", &session).await;
        assert_eq!(decision.tier, Tier::Complex);
        assert_eq!(decision.detected_entities, vec!["my_reviews"]);
    }

    #[tokio::test]
    async fn falls_back_to_heuristic_on_unparseable_output() {
        let provider = MockChatProvider::with_text("not json at all");
        let router = Router::new(&provider, "mock-router");
        let session = Session::new("s1", "u1");
        let decision = router.classify("Hello, what time is it?", &session).await;
        assert_eq!(decision.tier, Tier::Simple);
    }

    #[test]
    fn heuristic_detects_medium_tier_follow_up() {
        let provider = MockChatProvider::with_text("irrelevant");
        let router = Router::new(&provider, "mock-router");
        let mut session = Session::new("s1", "u1");
        session.history.push(crate::engine::session::HistoryTurn {
            role: crate::engine::session::TurnRole::Assistant,
            content: "The top complaint is pricing.".to_string(),
            created_at: chrono::Utc::now(),
        });
        let decision = router.classify_heuristically("Give me examples of that.", &session);
        assert_eq!(decision.tier, Tier::Medium);
    }

    #[test]
    fn heuristic_detects_complex_tier_from_data_keywords() {
        let provider = MockChatProvider::with_text("irrelevant");
        let router = Router::new(&provider, "mock-router");
        let session = Session::new("s1", "u1");
        let decision = router.classify_heuristically("Analyze sentiment in the reviews dataset", &session);
        assert_eq!(decision.tier, Tier::Complex);
    }
}
