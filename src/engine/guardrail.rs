//! Security guardrail (§4.6 Phase R2).
//!
//! A `Guardrail` is checked before a query enters the router (pre-check)
//! and again over the finalized answer before it is persisted
//! (post-check). This generalizes a per-tool-call policy-authorization
//! pattern to the coarser turn-level checks Phase R2/R5 need.

use async_trait::async_trait;

/// Outcome of a guardrail check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailDecision {
    /// Content passes unmodified.
    Allow,
    /// Content passes, but the guardrail rewrote it (e.g. PII redaction).
    Rewritten(String),
    /// Content is rejected outright; the turn must terminate with a
    /// `SafetyViolation`.
    Deny(String),
}

/// A pre- or post-LLM safety check. `check_query` runs in Phase R2 over the
/// raw user input; `check_response` runs in Phase R5 over the finalized
/// answer before it is persisted and streamed.
#[async_trait]
pub trait Guardrail: Send + Sync {
    async fn check_query(&self, query: &str) -> GuardrailDecision;
    async fn check_response(&self, response: &str) -> GuardrailDecision;
}

/// A guardrail that allows everything — used when
/// `EngineConfig::enable_security_guardrail` is false, so the orchestrator
/// doesn't need a branch for "no guardrail configured".
pub struct NoopGuardrail;

#[async_trait]
impl Guardrail for NoopGuardrail {
    async fn check_query(&self, _query: &str) -> GuardrailDecision {
        GuardrailDecision::Allow
    }

    async fn check_response(&self, _response: &str) -> GuardrailDecision {
        GuardrailDecision::Allow
    }
}

/// A minimal heuristic guardrail: rejects obvious prompt-injection
/// attempts and redacts a small set of PII-shaped patterns (emails, long
/// digit runs that look like card/SSN numbers). This is intentionally
/// crude — a production deployment substitutes a dedicated moderation
/// service behind the same trait.
pub struct HeuristicGuardrail {
    injection_markers: Vec<String>,
}

impl HeuristicGuardrail {
    pub fn new() -> Self {
        HeuristicGuardrail {
            injection_markers: vec![
                "ignore previous instructions".to_string(),
                "disregard all prior".to_string(),
                "you are now in developer mode".to_string(),
            ],
        }
    }

    fn redact_pii(text: &str) -> Option<String> {
        let mut redacted = text.to_string();
        let mut changed = false;

        if let Some(at_idx) = redacted.find('@') {
            let before = redacted[..at_idx]
                .rfind(|c: char| c.is_whitespace())
                .map(|i| i + 1)
                .unwrap_or(0);
            let after = redacted[at_idx..]
                .find(|c: char| c.is_whitespace())
                .map(|i| at_idx + i)
                .unwrap_or(redacted.len());
            if redacted[before..at_idx].chars().all(|c| c.is_alphanumeric() || c == '.' || c == '_')
                && !redacted[before..at_idx].is_empty()
            {
                redacted.replace_range(before..after, "[redacted-email]");
                changed = true;
            }
        }

        let digit_run: String = redacted.chars().filter(|c| c.is_ascii_digit()).collect();
        if digit_run.len() >= 13 {
            // crude enough to catch card/account numbers embedded in text
            let mut out = String::new();
            let mut run = String::new();
            for c in redacted.chars() {
                if c.is_ascii_digit() {
                    run.push(c);
                } else {
                    if run.len() >= 13 {
                        out.push_str("[redacted-number]");
                        changed = true;
                    } else {
                        out.push_str(&run);
                    }
                    run.clear();
                    out.push(c);
                }
            }
            if run.len() >= 13 {
                out.push_str("[redacted-number]");
                changed = true;
            } else {
                out.push_str(&run);
            }
            redacted = out;
        }

        changed.then_some(redacted)
    }
}

impl Default for HeuristicGuardrail {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Guardrail for HeuristicGuardrail {
    async fn check_query(&self, query: &str) -> GuardrailDecision {
        let lowered = query.to_lowercase();
        for marker in &self.injection_markers {
            if lowered.contains(marker.as_str()) {
                return GuardrailDecision::Deny(format!(
                    "query matched a prompt-injection heuristic: \"{}\"",
                    marker
                ));
            }
        }
        match Self::redact_pii(query) {
            Some(redacted) => GuardrailDecision::Rewritten(redacted),
            None => GuardrailDecision::Allow,
        }
    }

    async fn check_response(&self, response: &str) -> GuardrailDecision {
        match Self::redact_pii(response) {
            Some(redacted) => GuardrailDecision::Rewritten(redacted),
            None => GuardrailDecision::Allow,
        }
    }
}
