//! Session persistence contract (§3, §6).
//!
//! `Session` is the in-memory shape the orchestrator works with; the
//! `SessionStore` trait is the external collaborator that durably persists
//! it. The engine ships an in-memory reference implementation for tests —
//! a production embedder supplies its own backed by its relational store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: TurnRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub message_id: String,
    pub agent_name: String,
    pub step_order: usize,
    pub tool_call: Option<serde_json::Value>,
    pub structured_output: Option<serde_json::Value>,
    pub raw_output: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// A session as the orchestrator sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub history: Vec<HistoryTurn>,
    pub extra_metadata: HashMap<String, serde_json::Value>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Session {
            session_id: session_id.into(),
            user_id: user_id.into(),
            history: Vec::new(),
            extra_metadata: HashMap::new(),
        }
    }

    /// The prior turn's Environment snapshot, saved by `SessionStore::save_context`
    /// under the same `context_state` key it reads from — keeps the save and
    /// restore paths pointed at one location.
    pub fn context(&self) -> Option<&serde_json::Value> {
        self.extra_metadata.get("context_state")
    }

    /// The last `window` history turns, oldest first — what gets fed into
    /// a specialist's prompt (§4.5 step 1).
    pub fn recent_history(&self, window: usize) -> &[HistoryTurn] {
        let start = self.history.len().saturating_sub(window);
        &self.history[start..]
    }
}

/// The external persistence contract (§6). Implementations own whatever
/// storage medium they like; the engine never assumes a schema.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, Box<dyn Error + Send + Sync>>;

    async fn create_session(
        &self,
        session_id: &str,
        user_id: &str,
        extra_metadata: HashMap<String, serde_json::Value>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn append_message(
        &self,
        session_id: &str,
        role: TurnRole,
        content: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    async fn update_message(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn save_steps(
        &self,
        session_id: &str,
        steps: Vec<StepRecord>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn save_extra_metadata(
        &self,
        session_id: &str,
        extra_metadata: HashMap<String, serde_json::Value>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Snapshot the Environment into the session's `extra_metadata`. A
    /// thin convenience built from `save_extra_metadata` so callers don't
    /// have to re-derive the `context_state`/`context_saved_at` keys.
    async fn save_context(
        &self,
        session_id: &str,
        context: serde_json::Value,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut metadata = HashMap::new();
        metadata.insert("context_state".to_string(), context);
        metadata.insert(
            "context_saved_at".to_string(),
            serde_json::json!(Utc::now().to_rfc3339()),
        );
        self.save_extra_metadata(session_id, metadata).await
    }
}

/// In-memory `SessionStore`, used by tests and as a reference
/// implementation for embedders that don't yet have durable storage wired
/// up.
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    steps: Mutex<HashMap<String, Vec<StepRecord>>>,
    next_message_id: Mutex<u64>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        InMemorySessionStore {
            sessions: Mutex::new(HashMap::new()),
            steps: Mutex::new(HashMap::new()),
            next_message_id: Mutex::new(0),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, Box<dyn Error + Send + Sync>> {
        Ok(self.sessions.lock().unwrap().get(session_id).cloned())
    }

    async fn create_session(
        &self,
        session_id: &str,
        user_id: &str,
        extra_metadata: HashMap<String, serde_json::Value>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut session = Session::new(session_id, user_id);
        session.extra_metadata = extra_metadata;
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.to_string(), session);
        Ok(())
    }

    async fn append_message(
        &self,
        session_id: &str,
        role: TurnRole,
        content: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or(format!("no such session: {}", session_id))?;
        session.history.push(HistoryTurn {
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        });
        let mut next_id = self.next_message_id.lock().unwrap();
        *next_id += 1;
        Ok(format!("msg_{}", *next_id))
    }

    async fn update_message(
        &self,
        session_id: &str,
        _message_id: &str,
        content: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or(format!("no such session: {}", session_id))?;
        if let Some(last) = session.history.last_mut() {
            last.content = content.to_string();
        }
        Ok(())
    }

    async fn save_steps(
        &self,
        session_id: &str,
        steps: Vec<StepRecord>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.steps
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .extend(steps);
        Ok(())
    }

    async fn save_extra_metadata(
        &self,
        session_id: &str,
        extra_metadata: HashMap<String, serde_json::Value>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or(format!("no such session: {}", session_id))?;
        session.extra_metadata.extend(extra_metadata);
        Ok(())
    }
}
