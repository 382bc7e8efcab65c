// src/lib.rs

// Import the top-level `engine` module.
pub mod engine;

// Re-exporting the types most callers reach for first so they don't have to
// navigate the full module path.
pub use engine::config::EngineConfig;
pub use engine::event_bus::{channel, EngineEvent, EventBus, EventStream};
pub use engine::orchestrator::Orchestrator;
pub use engine::session::{InMemorySessionStore, Session, SessionStore};
