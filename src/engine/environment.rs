//! Session Context Store (C4).
//!
//! A per-turn key→value store for tool outputs and dataset metadata. Keys
//! are stable across turns (subject to the large-table rule below); values
//! round-trip through JSON so the store can be snapshotted into session
//! persistence between turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// A tagged value held in the Environment. `TableMetadata` is what a
/// `Table` becomes once it exceeds the configured row threshold and is
/// serialized for cross-turn persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum Value {
    Table {
        rows: Vec<serde_json::Map<String, serde_json::Value>>,
    },
    TableMetadata {
        shape: (usize, usize),
        columns: Vec<String>,
        dtypes: HashMap<String, String>,
        sample: Vec<serde_json::Map<String, serde_json::Value>>,
        note: String,
    },
    ChartSpec {
        chart_type: String,
        title: String,
        spec: serde_json::Value,
        image_uri: Option<String>,
    },
    Scalar {
        value: serde_json::Value,
    },
    Text {
        value: String,
    },
    Json {
        value: serde_json::Value,
    },
}

impl Value {
    /// If this is a `Table` larger than `threshold` rows, downgrade it to
    /// `TableMetadata` (schema + first-5-row sample). Otherwise return it
    /// unchanged. Used when snapshotting the Environment for persistence.
    pub fn downgrade_large_table(self, threshold: usize) -> Value {
        match self {
            Value::Table { rows } if rows.len() > threshold => {
                let columns: Vec<String> = rows
                    .first()
                    .map(|r| r.keys().cloned().collect())
                    .unwrap_or_default();
                let mut dtypes = HashMap::new();
                if let Some(first) = rows.first() {
                    for (k, v) in first {
                        dtypes.insert(k.clone(), json_type_name(v).to_string());
                    }
                }
                let sample = rows.iter().take(5).cloned().collect();
                Value::TableMetadata {
                    shape: (rows.len(), columns.len()),
                    columns,
                    dtypes,
                    sample,
                    note: "large table, not preserved".to_string(),
                }
            }
            other => other,
        }
    }

    /// The wire tag for this value's variant, used both by snapshotting and
    /// by callers that want to describe the Environment without dumping
    /// full contents (e.g. a specialist's prompt preamble).
    pub fn tag_name(&self) -> &'static str {
        match self {
            Value::Table { .. } => "table",
            Value::TableMetadata { .. } => "table_metadata",
            Value::ChartSpec { .. } => "chart_spec",
            Value::Scalar { .. } => "scalar",
            Value::Text { .. } => "text",
            Value::Json { .. } => "json",
        }
    }
}

fn json_type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        serde_json::Value::Number(_) => "float",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// One entry in the per-turn history log (§4.4 invariant: every
/// add/replace/remove/clear is recorded and discarded between turns).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: String,
    pub key: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

struct Store {
    storage: HashMap<String, (Value, HashMap<String, serde_json::Value>)>,
    history: Vec<HistoryEntry>,
}

/// The Session Context Store. One instance is created empty at the start
/// of a turn (or restored from a prior snapshot) and discarded — apart from
/// its snapshot — at the end of the turn.
pub struct Environment {
    store: Mutex<Store>,
}

impl Environment {
    pub fn new() -> Self {
        Environment {
            store: Mutex::new(Store {
                storage: HashMap::new(),
                history: Vec::new(),
            }),
        }
    }

    /// Insert a new key or replace an existing one. Logs `"add"` if the key
    /// was not previously present, `"replace"` if it was — the public
    /// surface is a single method; the history-log distinction is an
    /// internal bookkeeping detail.
    pub fn add(&self, key: impl Into<String>, value: Value, metadata: Option<HashMap<String, serde_json::Value>>) {
        let key = key.into();
        let metadata = metadata.unwrap_or_default();
        let mut store = self.store.lock().unwrap();
        let action = if store.storage.contains_key(&key) {
            "replace"
        } else {
            "add"
        };
        store.storage.insert(key.clone(), (value, metadata.clone()));
        store.history.push(HistoryEntry {
            action: action.to_string(),
            key: Some(key),
            timestamp: Utc::now(),
            metadata,
        });
    }

    /// Retrieve a value by exact key.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.lock().unwrap().storage.get(key).map(|(v, _)| v.clone())
    }

    /// Remove a key, returning whether it was present. Logged
    /// unconditionally for audit purposes.
    pub fn remove(&self, key: &str) -> bool {
        let mut store = self.store.lock().unwrap();
        let existed = store.storage.remove(key).is_some();
        store.history.push(HistoryEntry {
            action: "remove".to_string(),
            key: Some(key.to_string()),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        });
        existed
    }

    /// Glob-style lookup: `*` matches any run of characters, everything
    /// else must match literally. Returns every key/value pair whose key
    /// matches the pattern.
    pub fn find(&self, pattern: &str) -> HashMap<String, Value> {
        let store = self.store.lock().unwrap();
        store
            .storage
            .iter()
            .filter(|(k, _)| glob_match(pattern, k))
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect()
    }

    /// All keys currently present.
    pub fn keys(&self) -> Vec<String> {
        self.store.lock().unwrap().storage.keys().cloned().collect()
    }

    /// All key/value pairs currently present.
    pub fn items(&self) -> Vec<(String, Value)> {
        self.store
            .lock()
            .unwrap()
            .storage
            .iter()
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect()
    }

    /// Remove every key. Logged as a single `"clear"` entry.
    pub fn clear(&self) {
        let mut store = self.store.lock().unwrap();
        store.storage.clear();
        store.history.push(HistoryEntry {
            action: "clear".to_string(),
            key: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        });
    }

    /// Snapshot for persistence: a JSON-serializable map, with tables over
    /// `large_table_row_threshold` downgraded to metadata-only entries.
    pub fn to_dict(&self, large_table_row_threshold: usize) -> serde_json::Value {
        let store = self.store.lock().unwrap();
        let mut map = serde_json::Map::new();
        for (key, (value, _metadata)) in store.storage.iter() {
            let downgraded = value.clone().downgrade_large_table(large_table_row_threshold);
            map.insert(
                key.clone(),
                serde_json::json!({ "tag": downgraded.tag_name(), "value": downgraded }),
            );
        }
        serde_json::Value::Object(map)
    }

    /// Restore an Environment from a prior `to_dict()` snapshot. Entries
    /// tagged `table_metadata` deserialize, per design, as-is — they are
    /// not silently reloaded into full tables; a specialist that needs the
    /// full table must re-invoke the tool that produced it.
    pub fn from_dict(snapshot: &serde_json::Value) -> Environment {
        let env = Environment::new();
        if let serde_json::Value::Object(map) = snapshot {
            for (key, entry) in map {
                if let Some(value_json) = entry.get("value") {
                    if let Ok(value) = serde_json::from_value::<Value>(value_json.clone()) {
                        env.add(key.clone(), value, None);
                    }
                }
            }
            // Restoring must not itself pollute the fresh turn's history
            // log — discard what `add` recorded.
            env.store.lock().unwrap().history.clear();
        }
        env
    }

    /// The per-turn audit log. Discarded with the Environment at the end
    /// of the turn (callers snapshot via `to_dict`, not this).
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.store.lock().unwrap().history.clone()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    fn helper(pattern: &[char], candidate: &[char]) -> bool {
        match pattern.first() {
            None => candidate.is_empty(),
            Some('*') => {
                helper(&pattern[1..], candidate)
                    || (!candidate.is_empty() && helper(pattern, &candidate[1..]))
            }
            Some(pc) => candidate.first() == Some(pc) && helper(&pattern[1..], &candidate[1..]),
        }
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();
    helper(&pattern, &candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_add_again_logs_replace() {
        let env = Environment::new();
        env.add("dataset_data.sales", Value::Text { value: "v1".into() }, None);
        env.add("dataset_data.sales", Value::Text { value: "v2".into() }, None);

        let history = env.history();
        assert_eq!(history[0].action, "add");
        assert_eq!(history[1].action, "replace");
        assert!(matches!(env.get("dataset_data.sales"), Some(Value::Text { value }) if value == "v2"));
    }

    #[test]
    fn remove_logs_regardless_of_presence() {
        let env = Environment::new();
        assert!(!env.remove("missing"));
        env.add("present", Value::Text { value: "v".into() }, None);
        assert!(env.remove("present"));

        let history = env.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, "remove");
        assert_eq!(history[1].action, "remove");
    }

    #[test]
    fn clear_wipes_storage_and_logs_once() {
        let env = Environment::new();
        env.add("a", Value::Text { value: "1".into() }, None);
        env.add("b", Value::Text { value: "2".into() }, None);
        env.clear();
        assert!(env.keys().is_empty());
        assert_eq!(env.history().last().unwrap().action, "clear");
    }

    #[test]
    fn find_supports_glob_wildcards() {
        let env = Environment::new();
        env.add("dataset_data.sales_2024", Value::Text { value: "x".into() }, None);
        env.add("dataset_data.reviews_2024", Value::Text { value: "y".into() }, None);
        env.add("clustering.reviews", Value::Text { value: "z".into() }, None);

        let matches = env.find("dataset_data.*");
        assert_eq!(matches.len(), 2);
        assert!(matches.contains_key("dataset_data.sales_2024"));
        assert!(!matches.contains_key("clustering.reviews"));
    }

    #[test]
    fn large_tables_downgrade_to_metadata_on_snapshot() {
        let env = Environment::new();
        let rows: Vec<_> = (0..1500)
            .map(|i| {
                let mut m = serde_json::Map::new();
                m.insert("id".to_string(), serde_json::json!(i));
                m
            })
            .collect();
        env.add("dataset_data.big", Value::Table { rows }, None);

        let snapshot = env.to_dict(1000);
        let entry = &snapshot["dataset_data.big"];
        assert_eq!(entry["tag"], "table_metadata");
        assert_eq!(entry["value"]["sample"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn restoring_from_snapshot_does_not_reload_large_tables() {
        let env = Environment::new();
        let rows: Vec<_> = (0..1200)
            .map(|i| {
                let mut m = serde_json::Map::new();
                m.insert("id".to_string(), serde_json::json!(i));
                m
            })
            .collect();
        env.add("dataset_data.big", Value::Table { rows }, None);
        let snapshot = env.to_dict(1000);

        let restored = Environment::from_dict(&snapshot);
        match restored.get("dataset_data.big") {
            Some(Value::TableMetadata { .. }) => {}
            other => panic!("expected table_metadata, got {:?}", other),
        }
        // Restoring must not pollute the fresh turn's history log.
        assert!(restored.history().is_empty());
    }

    #[test]
    fn small_tables_round_trip_unchanged() {
        let env = Environment::new();
        let mut row = serde_json::Map::new();
        row.insert("id".to_string(), serde_json::json!(1));
        env.add("dataset_data.small", Value::Table { rows: vec![row] }, None);

        let snapshot = env.to_dict(1000);
        let restored = Environment::from_dict(&snapshot);
        match restored.get("dataset_data.small") {
            Some(Value::Table { rows }) => assert_eq!(rows.len(), 1),
            other => panic!("expected table, got {:?}", other),
        }
    }
}
