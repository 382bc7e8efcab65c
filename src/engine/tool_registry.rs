//! Tool Registry & Invoker (C1).
//!
//! Holds [`ToolDescriptor`]s, validates arguments against their declared
//! schema, executes the handler behind a timer and an error boundary, and
//! hands back a uniform [`ToolResult`] regardless of how the handler failed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::engine::environment::Environment;

/// Outcome of one tool invocation, uniform across every tool in the
/// registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub summary: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ToolResult {
    /// Build a successful result with the given summary and optional
    /// structured payload.
    pub fn success(summary: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        ToolResult {
            success: true,
            summary: summary.into(),
            data,
            error: None,
            duration_ms: 0,
            metadata: HashMap::new(),
        }
    }

    /// Build a failed result from a human-readable error message.
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        ToolResult {
            success: false,
            summary: format!("Tool execution failed: {}", error),
            data: None,
            error: Some(error),
            duration_ms: 0,
            metadata: HashMap::new(),
        }
    }

    /// Attach a piece of invoker-level metadata (e.g. dedup hit).
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Produce a truncated preview of `data`/`error`, used for the
    /// `tool_result` stream event so large payloads don't flood the bus.
    pub fn truncated_preview(&self, max_chars: usize) -> String {
        let raw = match (&self.data, &self.error) {
            (Some(data), _) => data.to_string(),
            (None, Some(err)) => err.clone(),
            (None, None) => self.summary.clone(),
        };
        if raw.chars().count() <= max_chars {
            raw
        } else {
            let truncated: String = raw.chars().take(max_chars).collect();
            format!("{}…", truncated)
        }
    }
}

/// JSON-Schema-shaped parameter type, mirrored one level deep — enough to
/// validate the simple scalar/array/object arguments tools in this engine
/// take.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// One parameter in a tool's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub description: Option<String>,
    pub required: bool,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        ToolParameter {
            name: name.into(),
            param_type,
            description: None,
            required: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A named capability a specialist must be granted to see a tool. Keeps
/// the registry's scoping explicit rather than tool-name allow-lists
/// scattered through specialist configuration.
pub type Capability = String;

/// Context handed to a tool handler at invocation time. Handlers must not
/// retain a reference past the call.
pub struct ToolContext<'a> {
    pub environment: &'a Environment,
    pub user_id: &'a str,
    pub session_id: &'a str,
}

/// The executable half of a tool: given validated arguments and a context,
/// produce a result.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext<'_>,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>>;
}

/// Static description plus handler for one tool.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    pub capabilities: Vec<Capability>,
    handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        ToolDescriptor {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            capabilities: Vec::new(),
            handler,
        }
    }

    pub fn with_parameter(mut self, param: ToolParameter) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Render this descriptor as the function-calling schema shape LLM
    /// providers expect.
    pub fn to_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let type_str = match param.param_type {
                ParamType::String => "string",
                ParamType::Number => "number",
                ParamType::Integer => "integer",
                ParamType::Boolean => "boolean",
                ParamType::Array => "array",
                ParamType::Object => "object",
            };
            let mut prop = serde_json::json!({ "type": type_str });
            if let Some(desc) = &param.description {
                prop["description"] = serde_json::json!(desc);
            }
            properties.insert(param.name.clone(), prop);
            if param.required {
                required.push(param.name.clone());
            }
        }
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }

    fn validate(&self, arguments: &serde_json::Value) -> Result<(), RegistryError> {
        let obj = arguments
            .as_object()
            .ok_or_else(|| RegistryError::InvalidArguments("arguments must be an object".into()))?;
        for param in &self.parameters {
            match obj.get(&param.name) {
                Some(value) => {
                    if !param_type_matches(&param.param_type, value) {
                        return Err(RegistryError::InvalidArguments(format!(
                            "parameter {} must be of type {:?}, got {}",
                            param.name,
                            param.param_type,
                            value_kind(value)
                        )));
                    }
                }
                None if param.required => {
                    return Err(RegistryError::InvalidArguments(format!(
                        "missing required parameter: {}",
                        param.name
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }
}

fn param_type_matches(param_type: &ParamType, value: &serde_json::Value) -> bool {
    match param_type {
        ParamType::String => value.is_string(),
        ParamType::Number => value.is_number(),
        ParamType::Integer => value.is_i64() || value.is_u64(),
        ParamType::Boolean => value.is_boolean(),
        ParamType::Array => value.is_array(),
        ParamType::Object => value.is_object(),
    }
}

fn value_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Error types for registry-level operations (distinct from `ToolResult`,
/// which carries handler-level failures).
#[derive(Debug, Clone)]
pub enum RegistryError {
    DuplicateTool(String),
    UnknownTool(String),
    InvalidArguments(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateTool(name) => write!(f, "tool already registered: {}", name),
            RegistryError::UnknownTool(name) => write!(f, "unknown tool: {}", name),
            RegistryError::InvalidArguments(msg) => write!(f, "invalid arguments: {}", msg),
        }
    }
}

impl Error for RegistryError {}

/// Holds every tool descriptor known to the engine. Populated once at
/// startup and treated as read-only for the lifetime of the process.
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry {
            tools: HashMap::new(),
        }
    }

    /// Register a tool descriptor. Fails if the name is already taken.
    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<(), RegistryError> {
        if self.tools.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateTool(descriptor.name));
        }
        self.tools.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Borrow a tool descriptor by name.
    pub fn get(&self, name: &str) -> Result<&ToolDescriptor, RegistryError> {
        self.tools
            .get(name)
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    /// List descriptors visible to a specialist holding `capabilities`.
    /// A tool is visible if its capability set is a subset of the given
    /// capabilities, or if it declares no capabilities at all (public).
    pub fn list_for(&self, capabilities: &[Capability]) -> Vec<&ToolDescriptor> {
        self.tools
            .values()
            .filter(|t| {
                t.capabilities.is_empty()
                    || t.capabilities.iter().all(|c| capabilities.contains(c))
            })
            .collect()
    }

    /// Validate arguments, invoke the handler, and always return a
    /// `ToolResult` — handler panics are not caught (they indicate a bug,
    /// not a recoverable tool failure), but returned errors are converted.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
        context: &ToolContext<'_>,
    ) -> Result<ToolResult, RegistryError> {
        let descriptor = self.get(name)?;
        descriptor.validate(&arguments)?;

        let start = Instant::now();
        let outcome = descriptor.handler.invoke(arguments, context).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => ToolResult::failure(e.to_string()),
        };
        result.duration_ms = duration_ms;
        Ok(result)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
