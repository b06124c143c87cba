//! Tool trait and registry.
//!
//! Tools are dispatched by name through a typed registry; an unknown name is
//! a distinct error kind, never a lookup panic.  Arguments are validated
//! against the tool's JSON Schema before execution, and expected failures
//! come back as error-flagged [`ToolOutcome`]s rather than errors — the
//! engine decides what repeated failures mean.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::Value;

use crate::context::TaskContext;
use crate::error::{AgentError, Result};
use crate::llm::types::ToolDefinition;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// One block of tool output.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolContent {
    /// Plain text fed back to the model.
    Text { text: String },
    /// Binary media (base64) with its MIME type.
    Media { media_type: String, data: String },
}

/// The result of one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    /// Ordered output blocks.
    pub content: Vec<ToolContent>,
    /// Whether the invocation failed in an expected way.
    pub is_error: bool,
}

impl ToolOutcome {
    /// A successful text result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// An error-flagged text result.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// Render the outcome as a JSON value for the conversation history.
    pub fn to_value(&self) -> Value {
        let blocks: Vec<Value> = self
            .content
            .iter()
            .map(|block| match block {
                ToolContent::Text { text } => serde_json::json!({"type": "text", "text": text}),
                ToolContent::Media { media_type, data } => {
                    serde_json::json!({"type": "media", "media_type": media_type, "data": data})
                }
            })
            .collect();

        // Single text block collapses to a plain string for compact prompts.
        if let [ToolContent::Text { text }] = self.content.as_slice() {
            return Value::String(text.clone());
        }
        Value::Array(blocks)
    }
}

/// Metadata about the call being executed, for tools that need to know who
/// invoked them.
#[derive(Debug, Clone)]
pub struct ToolCallMeta {
    /// The model-assigned call id.
    pub call_id: String,
    /// The agent this call executes for.
    pub agent_id: String,
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// A tool the model may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name.
    fn name(&self) -> &str;

    /// Human-readable description exposed to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn schema(&self) -> Value;

    /// Whether this tool may run concurrently with other parallel-safe tools
    /// in the same turn.
    fn parallel_safe(&self) -> bool {
        false
    }

    /// Execute the tool.
    ///
    /// Expected failures (file missing, HTTP 404) return an error-flagged
    /// [`ToolOutcome`]; `Err` is reserved for unexpected failures and is
    /// converted by the engine into an error-flagged result anyway.
    async fn execute(
        &self,
        args: Value,
        ctx: &TaskContext,
        call: &ToolCallMeta,
    ) -> Result<ToolOutcome>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    validator: JSONSchema,
}

/// Name-keyed tool registry with schema validation.
///
/// Each agent definition owns one registry; registries are immutable during
/// a run.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool under its name, compiling its schema.
    ///
    /// Re-registering a name replaces the previous tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_owned();
        let schema = tool.schema();
        let validator = JSONSchema::compile(&schema).map_err(|e| AgentError::ConfigError {
            reason: format!("invalid schema for tool `{name}`: {e}"),
        })?;

        tracing::debug!(tool = %name, "tool registered");
        self.tools.insert(name, RegisteredTool { tool, validator });
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, tool: Arc<dyn Tool>) -> Result<Self> {
        self.register(tool)?;
        Ok(self)
    }

    /// Definitions for every registered tool, sorted by name for a stable
    /// prompt layout.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|entry| ToolDefinition {
                name: entry.tool.name().to_owned(),
                description: entry.tool.description().to_owned(),
                input_schema: entry.tool.schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.tools
            .get(name)
            .map(|entry| entry.tool.clone())
            .ok_or_else(|| AgentError::UnknownTool {
                tool_name: name.to_owned(),
            })
    }

    /// Whether a tool is registered and safe to run in a concurrent batch.
    pub fn is_parallel_safe(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .map(|entry| entry.tool.parallel_safe())
            .unwrap_or(false)
    }

    /// Execute one tool call: validate arguments, then invoke.
    ///
    /// Returns `Err` only for unknown tool names; every other failure —
    /// schema violations included — is an error-flagged outcome the model
    /// can read and correct.
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &TaskContext,
        call: &ToolCallMeta,
    ) -> Result<ToolOutcome> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| AgentError::UnknownTool {
                tool_name: name.to_owned(),
            })?;

        if let Err(errors) = entry.validator.validate(&args) {
            let detail: Vec<String> = errors.map(|e| e.to_string()).collect();
            tracing::warn!(tool = %name, "tool arguments failed schema validation");
            return Ok(ToolOutcome::error(format!(
                "invalid arguments for `{name}`: {}",
                detail.join("; ")
            )));
        }

        match entry.tool.execute(args, ctx, call).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "tool execution failed");
                Ok(ToolOutcome::error(format!("tool `{name}` failed: {e}")))
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
