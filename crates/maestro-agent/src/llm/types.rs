//! Core types for model interaction.
//!
//! These types model the data flowing between the agent runtime and model
//! backends.  They are provider-agnostic at this layer; backend
//! implementations (e.g. [`super::openai`]) translate them into
//! provider-specific wire formats, and the gateway never looks inside them.

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the human user or the scheduler.
    User,
    /// Output from the model.
    Assistant,
    /// Results of tool invocations, fed back to the model.
    Tool,
}

/// One block of message content.
///
/// Assistant messages carry `Text`/`Reasoning`/`ToolUse` blocks in emission
/// order; tool messages carry one `ToolResult` block per tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// Free text.
    Text { text: String },

    /// Model reasoning text (kept separate from user-visible text).
    Reasoning { text: String },

    /// A tool invocation requested by the model, with fully parsed
    /// arguments.
    ToolUse {
        /// Unique id assigned by the model for correlating results.
        id: String,
        /// The tool to invoke (must match a registered tool).
        name: String,
        /// Arguments as a JSON value, per the tool's schema.
        input: Value,
    },

    /// The result of one tool invocation.
    ToolResult {
        /// The [`Content::ToolUse`] id this result corresponds to.
        tool_call_id: String,
        /// The tool that produced this result.
        tool_name: String,
        /// Result payload.
        output: Value,
        /// Whether the invocation failed.
        #[serde(default)]
        is_error: bool,
    },

    /// A file emitted by the model (base64 payload).
    File { media_type: String, data: String },
}

/// A single message in a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,
    /// Ordered content blocks.
    pub content: Vec<Content>,
}

impl Message {
    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![Content::Text { text: text.into() }],
        }
    }

    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![Content::Text { text: text.into() }],
        }
    }

    /// Create an assistant message from reconstructed turn parts.
    pub fn assistant(content: Vec<Content>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Create a tool message from a batch of tool results.
    pub fn tool_results(results: Vec<Content>) -> Self {
        Self {
            role: Role::Tool,
            content: results,
        }
    }

    /// Concatenated text blocks (reasoning excluded).
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let Content::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// A tool definition exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema describing the tool's input parameters.
    pub input_schema: Value,
}

/// Constraint on whether/which tool the model must call this turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides freely.
    #[default]
    Auto,
    /// The model must call some tool.
    Required,
    /// The model must not call any tool.
    None,
    /// The model must call this specific tool.
    Tool { name: String },
}

// ---------------------------------------------------------------------------
// Generation parameters
// ---------------------------------------------------------------------------

/// Sampling parameters for one request.  Unset fields are filled from
/// provider overrides, then global defaults, by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl GenerationParams {
    /// Fill any unset field from `fallback`, leaving set fields untouched.
    pub fn or(mut self, fallback: &GenerationParams) -> Self {
        self.temperature = self.temperature.or(fallback.temperature);
        self.max_tokens = self.max_tokens.or(fallback.max_tokens);
        self.top_p = self.top_p.or(fallback.top_p);
        self
    }
}

// ---------------------------------------------------------------------------
// Usage and finish
// ---------------------------------------------------------------------------

/// Token usage reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the input (prompt).
    pub input_tokens: u32,
    /// Tokens generated by the model.
    pub output_tokens: u32,
}

impl Usage {
    /// Accumulate another usage report into this one.
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of turn.
    Stop,
    /// Output-token limit reached.
    Length,
    /// The model stopped to invoke tools.
    ToolUse,
    /// Provider-side content filtering.
    ContentFilter,
    /// A finish reason this runtime does not recognize.
    Other(String),
}

// ---------------------------------------------------------------------------
// Turn result
// ---------------------------------------------------------------------------

/// The reconstructed output of one model turn.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    /// Ordered parts: text, reasoning, and tool-call records.
    pub parts: Vec<Content>,
    /// Which provider served this turn (set by the gateway on success).
    pub provider: Option<String>,
    /// Why the model stopped, when reported.
    pub finish_reason: Option<FinishReason>,
    /// Token usage for this turn.
    pub usage: Usage,
}

impl ModelTurn {
    /// Concatenated free text of this turn.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Content::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// The tool calls requested in this turn, in emission order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Content::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
                _ => None,
            })
            .collect()
    }

    /// Whether this turn requested any tool calls.
    pub fn has_tool_calls(&self) -> bool {
        self.parts
            .iter()
            .any(|part| matches!(part, Content::ToolUse { .. }))
    }

    /// Render this turn as an assistant conversation message.
    pub fn to_message(&self) -> Message {
        Message::assistant(self.parts.clone())
    }
}

// ---------------------------------------------------------------------------
// Streaming chunks
// ---------------------------------------------------------------------------

/// One element of a backend's streaming feed.
///
/// Logical sub-streams (text, reasoning, tool input) are framed with explicit
/// start/delta/end markers; `ToolCall` is terminal for its call id and
/// carries fully parsed arguments.  Backends produce this union; the ReAct
/// engine's reassembler is its only consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// A text block opened; `id` keys the deltas that follow.
    TextStart { id: String },
    /// Incremental text for an open block.
    TextDelta { id: String, text: String },
    /// The text block closed.
    TextEnd { id: String },

    /// A reasoning block opened.
    ReasoningStart { id: String },
    /// Incremental reasoning text.
    ReasoningDelta { id: String, text: String },
    /// The reasoning block closed.
    ReasoningEnd { id: String },

    /// A tool call's argument stream opened.
    ToolInputStart { id: String, name: String },
    /// A fragment of a tool call's argument JSON.
    ToolInputDelta { id: String, fragment: String },
    /// A complete tool call with fully parsed arguments.  Terminal for `id`.
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },

    /// A file emitted mid-stream.
    File { media_type: String, data: String },

    /// The backend reported a structured error; the turn fails.
    Error { message: String },

    /// The turn is complete.
    Finish {
        reason: FinishReason,
        usage: Usage,
    },
}

impl StreamChunk {
    /// Whether this chunk is the structured-error kind.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// A pull-based feed of stream chunks from one provider attempt.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
