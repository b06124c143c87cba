//! Single-turn chunk reconstruction.
//!
//! Consumes the ordered [`StreamChunk`] feed for one turn and rebuilds the
//! turn's parts.  Free text and reasoning each accumulate into one running
//! string per turn; tool-call state is keyed by call id — never arrival
//! order — so argument fragments that precede, interleave with, or are
//! superseded by the terminal [`StreamChunk::ToolCall`] all merge into
//! exactly one record per id.

use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::types::{Content, FinishReason, ModelTurn, StreamChunk, Usage};

/// In-progress tool call, keyed by call id.
#[derive(Debug)]
struct ToolSlot {
    id: String,
    name: String,
    /// Argument text accumulated from `ToolInputDelta` fragments.
    partial: String,
    /// Fully parsed arguments from the terminal `ToolCall`, which win over
    /// the accumulated fragments.
    final_args: Option<Value>,
}

/// Rebuilds one turn from its chunk feed.
#[derive(Debug)]
pub struct TurnReassembler {
    provider: String,
    text: String,
    reasoning: String,
    /// Tool slots in first-seen order.
    tools: Vec<ToolSlot>,
    files: Vec<Content>,
    finish: Option<(FinishReason, Usage)>,
}

impl TurnReassembler {
    /// Create a reassembler for a stream served by `provider` (used in
    /// error context only).
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            text: String::new(),
            reasoning: String::new(),
            tools: Vec::new(),
            files: Vec::new(),
            finish: None,
        }
    }

    /// Whether the `Finish` chunk has been seen.
    pub fn is_finished(&self) -> bool {
        self.finish.is_some()
    }

    fn slot_mut(&mut self, id: &str) -> &mut ToolSlot {
        if let Some(pos) = self.tools.iter().position(|slot| slot.id == id) {
            return &mut self.tools[pos];
        }
        self.tools.push(ToolSlot {
            id: id.to_owned(),
            name: String::new(),
            partial: String::new(),
            final_args: None,
        });
        self.tools.last_mut().expect("just pushed")
    }

    /// Apply one chunk.
    ///
    /// # Errors
    ///
    /// A [`StreamChunk::Error`] fails the turn immediately; the caller's
    /// retry path takes over.
    pub fn apply(&mut self, chunk: StreamChunk) -> Result<()> {
        match chunk {
            // Start/end markers carry the hook-facing ids; accumulation is
            // one running string per turn regardless of block count.
            StreamChunk::TextStart { .. } | StreamChunk::TextEnd { .. } => {}
            StreamChunk::TextDelta { text, .. } => self.text.push_str(&text),

            StreamChunk::ReasoningStart { .. } | StreamChunk::ReasoningEnd { .. } => {}
            StreamChunk::ReasoningDelta { text, .. } => self.reasoning.push_str(&text),

            StreamChunk::ToolInputStart { id, name } => {
                let slot = self.slot_mut(&id);
                if slot.name.is_empty() {
                    slot.name = name;
                }
            }
            StreamChunk::ToolInputDelta { id, fragment } => {
                self.slot_mut(&id).partial.push_str(&fragment);
            }
            StreamChunk::ToolCall {
                id,
                name,
                arguments,
            } => {
                let slot = self.slot_mut(&id);
                if !name.is_empty() {
                    slot.name = name;
                }
                slot.final_args = Some(arguments);
            }

            StreamChunk::File { media_type, data } => {
                self.files.push(Content::File { media_type, data });
            }

            StreamChunk::Error { message } => {
                return Err(AgentError::Provider {
                    provider: self.provider.clone(),
                    reason: format!("error chunk mid-stream: {message}"),
                });
            }

            StreamChunk::Finish { reason, usage } => {
                self.finish = Some((reason, usage));
            }
        }
        Ok(())
    }

    /// Flush all state into the reconstructed turn.
    ///
    /// Tool slots without a terminal `ToolCall` fall back to parsing their
    /// accumulated fragments; empty arguments become `{}`.
    pub fn finalize(self) -> Result<ModelTurn> {
        let mut parts: Vec<Content> = Vec::new();

        if !self.reasoning.is_empty() {
            parts.push(Content::Reasoning {
                text: self.reasoning,
            });
        }
        if !self.text.is_empty() {
            parts.push(Content::Text { text: self.text });
        }

        for slot in self.tools {
            let input = match slot.final_args {
                Some(args) => args,
                None if slot.partial.is_empty() => Value::Object(Default::default()),
                None => {
                    serde_json::from_str(&slot.partial).map_err(|e| AgentError::ParseFailed {
                        reason: format!(
                            "invalid JSON in tool call `{}` arguments: {e}",
                            slot.name
                        ),
                    })?
                }
            };
            parts.push(Content::ToolUse {
                id: slot.id,
                name: slot.name,
                input,
            });
        }

        parts.extend(self.files);

        let (finish_reason, usage) = match self.finish {
            Some((reason, usage)) => (Some(reason), usage),
            None => (None, Usage::default()),
        };

        Ok(ModelTurn {
            parts,
            provider: None,
            finish_reason,
            usage,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
