//! Model backend trait.
//!
//! A backend owns one wire protocol (Anthropic Messages, OpenAI Chat
//! Completions, a local runner, a test double) and translates the neutral
//! request/turn/chunk types to and from it.  The gateway talks to every
//! backend through this trait and never sees wire formats.

use async_trait::async_trait;

use maestro_kernel::CancellationToken;

use crate::error::Result;
use crate::llm::types::{
    ChunkStream, GenerationParams, Message, ModelTurn, ToolChoice, ToolDefinition,
};

/// A fully resolved request, ready for one backend attempt.
///
/// The gateway resolves credentials/endpoints, fills defaulted parameters,
/// and applies the provider's transform hook before a backend ever sees the
/// request.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// Model identifier to request.
    pub model: String,
    /// Resolved credential for this attempt.
    pub credential: String,
    /// Resolved endpoint base URL for this attempt.
    pub endpoint: String,
    /// Conversation history.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Tool-choice constraint for this turn.
    pub tool_choice: ToolChoice,
    /// Fully defaulted sampling parameters.
    pub params: GenerationParams,
    /// Cancellation token shared by the task tree.
    pub cancel: CancellationToken,
}

/// Trait implemented by every model backend.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Short identifier for logging (e.g. `"openai-compatible"`).
    fn kind(&self) -> &str;

    /// One-shot generation: block until the full turn is available.
    async fn generate(&self, request: BackendRequest) -> Result<ModelTurn>;

    /// Open a streaming generation and return the chunk feed.
    ///
    /// Implementations should return as soon as a stream handle exists;
    /// the gateway times this call (connect guard) separately from the
    /// first read (first-chunk guard).
    async fn open_stream(&self, request: BackendRequest) -> Result<ChunkStream>;
}
