//! Agent error types.
//!
//! All runtime subsystems surface errors through [`AgentError`].  The
//! taxonomy matters operationally: cancellation is never retried and always
//! propagates, provider/transport failures are absorbed by failover and turn
//! retries, tool failures are converted into error-flagged results, and plan
//! errors are fatal immediately.  [`AgentError::is_cancellation`] is the one
//! check every retry loop must make before trying again.

use uuid::Uuid;

/// Which streaming guard expired during a provider attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallPhase {
    /// Obtaining the stream handle took too long.
    Connect,
    /// The backend accepted the connection but never emitted a first chunk.
    FirstChunk,
    /// A later chunk failed to arrive within the inter-chunk bound.
    InterChunk,
}

impl std::fmt::Display for StallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::FirstChunk => "first-chunk",
            Self::InterChunk => "inter-chunk",
        };
        write!(f, "{s}")
    }
}

/// Unified error type for the agent execution core.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Cancellation --------------------------------------------------------
    /// The task's cancellation token fired.  Never retried; propagates
    /// through every layer to the caller.
    #[error("task cancelled")]
    Cancelled,

    // -- Gateway / provider errors -------------------------------------------
    /// A single provider attempt failed (HTTP error, malformed response,
    /// credential resolution failure).  Absorbed by failover.
    #[error("provider `{provider}` failed: {reason}")]
    Provider { provider: String, reason: String },

    /// A streaming guard expired for one provider attempt.
    #[error("provider `{provider}` stalled at {phase} after {waited_ms}ms")]
    StreamStall {
        provider: String,
        phase: StallPhase,
        waited_ms: u64,
    },

    /// The model's output could not be parsed into the expected shape.
    #[error("model response parse error: {reason}")]
    ParseFailed { reason: String },

    /// Every configured provider attempt was exhausted.
    #[error("no model backend available")]
    NoProviderAvailable,

    /// A request named a provider that was never configured.
    #[error("unknown provider: {name}")]
    UnknownProvider { name: String },

    // -- ReAct engine errors -------------------------------------------------
    /// The whole-turn retry ceiling was exceeded.
    #[error("turn failed after {attempts} attempts: {reason}")]
    TurnRetriesExhausted { attempts: u32, reason: String },

    /// A tool call referenced by the model does not exist in the registry.
    #[error("unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    /// A tool invocation failed.  Converted into an error-flagged tool
    /// result by the engine; only surfaces directly if conversion is
    /// impossible.
    #[error("tool execution failed for `{tool_name}`: {reason}")]
    ToolExecutionFailed { tool_name: String, reason: String },

    /// The consecutive tool-error ceiling was exceeded; the agent aborts.
    #[error("agent `{agent_id}` aborted after {count} consecutive tool failures")]
    ToolErrorCeiling { agent_id: String, count: u32 },

    // -- Scheduler errors ----------------------------------------------------
    /// An agent ended in `Error` status; the run aborts after lifecycle
    /// notification.
    #[error("agent `{agent_id}` failed: {reason}")]
    AgentFailed { agent_id: String, reason: String },

    /// The plan references an agent name with no registered definition, or a
    /// dependency id that matches no agent.  Fatal, raised immediately.
    #[error("plan error for task {task_id}: {reason}")]
    PlanError { task_id: Uuid, reason: String },

    // -- Configuration -------------------------------------------------------
    /// Configuration loading or validation failed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    // -- Serialization -------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // -- Upstream crate errors -----------------------------------------------
    /// An error propagated from the kernel crate.
    #[error("kernel error: {0}")]
    Kernel(#[from] maestro_kernel::KernelError),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Whether this error is an explicit cancellation.
    ///
    /// Retry and failover loops must check this before advancing to the next
    /// attempt: cancellation is never a retryable failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::Provider {
            provider: "http".into(),
            reason: err.to_string(),
        }
    }
}
