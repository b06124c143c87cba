//! Agent execution core for maestro.
//!
//! This crate drives declarative plans of cooperating AI agents: a resilient
//! multi-provider model gateway, the ReAct (reason + act) loop that turns
//! model output into tool invocations and back into conversation state, and
//! the workflow scheduler that walks a dependency graph of agents with
//! replanning, pause, and cancellation.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   per agent   ┌─────────────┐   per turn   ┌───────────┐
//! │   Workflow    │──────────────>│ ReAct loop  │─────────────>│  Gateway  │
//! │   scheduler   │               │ (reassembly │              │ (failover,│
//! │ (steps, plan) │<──────────────│  + tools)   │<─────────────│  guards)  │
//! └───────┬───────┘    results    └─────────────┘    chunks    └─────┬─────┘
//!         │                                                          │
//!   lifecycle bus                                              ModelBackend
//!  (maestro-kernel)                                            (per wire)
//! ```
//!
//! ## Modules
//!
//! - [`llm`] -- Model gateway, provider configuration, backend trait, wire
//!   types, and the reference OpenAI-compatible backend.
//! - [`react`] -- Chunk reassembly and the multi-turn loop driver.
//! - [`scheduler`] -- Step derivation and the workflow runner.
//! - [`workflow`] -- Plan types produced by the external planner.
//! - [`tools`] -- Tool trait and name-keyed registry with schema validation.
//! - [`context`] -- Per-task shared state and execution history.
//! - [`config`] -- Runtime tunables (timeouts, ceilings, flags).
//! - [`error`] -- Agent error taxonomy.

pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod react;
pub mod scheduler;
pub mod tools;
pub mod workflow;

// Re-export the most commonly used types at the crate root.
pub use config::{GatewayConfig, ReactConfig, RuntimeConfig, SchedulerConfig};
pub use context::{AgentChain, TaskContext, ToolChain};
pub use error::{AgentError, Result, StallPhase};
pub use llm::{
    BackendRequest, ChunkStream, Content, FinishReason, GatewayRequest, GatewayStream,
    GenerationParams, Message, ModelBackend, ModelGateway, ModelTurn, OpenAiBackend,
    ProviderConfig, Resolvable, Role, StreamChunk, ToolChoice, ToolDefinition, Usage,
};
pub use react::{
    ContinuationPolicy, FinishDirective, ReactHooks, ReactOutcome, ReactRunner, TurnReassembler,
};
pub use scheduler::{
    AgentDefinition, Replanner, Step, StopReason, WorkflowOutcome, WorkflowRunner,
};
pub use tools::{Tool, ToolCallMeta, ToolContent, ToolOutcome, ToolRegistry};
pub use workflow::{AgentStatus, WorkNode, Workflow, WorkflowAgent};
