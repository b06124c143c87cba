//! Model gateway and provider-agnostic wire types.
//!
//! - [`types`] -- Neutral message/turn/chunk types shared by the whole core.
//! - [`provider`] -- Provider configuration with deferred credential and
//!   endpoint resolution.
//! - [`backend`] -- The [`backend::ModelBackend`] trait every wire protocol
//!   implements.
//! - [`gateway`] -- Ordered failover and streaming stall guards.
//! - [`openai`] -- Reference OpenAI-compatible backend (SSE).

pub mod backend;
pub mod gateway;
pub mod openai;
pub mod provider;
pub mod types;

pub use backend::{BackendRequest, ModelBackend};
pub use gateway::{DEFAULT_PROVIDER, GatewayRequest, GatewayStream, ModelGateway};
pub use openai::OpenAiBackend;
pub use provider::{ProviderConfig, RequestTransform, Resolvable, ValueResolver};
pub use types::{
    ChunkStream, Content, FinishReason, GenerationParams, Message, ModelTurn, Role, StreamChunk,
    ToolChoice, ToolDefinition, Usage,
};
