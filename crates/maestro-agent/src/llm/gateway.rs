//! Resilient model gateway.
//!
//! Wraps every configured provider behind one call surface and owns the
//! retry-free part of resilience: ordered failover across providers and the
//! three streaming guards (connect, first chunk, inter-chunk).  Turn-level
//! retries live in the ReAct engine; the gateway only ever advances to the
//! next attempt or propagates cancellation.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

use maestro_kernel::CancellationToken;

use crate::config::GatewayConfig;
use crate::error::{AgentError, Result, StallPhase};
use crate::llm::backend::BackendRequest;
use crate::llm::provider::ProviderConfig;
use crate::llm::types::{
    ChunkStream, GenerationParams, Message, ModelTurn, StreamChunk, ToolChoice, ToolDefinition,
};

/// The provider name that is guaranteed a place in every attempt list.
pub const DEFAULT_PROVIDER: &str = "default";

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// A gateway call: conversation, tools, parameters, and the caller's
/// provider preference order.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    /// Provider names in preference order.  `"default"` is appended when
    /// absent, so an empty list targets the default provider.
    pub providers: Vec<String>,
    /// Conversation history.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Tool-choice constraint for this turn.
    pub tool_choice: ToolChoice,
    /// Sampling parameters; unset fields are defaulted per attempt.
    pub params: GenerationParams,
    /// Cancellation token shared by the task tree.
    pub cancel: CancellationToken,
}

impl GatewayRequest {
    /// A request with the default provider order and no tools.
    pub fn new(messages: Vec<Message>, cancel: CancellationToken) -> Self {
        Self {
            providers: Vec::new(),
            messages,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            params: GenerationParams::default(),
            cancel,
        }
    }
}

/// A successfully opened stream, annotated with the provider serving it.
pub struct GatewayStream {
    /// The provider whose attempt succeeded.
    pub provider: String,
    /// The chunk feed.  The first chunk read by the first-chunk guard is
    /// re-emitted at the head of this feed.
    pub chunks: ChunkStream,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Multi-provider gateway with ordered failover.
///
/// Built once and shared (`Arc`) by every agent in a task; provider
/// configurations are immutable after construction.
pub struct ModelGateway {
    providers: HashMap<String, ProviderConfig>,
    defaults: GenerationParams,
    config: GatewayConfig,
}

impl ModelGateway {
    /// Create a gateway with no providers registered.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            providers: HashMap::new(),
            defaults: GenerationParams::default(),
            config,
        }
    }

    /// Builder: register a provider under its logical name.
    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.insert(provider.name().to_owned(), provider);
        self
    }

    /// Builder: set global parameter defaults (consulted after per-provider
    /// overrides).
    pub fn with_defaults(mut self, defaults: GenerationParams) -> Self {
        self.defaults = defaults;
        self
    }

    /// Names of all registered providers.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    // -----------------------------------------------------------------------
    // Attempt planning
    // -----------------------------------------------------------------------

    /// Build the attempt list: the caller's order with `"default"` appended
    /// when absent, then the whole ordered list duplicated once.
    ///
    /// Duplication is list-level (no interleaving): `[a, b]` becomes
    /// `[a, b, a, b]`, giving every provider exactly two attempts in its
    /// original relative position.
    fn attempt_order(&self, requested: &[String]) -> Vec<String> {
        let mut order: Vec<String> = requested.to_vec();
        if !order.iter().any(|name| name == DEFAULT_PROVIDER) {
            order.push(DEFAULT_PROVIDER.to_owned());
        }
        let mut doubled = order.clone();
        doubled.extend(order);
        doubled
    }

    /// Resolve one attempt: look up the provider, resolve its credential and
    /// endpoint, fill unset parameters (provider overrides, then global
    /// defaults), and apply the transform hook last so it can override
    /// anything.
    async fn prepare_attempt(
        &self,
        name: &str,
        request: &GatewayRequest,
    ) -> Result<(&ProviderConfig, BackendRequest)> {
        let provider = self
            .providers
            .get(name)
            .ok_or_else(|| AgentError::UnknownProvider { name: name.into() })?;

        let credential = provider.credential.resolve().await?;
        let endpoint = provider.endpoint.resolve().await?;
        let params = request
            .params
            .clone()
            .or(&provider.params)
            .or(&self.defaults);

        let mut backend_request = BackendRequest {
            model: provider.model.clone(),
            credential,
            endpoint,
            messages: request.messages.clone(),
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
            params,
            cancel: request.cancel.clone(),
        };

        if let Some(transform) = &provider.transform {
            backend_request = transform(backend_request);
        }

        Ok((provider, backend_request))
    }

    // -----------------------------------------------------------------------
    // Non-streaming
    // -----------------------------------------------------------------------

    /// One-shot generation with ordered failover.
    ///
    /// Returns the first successful attempt's turn, annotated with the
    /// serving provider's name; no further attempts are made after a
    /// success.  Cancellation propagates immediately; every other failure is
    /// logged and the next attempt is tried.
    pub async fn generate(&self, request: GatewayRequest) -> Result<ModelTurn> {
        if self.providers.is_empty() {
            return Err(AgentError::NoProviderAvailable);
        }

        let attempts = self.attempt_order(&request.providers);
        let mut last_error: Option<AgentError> = None;

        for name in &attempts {
            if request.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let (provider, backend_request) = match self.prepare_attempt(name, &request).await {
                Ok(prepared) => prepared,
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "attempt preparation failed");
                    last_error = Some(e);
                    continue;
                }
            };

            tracing::debug!(provider = %name, model = %provider.model, "model attempt");
            match provider.backend.generate(backend_request).await {
                Ok(mut turn) => {
                    turn.provider = Some(name.clone());
                    tracing::debug!(provider = %name, parts = turn.parts.len(), "model attempt succeeded");
                    return Ok(turn);
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "model attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(AgentError::NoProviderAvailable))
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    /// Open a streaming generation with ordered failover and stall guards.
    ///
    /// Each attempt must pass three independently timed guards: obtaining a
    /// stream handle, producing a first chunk (a first chunk of kind
    /// [`StreamChunk::Error`] also fails the attempt), and — once returned
    /// to the caller — keeping every subsequent chunk within the inter-chunk
    /// bound.  Guard expiry fails over to the next attempt; only
    /// cancellation aborts the whole call.
    pub async fn open_stream(&self, request: GatewayRequest) -> Result<GatewayStream> {
        if self.providers.is_empty() {
            return Err(AgentError::NoProviderAvailable);
        }

        let attempts = self.attempt_order(&request.providers);
        let mut last_error: Option<AgentError> = None;

        for name in &attempts {
            if request.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let (provider, backend_request) = match self.prepare_attempt(name, &request).await {
                Ok(prepared) => prepared,
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "attempt preparation failed");
                    last_error = Some(e);
                    continue;
                }
            };

            match self.try_stream_attempt(name, provider, backend_request).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "stream attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(AgentError::NoProviderAvailable))
    }

    /// Run one streaming attempt through the connect and first-chunk guards,
    /// then hand the remainder to the inter-chunk guard.
    async fn try_stream_attempt(
        &self,
        name: &str,
        provider: &ProviderConfig,
        request: BackendRequest,
    ) -> Result<GatewayStream> {
        let start_bound = self.config.stream_start_timeout();
        let inter_bound = self.config.inter_chunk_timeout();
        let cancel = request.cancel.clone();

        // Guard 1: connect — bound the time to obtain a stream handle.
        let connected = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            result = timeout(start_bound, provider.backend.open_stream(request)) => result,
        };
        let mut chunks = connected.map_err(|_| AgentError::StreamStall {
            provider: name.into(),
            phase: StallPhase::Connect,
            waited_ms: start_bound.as_millis() as u64,
        })??;

        // Guard 2: first chunk — detects backends that accept the connection
        // but never emit data (mis-routing, exhausted quota).
        let first = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            result = timeout(start_bound, chunks.next()) => result,
        }
        .map_err(|_| AgentError::StreamStall {
            provider: name.into(),
            phase: StallPhase::FirstChunk,
            waited_ms: start_bound.as_millis() as u64,
        })?;

        let first = match first {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => return Err(e),
            None => {
                return Err(AgentError::Provider {
                    provider: name.into(),
                    reason: "stream closed before first chunk".into(),
                });
            }
        };

        if let StreamChunk::Error { message } = &first {
            return Err(AgentError::Provider {
                provider: name.into(),
                reason: format!("error chunk at stream start: {message}"),
            });
        }

        // Guard 3: wrap the remainder so every later read is bounded, and
        // re-emit the already-read first chunk at the head of the feed.
        let rest = guard_remainder(name.to_owned(), chunks, inter_bound, cancel);
        let chunks: ChunkStream = Box::pin(futures::stream::iter([Ok(first)]).chain(rest));

        Ok(GatewayStream {
            provider: name.to_owned(),
            chunks,
        })
    }
}

/// Forward chunks from `inner`, failing the feed if any read exceeds
/// `bound`.  Dropping `inner` on exit aborts the underlying transport.
fn guard_remainder(
    provider: String,
    mut inner: ChunkStream,
    bound: Duration,
    cancel: CancellationToken,
) -> ChunkStream {
    let (tx, rx) = mpsc::channel::<Result<StreamChunk>>(32);

    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tx.send(Err(AgentError::Cancelled)).await;
                    break;
                }
                result = timeout(bound, inner.next()) => result,
            };

            match next {
                Err(_elapsed) => {
                    tracing::warn!(provider = %provider, bound_ms = bound.as_millis() as u64, "inter-chunk stall");
                    let _ = tx
                        .send(Err(AgentError::StreamStall {
                            provider: provider.clone(),
                            phase: StallPhase::InterChunk,
                            waited_ms: bound.as_millis() as u64,
                        }))
                        .await;
                    break;
                }
                Ok(None) => break,
                Ok(Some(item)) => {
                    let failed = item.is_err();
                    if tx.send(item).await.is_err() {
                        // Consumer dropped the feed.
                        break;
                    }
                    if failed {
                        break;
                    }
                }
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
