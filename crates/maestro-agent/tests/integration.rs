//! Integration tests for the gateway and the ReAct engine.
//!
//! These tests run real tokio timers against mock backends: stalled streams
//! really stall, failover really walks the attempt list, and the streaming
//! engine reconstructs turns from real chunk feeds.  No scheduler here —
//! see `e2e_workflow.rs` for whole-plan runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use maestro_agent::config::{GatewayConfig, ReactConfig};
use maestro_agent::context::AgentChain;
use maestro_agent::error::{AgentError, StallPhase};
use maestro_agent::llm::backend::{BackendRequest, ModelBackend};
use maestro_agent::llm::gateway::{GatewayRequest, ModelGateway};
use maestro_agent::llm::provider::ProviderConfig;
use maestro_agent::llm::types::{
    ChunkStream, Content, FinishReason, Message, ModelTurn, StreamChunk, Usage,
};
use maestro_agent::react::ReactRunner;
use maestro_agent::tools::{Tool, ToolCallMeta, ToolOutcome, ToolRegistry};
use maestro_agent::{RuntimeConfig, TaskContext, Workflow};
use maestro_kernel::{CancellationToken, EventBus, TaskRegistry};

// ─────────────────────────────────────────────────────────────────────────────
//  Mock backends
// ─────────────────────────────────────────────────────────────────────────────

/// How a streaming attempt should behave.
#[derive(Clone)]
enum StreamBehavior {
    /// Emit these chunks, then end the stream.
    Chunks(Vec<StreamChunk>),
    /// Connect, then never emit a first chunk.
    NeverFirstChunk,
    /// Emit these chunks, then hang forever.
    StallAfter(Vec<StreamChunk>),
    /// Fail the connect itself.
    FailConnect,
}

/// Streaming backend scripted per call: call `n` gets `behaviors[n]`
/// (repeating the last behavior once the script runs out).
struct ScriptedStreamBackend {
    behaviors: Vec<StreamBehavior>,
    calls: AtomicU32,
}

impl ScriptedStreamBackend {
    fn new(behaviors: Vec<StreamBehavior>) -> Arc<Self> {
        Arc::new(Self {
            behaviors,
            calls: AtomicU32::new(0),
        })
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for ScriptedStreamBackend {
    fn kind(&self) -> &str {
        "scripted-stream"
    }

    async fn generate(&self, _request: BackendRequest) -> maestro_agent::Result<ModelTurn> {
        Err(AgentError::Internal("streaming-only backend".into()))
    }

    async fn open_stream(&self, _request: BackendRequest) -> maestro_agent::Result<ChunkStream> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let behavior = self
            .behaviors
            .get(call)
            .or_else(|| self.behaviors.last())
            .cloned()
            .expect("behavior script must not be empty");

        match behavior {
            StreamBehavior::Chunks(chunks) => {
                Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
            }
            StreamBehavior::NeverFirstChunk => Ok(Box::pin(futures::stream::pending())),
            StreamBehavior::StallAfter(chunks) => Ok(Box::pin(
                futures::stream::iter(chunks.into_iter().map(Ok))
                    .chain(futures::stream::pending()),
            )),
            StreamBehavior::FailConnect => Err(AgentError::Provider {
                provider: "scripted-stream".into(),
                reason: "connection refused".into(),
            }),
        }
    }
}

/// One-shot backend that counts calls and fails or answers.
struct OneShotBackend {
    fail: bool,
    answer: String,
    calls: AtomicU32,
}

impl OneShotBackend {
    fn ok(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            answer: answer.into(),
            calls: AtomicU32::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            answer: String::new(),
            calls: AtomicU32::new(0),
        })
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for OneShotBackend {
    fn kind(&self) -> &str {
        "one-shot"
    }

    async fn generate(&self, _request: BackendRequest) -> maestro_agent::Result<ModelTurn> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AgentError::Provider {
                provider: "one-shot".into(),
                reason: "simulated outage".into(),
            });
        }
        Ok(ModelTurn {
            parts: vec![Content::Text {
                text: self.answer.clone(),
            }],
            provider: None,
            finish_reason: Some(FinishReason::Stop),
            usage: Usage::default(),
        })
    }

    async fn open_stream(&self, _request: BackendRequest) -> maestro_agent::Result<ChunkStream> {
        Err(AgentError::Internal("one-shot backend".into()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Fast timeouts so stall tests finish in tens of milliseconds.
fn fast_config() -> GatewayConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    GatewayConfig {
        stream_start_timeout_ms: 60,
        inter_chunk_timeout_ms: 120,
    }
}

fn request(providers: &[&str]) -> GatewayRequest {
    let mut req = GatewayRequest::new(vec![Message::user("hello")], CancellationToken::new());
    req.providers = providers.iter().map(|s| (*s).to_owned()).collect();
    req
}

fn text_chunks(text: &str) -> Vec<StreamChunk> {
    vec![
        StreamChunk::TextStart { id: "t0".into() },
        StreamChunk::TextDelta {
            id: "t0".into(),
            text: text.into(),
        },
        StreamChunk::TextEnd { id: "t0".into() },
        StreamChunk::Finish {
            reason: FinishReason::Stop,
            usage: Usage::default(),
        },
    ]
}

async fn collect(mut stream: ChunkStream) -> Vec<maestro_agent::Result<StreamChunk>> {
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item);
    }
    items
}

// ═══════════════════════════════════════════════════════════════════════
//  Non-streaming failover
// ═══════════════════════════════════════════════════════════════════════

/// With the first K providers failing, the call succeeds on provider K+1,
/// reports that provider's name, and never touches providers beyond it.
#[tokio::test]
async fn failover_stops_at_first_success() {
    let p1 = OneShotBackend::failing();
    let p2 = OneShotBackend::failing();
    let p3 = OneShotBackend::ok("from p3");
    let p4 = OneShotBackend::ok("never used");

    let gateway = ModelGateway::new(fast_config())
        .with_provider(ProviderConfig::new("p1", p1.clone(), "m"))
        .with_provider(ProviderConfig::new("p2", p2.clone(), "m"))
        .with_provider(ProviderConfig::new("p3", p3.clone(), "m"))
        .with_provider(ProviderConfig::new("default", p4.clone(), "m"));

    let turn = gateway
        .generate(request(&["p1", "p2", "p3"]))
        .await
        .unwrap();

    assert_eq!(turn.provider.as_deref(), Some("p3"));
    assert_eq!(turn.text(), "from p3");
    assert_eq!(p1.call_count(), 1);
    assert_eq!(p2.call_count(), 1);
    assert_eq!(p3.call_count(), 1);
    assert_eq!(p4.call_count(), 0, "providers beyond the success are never tried");
}

/// Exhausting the doubled attempt list surfaces the last failure.
#[tokio::test]
async fn exhausted_attempts_fail_with_last_error() {
    let backend = OneShotBackend::failing();
    let gateway = ModelGateway::new(fast_config())
        .with_provider(ProviderConfig::new("default", backend.clone(), "m"));

    let err = gateway.generate(request(&[])).await.unwrap_err();
    assert!(matches!(err, AgentError::Provider { .. }));
    // One provider in the doubled list = exactly two attempts.
    assert_eq!(backend.call_count(), 2);
}

// ═══════════════════════════════════════════════════════════════════════
//  Streaming guards
// ═══════════════════════════════════════════════════════════════════════

/// A stream that connects but never emits a first chunk must fail over, not
/// hang.
#[tokio::test]
async fn first_chunk_stall_fails_over_to_next_provider() {
    let slow = ScriptedStreamBackend::new(vec![StreamBehavior::NeverFirstChunk]);
    let healthy = ScriptedStreamBackend::new(vec![StreamBehavior::Chunks(text_chunks("rescued"))]);

    let gateway = ModelGateway::new(fast_config())
        .with_provider(ProviderConfig::new("slow", slow.clone(), "m"))
        .with_provider(ProviderConfig::new("default", healthy.clone(), "m"));

    let stream = tokio::time::timeout(
        Duration::from_secs(2),
        gateway.open_stream(request(&["slow"])),
    )
    .await
    .expect("failover must not hang")
    .unwrap();

    assert_eq!(stream.provider, "default");
    assert_eq!(slow.call_count(), 1);

    // The first chunk read by the guard is re-emitted at the head.
    let items = collect(stream.chunks).await;
    assert!(matches!(
        items.first(),
        Some(Ok(StreamChunk::TextStart { .. }))
    ));
    let text: String = items
        .iter()
        .filter_map(|item| match item {
            Ok(StreamChunk::TextDelta { text, .. }) => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "rescued");
}

/// A connect that itself hangs is bounded by the connect guard.
#[tokio::test]
async fn connect_failure_fails_over() {
    let broken = ScriptedStreamBackend::new(vec![StreamBehavior::FailConnect]);
    let healthy = ScriptedStreamBackend::new(vec![StreamBehavior::Chunks(text_chunks("ok"))]);

    let gateway = ModelGateway::new(fast_config())
        .with_provider(ProviderConfig::new("broken", broken, "m"))
        .with_provider(ProviderConfig::new("default", healthy, "m"));

    let stream = gateway.open_stream(request(&["broken"])).await.unwrap();
    assert_eq!(stream.provider, "default");
}

/// A first chunk of kind Error is a failed attempt, not a delivered stream.
#[tokio::test]
async fn error_first_chunk_is_a_failed_attempt() {
    let erroring = ScriptedStreamBackend::new(vec![StreamBehavior::Chunks(vec![
        StreamChunk::Error {
            message: "quota exhausted".into(),
        },
    ])]);
    let healthy = ScriptedStreamBackend::new(vec![StreamBehavior::Chunks(text_chunks("ok"))]);

    let gateway = ModelGateway::new(fast_config())
        .with_provider(ProviderConfig::new("quota", erroring, "m"))
        .with_provider(ProviderConfig::new("default", healthy, "m"));

    let stream = gateway.open_stream(request(&["quota"])).await.unwrap();
    assert_eq!(stream.provider, "default");
}

/// A stream that stalls after its first chunks surfaces an inter-chunk
/// stall error in the feed.
#[tokio::test]
async fn inter_chunk_stall_aborts_the_stream() {
    let stalling = ScriptedStreamBackend::new(vec![StreamBehavior::StallAfter(vec![
        StreamChunk::TextStart { id: "t0".into() },
        StreamChunk::TextDelta {
            id: "t0".into(),
            text: "partial".into(),
        },
    ])]);

    let gateway = ModelGateway::new(fast_config())
        .with_provider(ProviderConfig::new("default", stalling, "m"));

    let stream = gateway.open_stream(request(&[])).await.unwrap();
    let items = tokio::time::timeout(Duration::from_secs(2), collect(stream.chunks))
        .await
        .expect("stall must be bounded");

    // TextStart (re-emitted first chunk), TextDelta, then the stall error.
    assert_eq!(items.len(), 3);
    assert!(matches!(items[0], Ok(StreamChunk::TextStart { .. })));
    assert!(matches!(items[1], Ok(StreamChunk::TextDelta { .. })));
    assert!(matches!(
        items[2],
        Err(AgentError::StreamStall {
            phase: StallPhase::InterChunk,
            ..
        })
    ));
}

/// Cancelling before the call rejects immediately with no attempts.
#[tokio::test]
async fn cancelled_request_is_rejected_without_attempts() {
    let backend = OneShotBackend::ok("unused");
    let gateway = ModelGateway::new(fast_config())
        .with_provider(ProviderConfig::new("default", backend.clone(), "m"));

    let mut req = request(&[]);
    req.cancel.cancel();

    let err = gateway.generate(req).await.unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(backend.call_count(), 0);
}

// ═══════════════════════════════════════════════════════════════════════
//  Streaming ReAct engine
// ═══════════════════════════════════════════════════════════════════════

struct SearchTool {
    queries: Arc<std::sync::Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }
    fn description(&self) -> &str {
        "Searches the web"
    }
    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        })
    }
    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &TaskContext,
        _call: &ToolCallMeta,
    ) -> maestro_agent::Result<ToolOutcome> {
        let query = args["query"].as_str().unwrap_or_default().to_owned();
        self.queries.lock().unwrap().push(query.clone());
        Ok(ToolOutcome::text(format!("results for {query}")))
    }
}

fn task_context() -> TaskContext {
    let workflow = Workflow::new("integration", "test run");
    let registry = TaskRegistry::new();
    let handle = registry.register(workflow.task_id, "integration").unwrap();
    TaskContext::new(workflow, handle, EventBus::new(64), RuntimeConfig::default())
}

/// Drive the full streaming path: chunk feed in, tool executed with parsed
/// arguments, results appended, final text out.  The tool-input fragments
/// for `"c1"` arrive before the terminal ToolCall, so this also checks the
/// reconciliation contract end to end.
#[tokio::test]
async fn streaming_react_loop_reconciles_and_executes_tools() {
    let first_turn = vec![
        StreamChunk::ToolInputStart {
            id: "c1".into(),
            name: "search".into(),
        },
        StreamChunk::ToolInputDelta {
            id: "c1".into(),
            fragment: "{\"query\":\"rust".into(),
        },
        StreamChunk::TextStart { id: "t0".into() },
        StreamChunk::TextDelta {
            id: "t0".into(),
            text: "Let me look that up.".into(),
        },
        StreamChunk::ToolCall {
            id: "c1".into(),
            name: "search".into(),
            arguments: serde_json::json!({"query": "rust streams"}),
        },
        StreamChunk::Finish {
            reason: FinishReason::ToolUse,
            usage: Usage {
                input_tokens: 5,
                output_tokens: 9,
            },
        },
    ];

    let backend = ScriptedStreamBackend::new(vec![
        StreamBehavior::Chunks(first_turn),
        StreamBehavior::Chunks(text_chunks("rust streams are pull-based")),
    ]);

    let gateway = Arc::new(
        ModelGateway::new(fast_config())
            .with_provider(ProviderConfig::new("default", backend.clone(), "m")),
    );

    let queries = Arc::new(std::sync::Mutex::new(Vec::new()));
    let tools = ToolRegistry::new()
        .with(Arc::new(SearchTool {
            queries: queries.clone(),
        }))
        .unwrap();

    let runner = ReactRunner::new(gateway, Arc::new(tools), ReactConfig::default());
    let ctx = task_context();
    let mut chain = AgentChain::new("a1", "Searcher", "find info");

    let outcome = runner
        .run(
            &ctx,
            "a1",
            vec![Message::user("what are rust streams?")],
            &mut chain,
        )
        .await
        .unwrap();

    assert_eq!(outcome.final_turn.text(), "rust streams are pull-based");
    assert_eq!(outcome.turns_used, 2);
    assert_eq!(backend.call_count(), 2);

    // Exactly one execution, with the fully parsed final arguments.
    assert_eq!(queries.lock().unwrap().as_slice(), ["rust streams"]);

    // The assistant message for turn 1 carries exactly one record for c1.
    let assistant = &outcome.messages[1];
    let tool_uses: Vec<_> = assistant
        .content
        .iter()
        .filter(|c| matches!(c, Content::ToolUse { .. }))
        .collect();
    assert_eq!(tool_uses.len(), 1);

    // Usage from the Finish chunk flowed into the chain.
    assert_eq!(chain.usage.output_tokens, 9);
    assert_eq!(chain.tool_calls.len(), 1);
    assert!(chain.tool_calls[0].outcome.is_some());
}

/// An inter-chunk stall inside a turn is a transport failure: the engine
/// retries the whole turn and the doubled attempt list lets the same
/// provider recover.
#[tokio::test]
async fn mid_turn_stall_is_retried_to_success() {
    let backend = ScriptedStreamBackend::new(vec![
        StreamBehavior::StallAfter(vec![StreamChunk::TextStart { id: "t0".into() }]),
        StreamBehavior::Chunks(text_chunks("recovered")),
    ]);

    let gateway = Arc::new(
        ModelGateway::new(fast_config())
            .with_provider(ProviderConfig::new("default", backend.clone(), "m")),
    );

    let config = ReactConfig {
        backoff_base_ms: 1,
        ..ReactConfig::default()
    };
    let runner = ReactRunner::new(gateway, Arc::new(ToolRegistry::new()), config);
    let ctx = task_context();
    let mut chain = AgentChain::new("a1", "A", "t");

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        runner.run(&ctx, "a1", vec![Message::user("go")], &mut chain),
    )
    .await
    .expect("retry must be bounded")
    .unwrap();

    assert_eq!(outcome.final_turn.text(), "recovered");
}
