//! The reasoning/acting loop driver.
//!
//! One [`ReactRunner`] drives one agent: call the gateway, reconstruct the
//! turn, execute requested tools, append results, and repeat until the
//! continuation policy says stop.  Turn-level resilience lives here — a
//! transport failure or a finish-hook retry directive redoes the whole turn
//! with quadratic backoff, and consecutive tool failures are counted against
//! a ceiling that aborts the agent.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use crate::config::ReactConfig;
use crate::context::{AgentChain, TaskContext, ToolChain};
use crate::error::{AgentError, Result};
use crate::llm::gateway::{GatewayRequest, ModelGateway};
use crate::llm::types::{
    Content, FinishReason, GenerationParams, Message, ModelTurn, StreamChunk, ToolChoice, Usage,
};
use crate::react::reassembly::TurnReassembler;
use crate::tools::{ToolCallMeta, ToolOutcome, ToolRegistry};

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// What the finish hook wants done with a completed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishDirective {
    /// Accept the turn.
    Done,
    /// Discard the turn and redo it (refusal/soft-failure detection).
    Retry,
}

/// Observes every chunk as it streams in.
pub type ChunkHook = Arc<dyn Fn(&StreamChunk) + Send + Sync>;

/// Invoked with the failure and the retry count before each turn retry.
pub type ErrorHook = Arc<dyn Fn(&AgentError, u32) + Send + Sync>;

/// Inspects a completed turn and may demand a redo.
pub type FinishHook = Arc<dyn Fn(&FinishReason, &ModelTurn) -> FinishDirective + Send + Sync>;

/// Decides whether the loop runs another turn.
#[async_trait]
pub trait ContinuationPolicy: Send + Sync {
    /// `turns` counts completed turns; `last_turn` is the turn just
    /// appended.
    async fn should_continue(&self, turns: u32, last_turn: &ModelTurn) -> bool;
}

/// Optional hook bundle; every absent hook selects the documented default.
#[derive(Clone, Default)]
pub struct ReactHooks {
    pub on_chunk: Option<ChunkHook>,
    pub on_error: Option<ErrorHook>,
    pub on_finish: Option<FinishHook>,
    pub continuation: Option<Arc<dyn ContinuationPolicy>>,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// The outcome of one agent's full reasoning loop.
#[derive(Debug)]
pub struct ReactOutcome {
    /// The final turn (no tool calls, or the policy stopped the loop).
    pub final_turn: ModelTurn,
    /// The conversation as it stood when the loop ended.
    pub messages: Vec<Message>,
    /// Completed turns.
    pub turns_used: u32,
    /// Token usage across all turns.
    pub usage: Usage,
}

/// Drives the think–act–observe loop for one agent.
pub struct ReactRunner {
    gateway: Arc<ModelGateway>,
    tools: Arc<ToolRegistry>,
    providers: Vec<String>,
    params: GenerationParams,
    hooks: ReactHooks,
    config: ReactConfig,
    streaming: bool,
}

impl ReactRunner {
    /// Create a runner over a gateway and tool set.
    pub fn new(gateway: Arc<ModelGateway>, tools: Arc<ToolRegistry>, config: ReactConfig) -> Self {
        Self {
            gateway,
            tools,
            providers: Vec::new(),
            params: GenerationParams::default(),
            hooks: ReactHooks::default(),
            config,
            streaming: true,
        }
    }

    /// Builder: preferred provider order for this agent.
    pub fn with_providers(mut self, providers: Vec<String>) -> Self {
        self.providers = providers;
        self
    }

    /// Builder: sampling parameters.
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Builder: hook bundle.
    pub fn with_hooks(mut self, hooks: ReactHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Builder: use one-shot gateway calls instead of streaming.
    pub fn non_streaming(mut self) -> Self {
        self.streaming = false;
        self
    }

    // -----------------------------------------------------------------------
    // Loop driver
    // -----------------------------------------------------------------------

    /// Run the full loop.
    ///
    /// Appends turn parts and tool results to the conversation after every
    /// turn and consults the continuation policy.  Default policy: continue
    /// while the latest turn contains at least one tool call and fewer than
    /// `max_turns` turns have elapsed.  Tool invocations are recorded on
    /// `chain` as they settle.
    pub async fn run(
        &self,
        ctx: &TaskContext,
        agent_id: &str,
        mut messages: Vec<Message>,
        chain: &mut AgentChain,
    ) -> Result<ReactOutcome> {
        let mut consecutive_errors = 0u32;
        let mut usage = Usage::default();
        let mut turns = 0u32;

        loop {
            ctx.checkpoint()?;
            let turn = self.run_turn_with_retries(ctx, &messages).await?;
            turns += 1;
            usage.add(turn.usage);
            chain.usage.add(turn.usage);

            tracing::debug!(
                agent = %agent_id,
                turn = turns,
                tool_calls = turn.tool_uses().len(),
                provider = turn.provider.as_deref().unwrap_or("?"),
                "turn complete"
            );

            messages.push(turn.to_message());

            if turn.has_tool_calls() {
                let results = self
                    .execute_tools(ctx, agent_id, &turn, chain, &mut consecutive_errors)
                    .await?;
                messages.push(Message::tool_results(results));
            }

            let proceed = match &self.hooks.continuation {
                Some(policy) => policy.should_continue(turns, &turn).await,
                None => turn.has_tool_calls() && turns < self.config.max_turns,
            };

            if !proceed {
                return Ok(ReactOutcome {
                    final_turn: turn,
                    messages,
                    turns_used: turns,
                    usage,
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Single turn with retries
    // -----------------------------------------------------------------------

    /// Run one turn, redoing it on transport failure or a finish-hook retry
    /// directive, waiting `base * (n + 1)^2` ms before retry `n + 1`.
    async fn run_turn_with_retries(
        &self,
        ctx: &TaskContext,
        messages: &[Message],
    ) -> Result<ModelTurn> {
        let mut retries = 0u32;

        loop {
            ctx.checkpoint()?;

            match self.run_single_turn(ctx, messages).await {
                Ok(turn) => {
                    let directive = match (&self.hooks.on_finish, &turn.finish_reason) {
                        (Some(hook), Some(reason)) => hook(reason, &turn),
                        _ => FinishDirective::Done,
                    };

                    match directive {
                        FinishDirective::Done => return Ok(turn),
                        FinishDirective::Retry => {
                            if retries >= self.config.max_turn_retries {
                                return Err(AgentError::TurnRetriesExhausted {
                                    attempts: retries + 1,
                                    reason: "finish hook kept requesting retries".into(),
                                });
                            }
                            tracing::debug!(retries, "finish hook requested turn redo");
                            self.backoff(ctx, retries).await?;
                            retries += 1;
                        }
                    }
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    if retries >= self.config.max_turn_retries {
                        return Err(e);
                    }
                    if let Some(hook) = &self.hooks.on_error {
                        hook(&e, retries);
                    }
                    tracing::warn!(error = %e, retries, "turn failed; retrying");
                    self.backoff(ctx, retries).await?;
                    retries += 1;
                }
            }
        }
    }

    /// Quadratic backoff that unwinds immediately on cancellation.
    async fn backoff(&self, ctx: &TaskContext, retries: u32) -> Result<()> {
        let delay = self.config.backoff_delay(retries);
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// One gateway call: streaming reconstruction or one-shot.
    async fn run_single_turn(&self, ctx: &TaskContext, messages: &[Message]) -> Result<ModelTurn> {
        let request = GatewayRequest {
            providers: self.providers.clone(),
            messages: messages.to_vec(),
            tools: self.tools.definitions(),
            tool_choice: ToolChoice::Auto,
            params: self.params.clone(),
            cancel: ctx.cancel.clone(),
        };

        if !self.streaming {
            return self.gateway.generate(request).await;
        }

        let stream = self.gateway.open_stream(request).await?;
        let provider = stream.provider;
        let mut chunks = stream.chunks;
        let mut reassembler = TurnReassembler::new(provider.as_str());

        while let Some(item) = chunks.next().await {
            let chunk = item?;
            if let Some(hook) = &self.hooks.on_chunk {
                hook(&chunk);
            }
            reassembler.apply(chunk)?;
            if reassembler.is_finished() {
                break;
            }
        }

        let mut turn = reassembler.finalize()?;
        turn.provider = Some(provider);
        Ok(turn)
    }

    // -----------------------------------------------------------------------
    // Tool execution
    // -----------------------------------------------------------------------

    /// Execute the turn's tool calls and convert outcomes into tool-result
    /// content blocks.
    ///
    /// A batch in which every tool is parallel-safe runs concurrently, with
    /// results reassembled into emission order; any other batch runs
    /// strictly in emission order.  Error-flagged outcomes count toward the
    /// consecutive-error ceiling; a success resets it.
    async fn execute_tools(
        &self,
        ctx: &TaskContext,
        agent_id: &str,
        turn: &ModelTurn,
        chain: &mut AgentChain,
        consecutive_errors: &mut u32,
    ) -> Result<Vec<Content>> {
        let calls: Vec<(String, String, serde_json::Value)> = turn
            .tool_uses()
            .into_iter()
            .map(|(id, name, input)| (id.to_owned(), name.to_owned(), input.clone()))
            .collect();

        let all_parallel_safe = calls.len() > 1
            && calls
                .iter()
                .all(|(_, name, _)| self.tools.is_parallel_safe(name));

        let settled: Vec<(ToolChain, ToolOutcome)> = if all_parallel_safe {
            // join_all resolves in input order regardless of completion
            // order, which is exactly the reassembly the contract requires.
            let futures: Vec<_> = calls
                .iter()
                .map(|(id, name, args)| self.execute_one(ctx, agent_id, id, name, args.clone()))
                .collect();
            futures::future::join_all(futures)
                .await
                .into_iter()
                .collect::<Result<Vec<_>>>()?
        } else {
            let mut settled = Vec::with_capacity(calls.len());
            for (id, name, args) in &calls {
                settled.push(self.execute_one(ctx, agent_id, id, name, args.clone()).await?);
            }
            settled
        };

        let mut results = Vec::with_capacity(settled.len());
        for ((record, outcome), (id, name, _)) in settled.into_iter().zip(&calls) {
            if outcome.is_error {
                *consecutive_errors += 1;
                if *consecutive_errors >= self.config.tool_error_ceiling {
                    chain.tool_calls.push(record);
                    return Err(AgentError::ToolErrorCeiling {
                        agent_id: agent_id.to_owned(),
                        count: *consecutive_errors,
                    });
                }
            } else {
                *consecutive_errors = 0;
            }

            results.push(Content::ToolResult {
                tool_call_id: id.clone(),
                tool_name: name.clone(),
                output: outcome.to_value(),
                is_error: outcome.is_error,
            });
            chain.tool_calls.push(record);
        }

        Ok(results)
    }

    /// Execute one call: record created before execution, updated exactly
    /// once with its outcome, lifecycle event published before returning.
    async fn execute_one(
        &self,
        ctx: &TaskContext,
        agent_id: &str,
        call_id: &str,
        name: &str,
        args: serde_json::Value,
    ) -> Result<(ToolChain, ToolOutcome)> {
        let mut record = ToolChain::new(call_id, name, args.clone());
        let meta = ToolCallMeta {
            call_id: call_id.to_owned(),
            agent_id: agent_id.to_owned(),
        };

        let outcome = match self.tools.execute(name, args, ctx, &meta).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancellation() => return Err(e),
            // Unknown tool and other engine-level failures become
            // error-flagged results the model can react to.
            Err(e) => ToolOutcome::error(e.to_string()),
        };

        record.record_outcome(outcome.to_value(), outcome.is_error);

        let _ = ctx.bus().publish(maestro_kernel::TaskEvent::ToolCompleted {
            task_id: ctx.task_id,
            agent_id: agent_id.to_owned(),
            call_id: call_id.to_owned(),
            tool_name: name.to_owned(),
            is_error: outcome.is_error,
            timestamp: chrono::Utc::now(),
        });

        Ok((record, outcome))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::llm::backend::{BackendRequest, ModelBackend};
    use crate::llm::provider::ProviderConfig;
    use crate::llm::types::ChunkStream;
    use crate::tools::Tool;
    use crate::workflow::Workflow;
    use maestro_kernel::{EventBus, TaskRegistry};
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that replays scripted turns, one per generate call.
    struct ScriptedBackend {
        turns: Vec<ModelTurn>,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(turns: Vec<ModelTurn>) -> Arc<Self> {
            Arc::new(Self {
                turns,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        fn kind(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _request: BackendRequest) -> Result<ModelTurn> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.turns
                .get(call)
                .cloned()
                .ok_or_else(|| AgentError::Internal("script exhausted".into()))
        }

        async fn open_stream(&self, _request: BackendRequest) -> Result<ChunkStream> {
            Err(AgentError::Internal("scripted backend is one-shot".into()))
        }
    }

    struct CountingTool {
        executions: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "probe"
        }
        fn description(&self) -> &str {
            "Counts executions"
        }
        fn schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            _args: Value,
            _ctx: &TaskContext,
            _call: &ToolCallMeta,
        ) -> Result<ToolOutcome> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Ok(ToolOutcome::error("probe failed"))
            } else {
                Ok(ToolOutcome::text("probed"))
            }
        }
    }

    fn text_turn(text: &str) -> ModelTurn {
        ModelTurn {
            parts: vec![Content::Text { text: text.into() }],
            provider: None,
            finish_reason: Some(FinishReason::Stop),
            usage: Usage::default(),
        }
    }

    fn tool_turn(call_id: &str) -> ModelTurn {
        ModelTurn {
            parts: vec![Content::ToolUse {
                id: call_id.into(),
                name: "probe".into(),
                input: serde_json::json!({}),
            }],
            provider: None,
            finish_reason: Some(FinishReason::ToolUse),
            usage: Usage::default(),
        }
    }

    fn context() -> TaskContext {
        let workflow = Workflow::new("t", "t");
        let registry = TaskRegistry::new();
        let handle = registry.register(workflow.task_id, "t").unwrap();
        TaskContext::new(workflow, handle, EventBus::new(64), RuntimeConfig::default())
    }

    fn runner_for(
        backend: Arc<dyn ModelBackend>,
        tools: ToolRegistry,
        config: ReactConfig,
    ) -> ReactRunner {
        let gateway = Arc::new(
            ModelGateway::new(crate::config::GatewayConfig::default())
                .with_provider(ProviderConfig::new("default", backend, "test-model")),
        );
        ReactRunner::new(gateway, Arc::new(tools), config).non_streaming()
    }

    #[tokio::test]
    async fn loop_runs_tools_then_stops_on_text() {
        let executions = Arc::new(AtomicU32::new(0));
        let tools = ToolRegistry::new()
            .with(Arc::new(CountingTool {
                executions: executions.clone(),
                fail: false,
            }))
            .unwrap();

        let backend = ScriptedBackend::new(vec![tool_turn("c1"), text_turn("all done")]);
        let runner = runner_for(backend, tools, ReactConfig::default());

        let ctx = context();
        let mut chain = AgentChain::new("a1", "Probe", "probe things");
        let outcome = runner
            .run(&ctx, "a1", vec![Message::user("go")], &mut chain)
            .await
            .unwrap();

        assert_eq!(outcome.final_turn.text(), "all done");
        assert_eq!(outcome.turns_used, 2);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        // Conversation: user, assistant(tool), tool results, assistant(text).
        assert_eq!(outcome.messages.len(), 4);
        assert_eq!(chain.tool_calls.len(), 1);
        assert!(chain.tool_calls[0].outcome.is_some());
    }

    #[tokio::test]
    async fn consecutive_tool_failures_abort_the_agent() {
        let executions = Arc::new(AtomicU32::new(0));
        let tools = ToolRegistry::new()
            .with(Arc::new(CountingTool {
                executions: executions.clone(),
                fail: true,
            }))
            .unwrap();

        // Enough scripted tool turns to exceed the ceiling.
        let turns: Vec<ModelTurn> = (0..5).map(|i| tool_turn(&format!("c{i}"))).collect();
        let config = ReactConfig {
            tool_error_ceiling: 3,
            max_turns: 20,
            ..ReactConfig::default()
        };
        let runner = runner_for(ScriptedBackend::new(turns), tools, config);

        let ctx = context();
        let mut chain = AgentChain::new("a1", "Probe", "probe things");
        let err = runner
            .run(&ctx, "a1", vec![Message::user("go")], &mut chain)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AgentError::ToolErrorCeiling { count: 3, .. }
        ));
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn a_success_resets_the_error_counter() {
        struct AlternatingTool {
            executions: Arc<AtomicU32>,
        }

        #[async_trait]
        impl Tool for AlternatingTool {
            fn name(&self) -> &str {
                "probe"
            }
            fn description(&self) -> &str {
                "Fails, then succeeds, repeatedly"
            }
            fn schema(&self) -> Value {
                serde_json::json!({"type": "object"})
            }
            async fn execute(
                &self,
                _args: Value,
                _ctx: &TaskContext,
                _call: &ToolCallMeta,
            ) -> Result<ToolOutcome> {
                let n = self.executions.fetch_add(1, Ordering::SeqCst);
                if n % 2 == 0 {
                    Ok(ToolOutcome::error("flaky"))
                } else {
                    Ok(ToolOutcome::text("ok"))
                }
            }
        }

        let executions = Arc::new(AtomicU32::new(0));
        let tools = ToolRegistry::new()
            .with(Arc::new(AlternatingTool {
                executions: executions.clone(),
            }))
            .unwrap();

        // 6 tool turns alternating error/success never hits a ceiling of 2.
        let mut turns: Vec<ModelTurn> = (0..6).map(|i| tool_turn(&format!("c{i}"))).collect();
        turns.push(text_turn("survived"));

        let config = ReactConfig {
            tool_error_ceiling: 2,
            max_turns: 20,
            ..ReactConfig::default()
        };
        let runner = runner_for(ScriptedBackend::new(turns), tools, config);

        let ctx = context();
        let mut chain = AgentChain::new("a1", "Probe", "probe");
        let outcome = runner
            .run(&ctx, "a1", vec![Message::user("go")], &mut chain)
            .await
            .unwrap();
        assert_eq!(outcome.final_turn.text(), "survived");
    }

    #[tokio::test]
    async fn transport_failure_retries_then_succeeds() {
        struct FailOnceBackend {
            calls: AtomicU32,
        }

        #[async_trait]
        impl ModelBackend for FailOnceBackend {
            fn kind(&self) -> &str {
                "fail-once"
            }
            async fn generate(&self, _request: BackendRequest) -> Result<ModelTurn> {
                if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    // Both doubled attempts fail so the whole turn fails and
                    // the engine's retry path kicks in.
                    Err(AgentError::Provider {
                        provider: "fail-once".into(),
                        reason: "transient".into(),
                    })
                } else {
                    Ok(text_turn("recovered"))
                }
            }
            async fn open_stream(&self, _request: BackendRequest) -> Result<ChunkStream> {
                Err(AgentError::Internal("one-shot only".into()))
            }
        }

        let errors_seen = Arc::new(AtomicU32::new(0));
        let hook_errors = errors_seen.clone();
        let hooks = ReactHooks {
            on_error: Some(Arc::new(move |_e, _n| {
                hook_errors.fetch_add(1, Ordering::SeqCst);
            })),
            ..ReactHooks::default()
        };

        let config = ReactConfig {
            backoff_base_ms: 1,
            ..ReactConfig::default()
        };
        let runner = runner_for(
            Arc::new(FailOnceBackend {
                calls: AtomicU32::new(0),
            }),
            ToolRegistry::new(),
            config,
        )
        .with_hooks(hooks);

        let ctx = context();
        let mut chain = AgentChain::new("a1", "A", "t");
        let outcome = runner
            .run(&ctx, "a1", vec![Message::user("go")], &mut chain)
            .await
            .unwrap();
        assert_eq!(outcome.final_turn.text(), "recovered");
        assert_eq!(errors_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finish_hook_retry_redoes_the_turn() {
        let backend = ScriptedBackend::new(vec![text_turn("I cannot help"), text_turn("real answer")]);

        let hooks = ReactHooks {
            on_finish: Some(Arc::new(|_reason, turn| {
                if turn.text().starts_with("I cannot") {
                    FinishDirective::Retry
                } else {
                    FinishDirective::Done
                }
            })),
            ..ReactHooks::default()
        };

        let config = ReactConfig {
            backoff_base_ms: 1,
            ..ReactConfig::default()
        };
        let runner = runner_for(backend, ToolRegistry::new(), config).with_hooks(hooks);

        let ctx = context();
        let mut chain = AgentChain::new("a1", "A", "t");
        let outcome = runner
            .run(&ctx, "a1", vec![Message::user("go")], &mut chain)
            .await
            .unwrap();
        assert_eq!(outcome.final_turn.text(), "real answer");
    }

    #[tokio::test]
    async fn custom_continuation_policy_stops_early() {
        struct OneTurnOnly;

        #[async_trait]
        impl ContinuationPolicy for OneTurnOnly {
            async fn should_continue(&self, _turns: u32, _last: &ModelTurn) -> bool {
                false
            }
        }

        let executions = Arc::new(AtomicU32::new(0));
        let tools = ToolRegistry::new()
            .with(Arc::new(CountingTool {
                executions: executions.clone(),
                fail: false,
            }))
            .unwrap();

        let backend = ScriptedBackend::new(vec![tool_turn("c1"), text_turn("never reached")]);
        let hooks = ReactHooks {
            continuation: Some(Arc::new(OneTurnOnly)),
            ..ReactHooks::default()
        };
        let runner = runner_for(backend, tools, ReactConfig::default()).with_hooks(hooks);

        let ctx = context();
        let mut chain = AgentChain::new("a1", "A", "t");
        let outcome = runner
            .run(&ctx, "a1", vec![Message::user("go")], &mut chain)
            .await
            .unwrap();

        // The tool still executed for the first turn, but no second turn ran.
        assert_eq!(outcome.turns_used, 1);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }
}
