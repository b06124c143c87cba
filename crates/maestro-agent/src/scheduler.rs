//! Workflow scheduler.
//!
//! Walks a plan of dependency-ordered agents: groups runnable agents into
//! normal or parallel steps, delegates each step to the agents' own ReAct
//! runners, merges results into shared task state in declaration order, and
//! handles mid-run replanning, modification, pause, and cancellation.
//!
//! Control flow is strictly sequential outside a parallel step: one step at
//! a time, with pause and cancellation checkpoints at the top of every
//! iteration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use maestro_kernel::TaskEvent;

use crate::context::{AgentChain, TaskContext};
use crate::error::{AgentError, Result};
use crate::llm::gateway::ModelGateway;
use crate::llm::types::{GenerationParams, Message};
use crate::react::{ReactHooks, ReactRunner};
use crate::tools::ToolRegistry;
use crate::workflow::{AgentStatus, WorkflowAgent};

// ---------------------------------------------------------------------------
// Agent definitions
// ---------------------------------------------------------------------------

/// Everything needed to run one named agent: its tool set, provider
/// preference, and prompt scaffolding.  The plan references definitions by
/// name; a plan naming an unregistered agent is a fatal plan error.
#[derive(Clone)]
pub struct AgentDefinition {
    /// Name the plan references.
    pub name: String,
    /// System prompt; a generic one is derived when absent.
    pub system_prompt: Option<String>,
    /// The agent's own tool set.
    pub tools: Arc<ToolRegistry>,
    /// Preferred provider order for this agent's gateway calls.
    pub providers: Vec<String>,
    /// Sampling parameters for this agent.
    pub params: GenerationParams,
}

impl AgentDefinition {
    /// A definition with an empty tool set and default parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: None,
            tools: Arc::new(ToolRegistry::new()),
            providers: Vec::new(),
            params: GenerationParams::default(),
        }
    }

    /// Builder: set the system prompt.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Builder: set the tool registry.
    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    /// Builder: set the provider preference order.
    pub fn providers(mut self, providers: Vec<String>) -> Self {
        self.providers = providers;
        self
    }

    /// Builder: set sampling parameters.
    pub fn params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }
}

// ---------------------------------------------------------------------------
// Replanner
// ---------------------------------------------------------------------------

/// External replanning interface (deep mode).
///
/// The scheduler only consumes the decision and the regenerated agents; how
/// the plan is produced (heuristics, an LLM call) is the implementer's
/// business.
#[async_trait]
pub trait Replanner: Send + Sync {
    /// Whether the remaining plan should be regenerated, judged from the
    /// just-completed agent's context.
    async fn should_replan(&self, ctx: &TaskContext, finished: &WorkflowAgent) -> bool;

    /// Produce replacement agents for the remaining plan.
    async fn replan(&self, ctx: &TaskContext) -> Result<Vec<WorkflowAgent>>;
}

// ---------------------------------------------------------------------------
// Steps and outcomes
// ---------------------------------------------------------------------------

/// One unit of the derived execution plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Run one agent.
    Normal(String),
    /// Run a group of agents, merging results in declaration order.
    Parallel(Vec<String>),
}

impl Step {
    fn agent_ids(&self) -> Vec<&str> {
        match self {
            Self::Normal(id) => vec![id.as_str()],
            Self::Parallel(ids) => ids.iter().map(String::as_str).collect(),
        }
    }
}

/// Terminal stop reason for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The plan ran to completion.
    Done,
    /// An agent ended in error.
    Error,
    /// Local recovery was exhausted (consecutive tool-error ceiling).
    Abort,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Done => "done",
            Self::Error => "error",
            Self::Abort => "abort",
        };
        write!(f, "{s}")
    }
}

/// Structured result of a workflow run.
///
/// Callers never need to catch errors to learn the outcome; the one
/// exception is cancellation, which propagates as
/// [`AgentError::Cancelled`].
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    /// Whether the run completed successfully.
    pub success: bool,
    /// Terminal stop reason.
    pub stop_reason: StopReason,
    /// The last step's aggregated result (empty on failure).
    pub result: String,
    /// The terminating error, when not successful.
    pub error: Option<String>,
}

/// Result of one agent's execution phase, before merging.
struct AgentRun {
    agent_id: String,
    chain: AgentChain,
    text: String,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Drives whole workflows.
pub struct WorkflowRunner {
    gateway: Arc<ModelGateway>,
    agents: HashMap<String, AgentDefinition>,
    replanner: Option<Arc<dyn Replanner>>,
    hooks: ReactHooks,
    /// Per-run override of the parallel-execution default.
    parallel_override: Option<bool>,
    streaming: bool,
}

impl WorkflowRunner {
    /// Create a runner over a shared gateway.
    pub fn new(gateway: Arc<ModelGateway>) -> Self {
        Self {
            gateway,
            agents: HashMap::new(),
            replanner: None,
            hooks: ReactHooks::default(),
            parallel_override: None,
            streaming: true,
        }
    }

    /// Builder: register an agent definition under its name.
    pub fn with_agent(mut self, definition: AgentDefinition) -> Self {
        self.agents.insert(definition.name.clone(), definition);
        self
    }

    /// Builder: set the replanner consulted in deep mode.
    pub fn with_replanner(mut self, replanner: Arc<dyn Replanner>) -> Self {
        self.replanner = Some(replanner);
        self
    }

    /// Builder: hooks applied to every agent's ReAct runner.
    pub fn with_hooks(mut self, hooks: ReactHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Builder: override the configured parallel-execution default for this
    /// run.
    pub fn parallel(mut self, concurrent: bool) -> Self {
        self.parallel_override = Some(concurrent);
        self
    }

    /// Builder: use one-shot gateway calls instead of streaming.
    pub fn non_streaming(mut self) -> Self {
        self.streaming = false;
        self
    }

    // -----------------------------------------------------------------------
    // Entry point
    // -----------------------------------------------------------------------

    /// Run the workflow in `ctx` to completion.
    ///
    /// Always returns a structured [`WorkflowOutcome`]; only cancellation
    /// escapes as an error.
    pub async fn run(&self, ctx: &TaskContext) -> Result<WorkflowOutcome> {
        let outcome = match self.run_steps(ctx).await {
            Ok(result) => WorkflowOutcome {
                success: true,
                stop_reason: StopReason::Done,
                result,
                error: None,
            },
            Err(e) if e.is_cancellation() => {
                let _ = ctx.bus().publish(TaskEvent::WorkflowFinished {
                    task_id: ctx.task_id,
                    stop_reason: StopReason::Abort.to_string(),
                    timestamp: Utc::now(),
                });
                return Err(e);
            }
            Err(e) => {
                let stop_reason = match &e {
                    AgentError::ToolErrorCeiling { .. } => StopReason::Abort,
                    _ => StopReason::Error,
                };
                WorkflowOutcome {
                    success: false,
                    stop_reason,
                    result: String::new(),
                    error: Some(e.to_string()),
                }
            }
        };

        let _ = ctx.bus().publish(TaskEvent::WorkflowFinished {
            task_id: ctx.task_id,
            stop_reason: outcome.stop_reason.to_string(),
            timestamp: Utc::now(),
        });

        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Step walk
    // -----------------------------------------------------------------------

    async fn run_steps(&self, ctx: &TaskContext) -> Result<String> {
        self.validate_plan(ctx)?;

        let mut steps = self.derive_steps(ctx)?;
        let mut cursor = 0usize;
        let mut last_result = String::new();

        loop {
            // Pause checkpoint: park here when paused without abort.
            ctx.pause.wait_resumed().await;
            ctx.checkpoint()?;

            let Some(step) = steps.get(cursor).cloned() else {
                break;
            };

            tracing::debug!(task_id = %ctx.task_id, ?step, cursor, "running step");

            // Race the step against an abort-immediate pause: dropping the
            // step future unwinds it at its next suspension point.
            let step_result = tokio::select! {
                result = self.run_step(ctx, &step) => Some(result),
                _ = ctx.pause.wait_abort_requested() => None,
            };

            match step_result {
                Some(result) => last_result = result?,
                None => {
                    // Aborted mid-step: the interrupted agents go back to
                    // Init so the post-resume rebuild re-runs them.
                    {
                        let mut workflow = ctx.workflow.lock().expect("workflow poisoned");
                        for id in step.agent_ids() {
                            if workflow.agent_by_id(id).map(|a| a.status)
                                == Some(AgentStatus::Running)
                            {
                                workflow.set_status(id, AgentStatus::Init);
                            }
                        }
                    }
                    tracing::info!(task_id = %ctx.task_id, "step aborted by pause");
                    ctx.pause.wait_resumed().await;
                    ctx.checkpoint()?;
                    steps = self.derive_steps(ctx)?;
                    cursor = 0;
                    continue;
                }
            }

            cursor += 1;

            // Externally modified plan: rebuild from agents still in Init
            // and restart stepping there.
            let modified = {
                let workflow = ctx.workflow.lock().expect("workflow poisoned");
                workflow.is_modified()
            };
            if modified {
                tracing::info!(task_id = %ctx.task_id, "plan modified; rebuilding steps");
                ctx.workflow
                    .lock()
                    .expect("workflow poisoned")
                    .clear_modified();
                steps = self.derive_steps(ctx)?;
                cursor = 0;
                continue;
            }

            // Deep mode: consult the replanner while steps remain.
            if ctx.config().scheduler.deep_mode && cursor < steps.len() {
                if let Some(replanner) = &self.replanner {
                    let finished = {
                        let workflow = ctx.workflow.lock().expect("workflow poisoned");
                        step.agent_ids()
                            .last()
                            .and_then(|id| workflow.agent_by_id(id))
                            .cloned()
                    };

                    let wants_replan = match &finished {
                        Some(finished) => replanner.should_replan(ctx, finished).await,
                        None => false,
                    };

                    if wants_replan {
                        tracing::info!(task_id = %ctx.task_id, "replanner requested regeneration");
                        let regenerated = replanner.replan(ctx).await?;
                        {
                            let mut workflow = ctx.workflow.lock().expect("workflow poisoned");
                            workflow.agents.retain(|a| a.status != AgentStatus::Init);
                            workflow.agents.extend(regenerated);
                            workflow.clear_modified();
                        }
                        self.validate_plan(ctx)?;
                        steps = self.derive_steps(ctx)?;
                        cursor = 0;
                    }
                }
            }
        }

        Ok(last_result)
    }

    /// Every agent name must have a definition and every dependency id must
    /// reference a plan agent.
    fn validate_plan(&self, ctx: &TaskContext) -> Result<()> {
        let workflow = ctx.workflow.lock().expect("workflow poisoned");
        let known_ids: HashSet<&str> = workflow.agents.iter().map(|a| a.id.as_str()).collect();

        for agent in &workflow.agents {
            if !self.agents.contains_key(&agent.name) {
                return Err(AgentError::PlanError {
                    task_id: ctx.task_id,
                    reason: format!("no agent definition registered for `{}`", agent.name),
                });
            }
            for dep in &agent.depends_on {
                if !known_ids.contains(dep.as_str()) {
                    return Err(AgentError::PlanError {
                        task_id: ctx.task_id,
                        reason: format!("agent `{}` depends on unknown id `{dep}`", agent.id),
                    });
                }
            }
        }
        Ok(())
    }

    fn derive_steps(&self, ctx: &TaskContext) -> Result<Vec<Step>> {
        let (init, done) = {
            let workflow = ctx.workflow.lock().expect("workflow poisoned");
            (workflow.init_agents(), workflow.done_ids())
        };
        build_steps(&init, &done).map_err(|reason| AgentError::PlanError {
            task_id: ctx.task_id,
            reason,
        })
    }

    // -----------------------------------------------------------------------
    // Step execution
    // -----------------------------------------------------------------------

    async fn run_step(&self, ctx: &TaskContext, step: &Step) -> Result<String> {
        match step {
            Step::Normal(id) => {
                let agent = self.snapshot_agent(ctx, id)?;
                self.begin_agent(ctx, &agent);
                let run = self.execute_agent(ctx, &agent).await;
                let mut results = Vec::with_capacity(1);
                self.merge_agent(ctx, &agent, run, &mut results)?;
                Ok(results.pop().unwrap_or_default())
            }
            Step::Parallel(ids) => self.run_parallel_step(ctx, ids).await,
        }
    }

    /// Run a parallel step's members concurrently or in declared order, then
    /// merge into shared state in declaration order regardless of completion
    /// order.
    async fn run_parallel_step(&self, ctx: &TaskContext, ids: &[String]) -> Result<String> {
        let agents: Vec<WorkflowAgent> = ids
            .iter()
            .map(|id| self.snapshot_agent(ctx, id))
            .collect::<Result<_>>()?;

        for agent in &agents {
            self.begin_agent(ctx, agent);
        }

        let concurrent = self
            .parallel_override
            .unwrap_or(ctx.config().scheduler.parallel_default);

        let runs: Vec<Result<AgentRun>> = if concurrent {
            // Each member works in its own isolated execution context;
            // join_all keeps declaration order in the output.
            let futures: Vec<_> = agents
                .iter()
                .map(|agent| self.execute_agent(ctx, agent))
                .collect();
            futures::future::join_all(futures).await
        } else {
            let mut runs = Vec::with_capacity(agents.len());
            for agent in &agents {
                runs.push(self.execute_agent(ctx, agent).await);
            }
            runs
        };

        // Single merge step: this is the only writer to shared state.
        let mut results = Vec::with_capacity(agents.len());
        for (agent, run) in agents.iter().zip(runs) {
            self.merge_agent(ctx, agent, run, &mut results)?;
        }

        Ok(results.join("\n\n"))
    }

    fn snapshot_agent(&self, ctx: &TaskContext, id: &str) -> Result<WorkflowAgent> {
        let workflow = ctx.workflow.lock().expect("workflow poisoned");
        workflow
            .agent_by_id(id)
            .cloned()
            .ok_or_else(|| AgentError::PlanError {
                task_id: ctx.task_id,
                reason: format!("step references unknown agent id `{id}`"),
            })
    }

    /// Publish the start event, then transition `Init -> Running`.
    fn begin_agent(&self, ctx: &TaskContext, agent: &WorkflowAgent) {
        let _ = ctx.bus().publish(TaskEvent::AgentStarted {
            task_id: ctx.task_id,
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            timestamp: Utc::now(),
        });
        ctx.workflow
            .lock()
            .expect("workflow poisoned")
            .set_status(&agent.id, AgentStatus::Running);
        tracing::info!(task_id = %ctx.task_id, agent = %agent.name, agent_id = %agent.id, "agent started");
    }

    /// Execution phase: everything here works on per-agent state only.
    async fn execute_agent(&self, ctx: &TaskContext, agent: &WorkflowAgent) -> Result<AgentRun> {
        let definition = self
            .agents
            .get(&agent.name)
            .ok_or_else(|| AgentError::PlanError {
                task_id: ctx.task_id,
                reason: format!("no agent definition registered for `{}`", agent.name),
            })?;

        let messages = self.build_messages(ctx, definition, agent);
        let mut chain = AgentChain::new(agent.id.clone(), agent.name.clone(), agent.task.clone());

        let mut runner = ReactRunner::new(
            self.gateway.clone(),
            definition.tools.clone(),
            ctx.config().react.clone(),
        )
        .with_providers(definition.providers.clone())
        .with_params(definition.params.clone())
        .with_hooks(self.hooks.clone());
        if !self.streaming {
            runner = runner.non_streaming();
        }

        let outcome = runner.run(ctx, &agent.id, messages, &mut chain).await?;
        let text = outcome.final_turn.text();
        chain.result = Some(text.clone());

        Ok(AgentRun {
            agent_id: agent.id.clone(),
            chain,
            text,
        })
    }

    /// Merge phase: the single writer to shared state.  Publishes the
    /// result-or-error event immediately after the status transition; an
    /// agent ending in error aborts the run after the notification.
    fn merge_agent(
        &self,
        ctx: &TaskContext,
        agent: &WorkflowAgent,
        run: Result<AgentRun>,
        results: &mut Vec<String>,
    ) -> Result<()> {
        match run {
            Ok(run) => {
                ctx.record_chain(run.chain);
                ctx.set_variable(
                    run.agent_id.clone(),
                    serde_json::Value::String(run.text.clone()),
                );
                ctx.workflow
                    .lock()
                    .expect("workflow poisoned")
                    .set_status(&agent.id, AgentStatus::Done);

                let _ = ctx.bus().publish(TaskEvent::AgentFinished {
                    task_id: ctx.task_id,
                    agent_id: agent.id.clone(),
                    result: run.text.clone(),
                    timestamp: Utc::now(),
                });
                tracing::info!(task_id = %ctx.task_id, agent_id = %agent.id, "agent finished");

                results.push(run.text);
                Ok(())
            }
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                ctx.workflow
                    .lock()
                    .expect("workflow poisoned")
                    .set_status(&agent.id, AgentStatus::Error);

                let _ = ctx.bus().publish(TaskEvent::AgentFailed {
                    task_id: ctx.task_id,
                    agent_id: agent.id.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                tracing::warn!(task_id = %ctx.task_id, agent_id = %agent.id, error = %e, "agent failed");

                // Keep the ceiling error as-is (it already names the agent
                // and maps to the abort stop reason); wrap everything else.
                match e {
                    AgentError::ToolErrorCeiling { .. } => Err(e),
                    other => Err(AgentError::AgentFailed {
                        agent_id: agent.id.clone(),
                        reason: other.to_string(),
                    }),
                }
            }
        }
    }

    /// Build the agent's initial conversation from its task, work nodes, and
    /// the results of agents that already ran.
    fn build_messages(
        &self,
        ctx: &TaskContext,
        definition: &AgentDefinition,
        agent: &WorkflowAgent,
    ) -> Vec<Message> {
        let system = definition.system_prompt.clone().unwrap_or_else(|| {
            format!(
                "You are {}, an autonomous agent. Complete the task you are \
                 given, using tools where they help, and reply with your final \
                 result.",
                agent.name
            )
        });

        let mut task = agent.task.clone();
        if !agent.nodes.is_empty() {
            task.push_str("\n\nWork through these steps:");
            for (i, node) in agent.nodes.iter().enumerate() {
                task.push_str(&format!("\n{}. {}", i + 1, node.text));
            }
        }

        let prior = ctx.prior_results();
        if !prior.is_empty() {
            task.push_str("\n\nResults from agents that already ran:");
            for (name, result) in prior {
                task.push_str(&format!("\n[{name}]\n{result}"));
            }
        }

        vec![Message::system(system), Message::user(task)]
    }
}

// ---------------------------------------------------------------------------
// Step derivation
// ---------------------------------------------------------------------------

/// Group `Init` agents into a step sequence by dependency satisfaction.
///
/// Within each runnable wave, non-parallel agents become individual steps in
/// declaration order and parallel-marked agents form one parallel step (a
/// lone parallel agent degrades to a normal step).  An unsatisfiable
/// dependency is an error string for the caller to wrap.
fn build_steps(
    init: &[WorkflowAgent],
    done: &HashSet<String>,
) -> std::result::Result<Vec<Step>, String> {
    let mut remaining: Vec<&WorkflowAgent> = init.iter().collect();
    let mut satisfied: HashSet<String> = done.clone();
    let mut steps: Vec<Step> = Vec::new();

    while !remaining.is_empty() {
        let (wave, rest): (Vec<&WorkflowAgent>, Vec<&WorkflowAgent>) = remaining
            .into_iter()
            .partition(|agent| agent.depends_on.iter().all(|dep| satisfied.contains(dep)));

        if wave.is_empty() {
            let stuck: Vec<&str> = rest.iter().map(|a| a.id.as_str()).collect();
            return Err(format!(
                "unsatisfiable dependencies (cycle or missing agents): {}",
                stuck.join(", ")
            ));
        }

        let mut parallel_members: Vec<String> = Vec::new();
        for agent in &wave {
            if agent.parallel {
                parallel_members.push(agent.id.clone());
            } else {
                steps.push(Step::Normal(agent.id.clone()));
            }
        }
        match parallel_members.len() {
            0 => {}
            1 => steps.push(Step::Normal(parallel_members.remove(0))),
            _ => steps.push(Step::Parallel(parallel_members)),
        }

        satisfied.extend(wave.iter().map(|a| a.id.clone()));
        remaining = rest;
    }

    Ok(steps)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
