//! Per-task shared state.
//!
//! A [`TaskContext`] is owned by exactly one workflow run.  It carries the
//! variable store, the append-only execution history, the workflow being
//! executed, and the run's control handles (cancellation token, pause gate,
//! lifecycle bus).  Mutation discipline follows the arena model: only the
//! currently active step writes here; concurrently running parallel agents
//! work in isolated per-agent state and merge in a single step afterwards,
//! so no lock is ever held across a suspension point.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use maestro_kernel::{CancellationToken, EventBus, PauseGate, TaskHandle};

use crate::config::RuntimeConfig;
use crate::error::{AgentError, Result};
use crate::llm::types::Usage;
use crate::workflow::Workflow;

// ---------------------------------------------------------------------------
// Execution history
// ---------------------------------------------------------------------------

/// Outcome of one tool invocation, recorded exactly once.
#[derive(Debug, Clone)]
pub struct ToolOutcomeRecord {
    /// Result payload fed back to the model.
    pub output: Value,
    /// Whether the invocation was error-flagged.
    pub is_error: bool,
}

/// Append-only record of one tool invocation.
///
/// Created before the tool executes; [`ToolChain::record_outcome`] is called
/// exactly once when the invocation settles.
#[derive(Debug, Clone)]
pub struct ToolChain {
    /// The model-assigned call id.
    pub call_id: String,
    /// The tool that was invoked.
    pub tool_name: String,
    /// The arguments the tool was invoked with.
    pub params: Value,
    /// The settled outcome, if any yet.
    pub outcome: Option<ToolOutcomeRecord>,
    /// When the invocation was created.
    pub created_at: DateTime<Utc>,
}

impl ToolChain {
    /// Create a record for an invocation about to execute.
    pub fn new(call_id: impl Into<String>, tool_name: impl Into<String>, params: Value) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            params,
            outcome: None,
            created_at: Utc::now(),
        }
    }

    /// Record the invocation's outcome.  A second call is a bug in the
    /// caller; it is logged and ignored rather than clobbering history.
    pub fn record_outcome(&mut self, output: Value, is_error: bool) {
        if self.outcome.is_some() {
            tracing::warn!(call_id = %self.call_id, "tool outcome recorded twice; keeping first");
            return;
        }
        self.outcome = Some(ToolOutcomeRecord { output, is_error });
    }
}

/// Append-only record of one agent run within a task.
#[derive(Debug, Clone)]
pub struct AgentChain {
    /// The plan-assigned agent id.
    pub agent_id: String,
    /// Human-readable agent name.
    pub agent_name: String,
    /// The task prompt the agent was given.
    pub request: String,
    /// Tool invocations in execution order.
    pub tool_calls: Vec<ToolChain>,
    /// The agent's final text result, once finished.
    pub result: Option<String>,
    /// Token usage across the agent's turns.
    pub usage: Usage,
    /// When the agent started.
    pub started_at: DateTime<Utc>,
}

impl AgentChain {
    /// Start a chain record for an agent about to run.
    pub fn new(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        request: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            request: request.into(),
            tool_calls: Vec::new(),
            result: None,
            usage: Usage::default(),
            started_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Task context
// ---------------------------------------------------------------------------

/// Shared state for one workflow run.
pub struct TaskContext {
    /// Unique task identifier.
    pub task_id: Uuid,
    /// The workflow under execution.  Tools that mutate the plan (nested
    /// delegation) lock this and must set the modified flag.
    pub workflow: Mutex<Workflow>,
    /// Cancellation token shared by the entire task tree.
    pub cancel: CancellationToken,
    /// Cooperative pause gate checked at scheduler checkpoints.
    pub pause: PauseGate,
    variables: DashMap<String, Value>,
    history: Mutex<Vec<AgentChain>>,
    bus: EventBus,
    config: RuntimeConfig,
}

impl TaskContext {
    /// Create the context for one run.
    pub fn new(workflow: Workflow, handle: TaskHandle, bus: EventBus, config: RuntimeConfig) -> Self {
        Self {
            task_id: workflow.task_id,
            workflow: Mutex::new(workflow),
            cancel: handle.cancel,
            pause: handle.pause,
            variables: DashMap::new(),
            history: Mutex::new(Vec::new()),
            bus,
            config,
        }
    }

    /// The lifecycle bus for this run.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The runtime configuration for this run.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Fail fast if the run has been cancelled.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    // -- variable store -----------------------------------------------------

    /// Set a variable (unique keys, last write wins).
    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    /// Read a variable.
    pub fn variable(&self, key: &str) -> Option<Value> {
        self.variables.get(key).map(|entry| entry.value().clone())
    }

    /// Snapshot of all variables.
    pub fn variables(&self) -> Vec<(String, Value)> {
        self.variables
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    // -- execution history --------------------------------------------------

    /// Merge a completed agent chain into the shared history.
    pub fn record_chain(&self, chain: AgentChain) {
        self.history.lock().expect("history poisoned").push(chain);
    }

    /// Snapshot of the execution history.
    pub fn chains(&self) -> Vec<AgentChain> {
        self.history.lock().expect("history poisoned").clone()
    }

    /// Results of all finished agents, in completion order, for feeding
    /// prior work into downstream prompts.
    pub fn prior_results(&self) -> Vec<(String, String)> {
        self.history
            .lock()
            .expect("history poisoned")
            .iter()
            .filter_map(|chain| {
                chain
                    .result
                    .as_ref()
                    .map(|r| (chain.agent_name.clone(), r.clone()))
            })
            .collect()
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("variables", &self.variables.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Workflow;
    use maestro_kernel::TaskRegistry;

    fn context() -> TaskContext {
        let workflow = Workflow::new("test", "because");
        let registry = TaskRegistry::new();
        let handle = registry.register(workflow.task_id, "test").unwrap();
        TaskContext::new(workflow, handle, EventBus::new(16), RuntimeConfig::default())
    }

    #[test]
    fn variables_are_last_write_wins() {
        let ctx = context();
        ctx.set_variable("k", serde_json::json!(1));
        ctx.set_variable("k", serde_json::json!(2));
        assert_eq!(ctx.variable("k"), Some(serde_json::json!(2)));
        assert_eq!(ctx.variables().len(), 1);
    }

    #[test]
    fn tool_chain_outcome_is_recorded_once() {
        let mut chain = ToolChain::new("c1", "search", serde_json::json!({"q": "rust"}));
        assert!(chain.outcome.is_none());

        chain.record_outcome(serde_json::json!("first"), false);
        chain.record_outcome(serde_json::json!("second"), true);

        let outcome = chain.outcome.unwrap();
        assert_eq!(outcome.output, serde_json::json!("first"));
        assert!(!outcome.is_error);
    }

    #[test]
    fn prior_results_skip_unfinished_agents() {
        let ctx = context();
        let mut done = AgentChain::new("a1", "Search", "find things");
        done.result = Some("found".into());
        ctx.record_chain(done);
        ctx.record_chain(AgentChain::new("a2", "Summarize", "summarize"));

        let results = ctx.prior_results();
        assert_eq!(results, vec![("Search".to_owned(), "found".to_owned())]);
    }

    #[test]
    fn checkpoint_reflects_cancellation() {
        let ctx = context();
        assert!(ctx.checkpoint().is_ok());
        ctx.cancel.cancel();
        assert!(ctx.checkpoint().unwrap_err().is_cancellation());
    }
}
