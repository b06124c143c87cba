//! Workflow and agent plan types.
//!
//! A [`Workflow`] is the planner's output: an ordered list of
//! [`WorkflowAgent`]s with dependency edges and optional parallel markers.
//! The scheduler reads it, mutates only per-agent `status`, and consults the
//! `modified` flag to know when a nested delegation rewrote the plan mid-run.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Agent status
// ---------------------------------------------------------------------------

/// Lifecycle status of one agent in the plan.
///
/// Status is the only field mutated during execution, and the sole signal
/// used to decide what remains runnable after a replan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Not yet scheduled.
    Init,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Done,
    /// Finished with an error; the run aborts.
    Error,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// One work item within an agent's task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkNode {
    /// Description folded into the agent's prompt.
    pub text: String,
}

/// One agent in the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowAgent {
    /// Plan-assigned id, referenced by `depends_on` edges.
    pub id: String,
    /// Agent name; must match a registered agent definition.
    pub name: String,
    /// Task description given to the agent.
    pub task: String,
    /// Ids of agents that must be `Done` before this one may run.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Ordered work items.
    #[serde(default)]
    pub nodes: Vec<WorkNode>,
    /// Whether this agent may share a parallel step with others.
    #[serde(default)]
    pub parallel: bool,
    /// Execution status.
    #[serde(default = "init_status")]
    pub status: AgentStatus,
}

fn init_status() -> AgentStatus {
    AgentStatus::Init
}

impl WorkflowAgent {
    /// Create an agent in `Init` status.
    pub fn new(id: impl Into<String>, name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            task: task.into(),
            depends_on: Vec::new(),
            nodes: Vec::new(),
            parallel: false,
            status: AgentStatus::Init,
        }
    }

    /// Builder: add a dependency edge.
    pub fn depends_on(mut self, agent_id: impl Into<String>) -> Self {
        self.depends_on.push(agent_id.into());
        self
    }

    /// Builder: add a work node.
    pub fn node(mut self, text: impl Into<String>) -> Self {
        self.nodes.push(WorkNode { text: text.into() });
        self
    }

    /// Builder: mark the agent parallel.
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A declarative plan of cooperating agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique task identifier.
    pub task_id: Uuid,
    /// Workflow name.
    pub name: String,
    /// The planner's rationale.
    pub thought: String,
    /// Ordered agents.
    pub agents: Vec<WorkflowAgent>,
    /// Set when a nested delegation mutated the plan mid-run; the scheduler
    /// rebuilds its step list from `Init` agents and clears it.
    #[serde(default)]
    modified: bool,
}

impl Workflow {
    /// Create an empty workflow with a fresh task id.
    pub fn new(name: impl Into<String>, thought: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            name: name.into(),
            thought: thought.into(),
            agents: Vec::new(),
            modified: false,
        }
    }

    /// Builder: append an agent.
    pub fn agent(mut self, agent: WorkflowAgent) -> Self {
        self.agents.push(agent);
        self
    }

    /// Append an agent to an existing workflow (plan mutation); callers must
    /// also [`mark_modified`](Self::mark_modified).
    pub fn push_agent(&mut self, agent: WorkflowAgent) {
        self.agents.push(agent);
    }

    /// Flag the plan as externally modified.
    pub fn mark_modified(&mut self) {
        self.modified = true;
    }

    /// Clear the modified flag (scheduler, after rebuilding its steps).
    pub fn clear_modified(&mut self) {
        self.modified = false;
    }

    /// Whether the plan was modified since the last rebuild.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Look up an agent by id.
    pub fn agent_by_id(&self, id: &str) -> Option<&WorkflowAgent> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Set an agent's status.  Unknown ids are ignored with a warning; the
    /// scheduler validates ids before running.
    pub fn set_status(&mut self, id: &str, status: AgentStatus) {
        match self.agents.iter_mut().find(|a| a.id == id) {
            Some(agent) => agent.status = status,
            None => tracing::warn!(agent_id = %id, "status update for unknown agent"),
        }
    }

    /// Ids of all `Done` agents.
    pub fn done_ids(&self) -> HashSet<String> {
        self.agents
            .iter()
            .filter(|a| a.status == AgentStatus::Done)
            .map(|a| a.id.clone())
            .collect()
    }

    /// Agents still in `Init` status (the runnable set after a replan).
    pub fn init_agents(&self) -> Vec<WorkflowAgent> {
        self.agents
            .iter()
            .filter(|a| a.status == AgentStatus::Init)
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
