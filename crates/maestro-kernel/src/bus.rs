//! Lifecycle event bus.
//!
//! A lightweight publish/subscribe channel built on [`tokio::sync::broadcast`]
//! that carries the runtime's lifecycle notifications: agent start, per-tool
//! completion, agent result-or-error, and workflow end.  Observers (servers,
//! UIs, telemetry sinks) subscribe and filter; publishing is ordered and
//! fire-and-forget, so the scheduler never blocks on a slow observer.
//!
//! Events are wrapped in [`Arc`] so that broadcasting to multiple subscribers
//! does not require cloning the payload.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use maestro_kernel::bus::{EventBus, TaskEvent};
//! # use uuid::Uuid;
//! # async fn example() {
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(TaskEvent::WorkflowFinished {
//!     task_id: Uuid::now_v7(),
//!     stop_reason: "done".into(),
//!     timestamp: chrono::Utc::now(),
//! }).unwrap();
//!
//! let event = rx.recv().await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A lifecycle event published during a workflow run.
///
/// Every variant carries enough context for subscribers to filter and
/// dispatch without parsing opaque blobs.  Ordering is guaranteed per
/// publisher: the runtime publishes start events immediately before a
/// transition and result events immediately after, ahead of its next
/// suspension point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEvent {
    /// An agent is about to transition `Init -> Running`.
    AgentStarted {
        /// The workflow run this agent belongs to.
        task_id: Uuid,
        /// The plan-assigned agent id.
        agent_id: String,
        /// Human-readable agent name.
        agent_name: String,
        timestamp: DateTime<Utc>,
    },

    /// A single tool invocation finished (success or error-flagged result).
    ToolCompleted {
        task_id: Uuid,
        agent_id: String,
        /// The model-assigned tool call id.
        call_id: String,
        /// The tool that was invoked.
        tool_name: String,
        /// Whether the result was error-flagged.
        is_error: bool,
        timestamp: DateTime<Utc>,
    },

    /// An agent finished in `Done` status.
    AgentFinished {
        task_id: Uuid,
        agent_id: String,
        /// The agent's final text result.
        result: String,
        timestamp: DateTime<Utc>,
    },

    /// An agent finished in `Error` status; the run aborts after this event.
    AgentFailed {
        task_id: Uuid,
        agent_id: String,
        /// Human-readable failure description.
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The whole workflow run ended.
    WorkflowFinished {
        task_id: Uuid,
        /// Terminal stop reason (`"done"`, `"error"`, `"abort"`).
        stop_reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl TaskEvent {
    /// The task this event belongs to.
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::AgentStarted { task_id, .. }
            | Self::ToolCompleted { task_id, .. }
            | Self::AgentFinished { task_id, .. }
            | Self::AgentFailed { task_id, .. }
            | Self::WorkflowFinished { task_id, .. } => *task_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Publish/subscribe lifecycle bus backed by [`tokio::sync::broadcast`].
///
/// The bus is cheaply cloneable (`Arc`-backed) and `Send + Sync`.
/// Subscribers receive [`Arc<TaskEvent>`] references, avoiding
/// per-subscriber cloning of the payload.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    sender: broadcast::Sender<Arc<TaskEvent>>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// A subscriber that falls behind by more than `capacity` events receives
    /// a [`broadcast::error::RecvError::Lagged`] telling it how many events
    /// it missed.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner { sender }),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of receivers that will observe this event.  If
    /// there are no active subscribers the event is silently dropped; runs
    /// without observers are common and not an error.
    pub fn publish(&self, event: TaskEvent) -> Result<usize> {
        let event = Arc::new(event);
        match self.inner.sender.send(event) {
            Ok(n) => {
                tracing::trace!(receivers = n, "lifecycle event published");
                Ok(n)
            }
            Err(_) => {
                tracing::trace!("lifecycle event published with no active receivers");
                Ok(0)
            }
        }
    }

    /// Create a new subscriber that will receive all future events.
    ///
    /// Events published *before* this call are **not** replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TaskEvent>> {
        self.inner.sender.subscribe()
    }

    /// Return the current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
