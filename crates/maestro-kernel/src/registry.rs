//! Live task registry.
//!
//! The registry is the single, explicitly owned map of every workflow run
//! alive in this process.  Runs are inserted when created and removed when
//! they are deleted or aborted; nothing else holds ambient global state.
//! Holding a task's entry gives external callers (servers, UIs, supervisors)
//! the control surface for that run: its shared [`CancellationToken`] and its
//! [`PauseGate`].
//!
//! Internally the registry is backed by [`DashMap`] which provides lock-free
//! concurrent reads and fine-grained write locking, making it safe to share
//! across tasks without a global `RwLock`.
//!
//! # Example
//!
//! ```rust
//! # use maestro_kernel::registry::TaskRegistry;
//! # use uuid::Uuid;
//! let registry = TaskRegistry::new();
//! let task_id = Uuid::now_v7();
//! let handle = registry.register(task_id, "research run").unwrap();
//!
//! registry.cancel(task_id).unwrap();
//! assert!(handle.cancel.is_cancelled());
//! assert!(registry.get(task_id).is_err()); // abort removes the entry
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::control::{CancellationToken, PauseGate};
use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// The control surface for one live run.
///
/// Cheaply cloneable; both fields are `Arc`-backed.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    /// Cancellation token shared by the entire task tree.
    pub cancel: CancellationToken,
    /// Cooperative pause gate checked at scheduler checkpoints.
    pub pause: PauseGate,
}

/// Snapshot metadata about a registered run.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// Unique task identifier.
    pub task_id: Uuid,
    /// Human-readable run name.
    pub name: String,
    /// When the run was registered.
    pub registered_at: DateTime<Utc>,
}

struct TaskEntry {
    info: TaskInfo,
    handle: TaskHandle,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent registry of live workflow runs backed by [`DashMap`].
///
/// The registry is cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<DashMap<Uuid, TaskEntry>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Register a new run and return its control handle.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::TaskAlreadyRegistered`] if the id is in use;
    /// ids are expected to be unique for the life of the process.
    pub fn register(&self, task_id: Uuid, name: impl Into<String>) -> Result<TaskHandle> {
        let name = name.into();
        let handle = TaskHandle {
            cancel: CancellationToken::new(),
            pause: PauseGate::new(),
        };

        let entry = TaskEntry {
            info: TaskInfo {
                task_id,
                name: name.clone(),
                registered_at: Utc::now(),
            },
            handle: handle.clone(),
        };

        use dashmap::mapref::entry::Entry;
        match self.inner.entry(task_id) {
            Entry::Occupied(_) => Err(KernelError::TaskAlreadyRegistered { task_id }),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                tracing::info!(task_id = %task_id, task = %name, "task registered");
                Ok(handle)
            }
        }
    }

    /// Remove a run from the registry (normal completion or deletion).
    ///
    /// Returns the removed [`TaskInfo`] if it existed.
    pub fn remove(&self, task_id: Uuid) -> Option<TaskInfo> {
        let removed = self.inner.remove(&task_id).map(|(_, entry)| entry.info);
        if removed.is_some() {
            tracing::info!(task_id = %task_id, "task removed from registry");
        }
        removed
    }

    /// Retrieve a snapshot of a run's metadata.
    pub fn get(&self, task_id: Uuid) -> Result<TaskInfo> {
        self.inner
            .get(&task_id)
            .map(|entry| entry.info.clone())
            .ok_or(KernelError::TaskNotFound { task_id })
    }

    /// Retrieve a run's control handle.
    pub fn handle(&self, task_id: Uuid) -> Result<TaskHandle> {
        self.inner
            .get(&task_id)
            .map(|entry| entry.handle.clone())
            .ok_or(KernelError::TaskNotFound { task_id })
    }

    /// Cancel a run and remove it from the registry.
    ///
    /// Cancellation is terminal: the token unwinds every pending suspension
    /// in the task tree, so the entry is dropped in the same call
    /// (remove-on-abort).
    pub fn cancel(&self, task_id: Uuid) -> Result<TaskInfo> {
        let (_, entry) = self
            .inner
            .remove(&task_id)
            .ok_or(KernelError::TaskNotFound { task_id })?;
        entry.handle.cancel.cancel();
        tracing::info!(task_id = %task_id, "task cancelled and removed");
        Ok(entry.info)
    }

    /// Pause a run at its next checkpoint.
    ///
    /// `abort_current` asks the run to abort the step in flight instead of
    /// letting it finish.
    pub fn pause(&self, task_id: Uuid, abort_current: bool) -> Result<()> {
        let entry = self
            .inner
            .get(&task_id)
            .ok_or(KernelError::TaskNotFound { task_id })?;
        entry.handle.pause.pause(abort_current);
        Ok(())
    }

    /// Resume a paused run.
    pub fn resume(&self, task_id: Uuid) -> Result<()> {
        let entry = self
            .inner
            .get(&task_id)
            .ok_or(KernelError::TaskNotFound { task_id })?;
        entry.handle.pause.resume();
        Ok(())
    }

    /// Snapshot metadata for every live run.
    pub fn list(&self) -> Vec<TaskInfo> {
        self.inner.iter().map(|entry| entry.info.clone()).collect()
    }

    /// Number of live runs.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
