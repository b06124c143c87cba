//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every public API in this crate.  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.

use uuid::Uuid;

/// Unified error type for the maestro kernel services.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Registry errors ----------------------------------------------------
    /// The referenced task does not exist in the registry.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The [`Uuid`] that was looked up.
        task_id: Uuid,
    },

    /// A task with this id is already registered.
    #[error("task already registered: {task_id}")]
    TaskAlreadyRegistered { task_id: Uuid },

    // -- Bus errors ---------------------------------------------------------
    /// Publishing an event to the lifecycle bus failed.
    #[error("bus publish failed: {reason}")]
    BusPublishFailed { reason: String },

    // -- Control errors -----------------------------------------------------
    /// The task is not in a state that permits the requested control action.
    #[error("invalid control transition for {task_id}: {reason}")]
    InvalidControlState { task_id: Uuid, reason: String },
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
