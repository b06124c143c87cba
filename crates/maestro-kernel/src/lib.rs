//! Maestro kernel services.
//!
//! This crate provides the process-wide services the agent runtime builds on:
//!
//! - **[`registry`]** -- Explicitly owned registry of live workflow runs
//!   backed by [`dashmap::DashMap`], with insert-on-create /
//!   remove-on-delete-or-abort semantics and an external cancel/pause
//!   control surface.
//! - **[`bus`]** -- Lifecycle event bus backed by [`tokio::sync::broadcast`]
//!   carrying agent start / tool completion / agent result-or-error /
//!   workflow end notifications.
//! - **[`control`]** -- Run-control primitives: the shared
//!   [`control::CancellationToken`] and the cooperative [`control::PauseGate`].
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod bus;
pub mod control;
pub mod error;
pub mod registry;

// Re-export the most commonly used types at the crate root for convenience.
pub use bus::{EventBus, TaskEvent};
pub use control::{CancellationToken, PauseGate};
pub use error::{KernelError, Result};
pub use registry::{TaskHandle, TaskInfo, TaskRegistry};
