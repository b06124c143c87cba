//! Run-control primitives.
//!
//! Cancellation and pause are deliberately separate mechanisms:
//!
//! - **Cancellation** is terminal.  One [`CancellationToken`] is shared by an
//!   entire task tree; cancelling it unwinds every pending suspension and the
//!   run never resumes.
//! - **Pause** is cooperative and reversible.  A [`PauseGate`] is checked at
//!   well-defined checkpoints; a paused run parks on the gate until resumed.
//!   Pausing may optionally request that the in-flight unit of work be
//!   aborted rather than allowed to finish.
//!
//! The gate is cheaply cloneable (`Arc`-backed) and `Send + Sync`.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

pub use tokio_util::sync::CancellationToken;

/// Cooperative pause gate built on [`tokio::sync::Notify`].
///
/// ```rust
/// # use maestro_kernel::control::PauseGate;
/// # async fn example() {
/// let gate = PauseGate::new();
/// gate.pause(false);
/// assert!(gate.is_paused());
/// gate.resume();
/// gate.wait_resumed().await; // returns immediately
/// # }
/// ```
#[derive(Clone)]
pub struct PauseGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    state: Mutex<GateState>,
    notify: Notify,
}

#[derive(Debug, Default, Clone, Copy)]
struct GateState {
    paused: bool,
    abort_current: bool,
}

impl PauseGate {
    /// Create a gate in the running (not paused) state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Pause the run.
    ///
    /// If `abort_current` is `true`, the caller is asking for the unit of
    /// work in flight to be aborted immediately instead of running to
    /// completion; holders of the gate decide how to honor that (typically by
    /// cancelling a per-step child token).
    pub fn pause(&self, abort_current: bool) {
        {
            let mut state = self.inner.state.lock().expect("pause gate poisoned");
            state.paused = true;
            state.abort_current = abort_current;
        }
        tracing::debug!(abort_current, "run paused");
        self.inner.notify.notify_waiters();
    }

    /// Resume the run and wake every task parked on [`wait_resumed`].
    ///
    /// [`wait_resumed`]: PauseGate::wait_resumed
    pub fn resume(&self) {
        {
            let mut state = self.inner.state.lock().expect("pause gate poisoned");
            state.paused = false;
            state.abort_current = false;
        }
        tracing::debug!("run resumed");
        self.inner.notify.notify_waiters();
    }

    /// Whether the gate is currently paused.
    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().expect("pause gate poisoned").paused
    }

    /// Whether the current pause also requested aborting the in-flight work.
    pub fn abort_requested(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("pause gate poisoned")
            .abort_current
    }

    /// Park until the gate is resumed.  Returns immediately when not paused.
    pub async fn wait_resumed(&self) {
        loop {
            // Register interest before re-checking the flag so a concurrent
            // `resume` between the check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            if !self.is_paused() {
                return;
            }
            notified.await;
        }
    }

    /// Park until a pause with `abort_current` is requested.
    ///
    /// Used by the scheduler to race the step in flight against an
    /// abort-immediate pause.
    pub async fn wait_abort_requested(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.abort_requested() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PauseGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().expect("pause gate poisoned");
        f.debug_struct("PauseGate")
            .field("paused", &state.paused)
            .field("abort_current", &state.abort_current)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
