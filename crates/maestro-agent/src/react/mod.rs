//! ReAct orchestration engine.
//!
//! - [`reassembly`] -- Single-turn chunk reconstruction.
//! - [`runner`] -- The multi-turn loop driver with turn retries, tool
//!   dispatch, and hooks.

pub mod reassembly;
pub mod runner;

pub use reassembly::TurnReassembler;
pub use runner::{
    ChunkHook, ContinuationPolicy, ErrorHook, FinishDirective, FinishHook, ReactHooks,
    ReactOutcome, ReactRunner,
};
