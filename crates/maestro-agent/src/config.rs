//! Runtime configuration.
//!
//! Everything that is policy rather than invariant lives here: streaming
//! guard bounds, turn-retry ceiling and backoff base, loop limits, and
//! scheduler behavior flags.  Values load from TOML with serde defaults
//! and can be overridden by `MAESTRO_*` environment variables, so deployments
//! can tighten timeouts without a rebuild.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Timeout bounds for the gateway's streaming guards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bound for obtaining a stream handle, and for the first chunk to
    /// arrive once the handle exists.  The two guards are timed
    /// independently but share this bound.
    #[serde(default = "default_stream_start_ms")]
    pub stream_start_timeout_ms: u64,

    /// Bound for every chunk after the first.  Typically larger than the
    /// start bound: a healthy stream may legitimately think between chunks.
    #[serde(default = "default_inter_chunk_ms")]
    pub inter_chunk_timeout_ms: u64,
}

fn default_stream_start_ms() -> u64 {
    10_000
}

fn default_inter_chunk_ms() -> u64 {
    30_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            stream_start_timeout_ms: default_stream_start_ms(),
            inter_chunk_timeout_ms: default_inter_chunk_ms(),
        }
    }
}

impl GatewayConfig {
    /// The connect / first-chunk bound as a [`Duration`].
    pub fn stream_start_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_start_timeout_ms)
    }

    /// The inter-chunk bound as a [`Duration`].
    pub fn inter_chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// ReAct engine
// ---------------------------------------------------------------------------

/// Limits and retry policy for the reasoning/acting loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactConfig {
    /// Maximum reasoning turns per agent run.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    /// Whole-turn retry ceiling for transport failures and finish-hook
    /// retry directives.
    #[serde(default = "default_max_turn_retries")]
    pub max_turn_retries: u32,

    /// Base for the quadratic retry backoff: waits `base * (n + 1)^2` ms
    /// before retry `n + 1`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Consecutive tool-execution failures tolerated before the agent
    /// aborts.  Any success resets the counter.
    #[serde(default = "default_tool_error_ceiling")]
    pub tool_error_ceiling: u32,
}

fn default_max_turns() -> u32 {
    15
}

fn default_max_turn_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_tool_error_ceiling() -> u32 {
    10
}

impl Default for ReactConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_turn_retries: default_max_turn_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            tool_error_ceiling: default_tool_error_ceiling(),
        }
    }
}

impl ReactConfig {
    /// Backoff delay before retry number `n + 1` (`n` retries so far).
    pub fn backoff_delay(&self, retries_so_far: u32) -> Duration {
        let n = u64::from(retries_so_far) + 1;
        Duration::from_millis(self.backoff_base_ms * n * n)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Behavior flags for the workflow scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Whether parallel-step members run concurrently by default.  A per-run
    /// override takes precedence.
    #[serde(default = "default_parallel")]
    pub parallel_default: bool,

    /// Deep mode: after each step, consult the replanner and regenerate the
    /// remaining plan when it says so.
    #[serde(default)]
    pub deep_mode: bool,
}

fn default_parallel() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel_default: default_parallel(),
            deep_mode: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub react: ReactConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl RuntimeConfig {
    /// Parse a configuration from a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|e| AgentError::ConfigError {
            reason: format!("invalid config TOML: {e}"),
        })
    }

    /// Apply `MAESTRO_*` environment overrides on top of the loaded values.
    ///
    /// Unparseable values are rejected rather than silently ignored.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(v) = std::env::var("MAESTRO_MAX_TURNS") {
            self.react.max_turns = parse_env("MAESTRO_MAX_TURNS", &v)?;
        }
        if let Ok(v) = std::env::var("MAESTRO_INTER_CHUNK_TIMEOUT_MS") {
            self.gateway.inter_chunk_timeout_ms = parse_env("MAESTRO_INTER_CHUNK_TIMEOUT_MS", &v)?;
        }
        if let Ok(v) = std::env::var("MAESTRO_DEEP_MODE") {
            self.scheduler.deep_mode = parse_env("MAESTRO_DEEP_MODE", &v)?;
        }
        if let Ok(v) = std::env::var("MAESTRO_PARALLEL") {
            self.scheduler.parallel_default = parse_env("MAESTRO_PARALLEL", &v)?;
        }
        Ok(self)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| AgentError::ConfigError {
        reason: format!("invalid value for {name}: `{value}`"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
