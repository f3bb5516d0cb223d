//! Typed error taxonomy for the orchestration engine.
//!
//! Four enums cover the boundaries a caller can observe:
//! - `EngineError`: invocation-level failures returned from `Engine::run`
//! - `PlannerError`: failures reported by a planner adapter
//! - `ToolError`: failures of a single tool dispatch
//! - `CheckpointError`: checkpoint store failures
//!
//! Each error maps to a stable, machine-readable [`ErrorKind`] so `FAILED`
//! payloads always carry a kind alongside the human-readable message.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error classification carried by `FAILED` payloads and
/// tool-invocation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PlannerContractViolation,
    PlannerTimeout,
    PlannerUnavailable,
    UnknownTool,
    ToolInputInvalid,
    ToolOutputInvalid,
    ToolTimeout,
    ToolFailed,
    StateVersionMismatch,
    ConcurrentInvocation,
    Cancelled,
    InvalidThreadId,
    InvalidTransition,
    CheckpointIo,
    WorldModelIo,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PlannerContractViolation => "planner_contract_violation",
            ErrorKind::PlannerTimeout => "planner_timeout",
            ErrorKind::PlannerUnavailable => "planner_unavailable",
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::ToolInputInvalid => "tool_input_invalid",
            ErrorKind::ToolOutputInvalid => "tool_output_invalid",
            ErrorKind::ToolTimeout => "tool_timeout",
            ErrorKind::ToolFailed => "tool_failed",
            ErrorKind::StateVersionMismatch => "state_version_mismatch",
            ErrorKind::ConcurrentInvocation => "concurrent_invocation",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidThreadId => "invalid_thread_id",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::CheckpointIo => "checkpoint_io",
            ErrorKind::WorldModelIo => "world_model_io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by `Engine::run` and the reset command.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("thread {thread_id} already has an invocation in flight")]
    ConcurrentInvocation { thread_id: String },

    #[error(
        "checkpoint for thread {thread_id} has state version {found}, engine expects {expected} (migrate or reset the thread)"
    )]
    StateVersionMismatch {
        thread_id: String,
        found: u32,
        expected: u32,
    },

    #[error("invocation for thread {thread_id} cancelled before cycle {next_cycle}")]
    Cancelled { thread_id: String, next_cycle: u32 },

    #[error("invalid thread id '{value}': {reason}")]
    InvalidThreadId { value: String, reason: String },

    #[error("no transition from {phase} on {event}")]
    InvalidTransition { phase: String, event: String },

    #[error("checkpoint store error: {0}")]
    Checkpoint(#[source] CheckpointError),

    #[error("world model error: {0:#}")]
    WorldModel(#[source] anyhow::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ConcurrentInvocation { .. } => ErrorKind::ConcurrentInvocation,
            EngineError::StateVersionMismatch { .. } => ErrorKind::StateVersionMismatch,
            EngineError::Cancelled { .. } => ErrorKind::Cancelled,
            EngineError::InvalidThreadId { .. } => ErrorKind::InvalidThreadId,
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::Checkpoint(_) => ErrorKind::CheckpointIo,
            EngineError::WorldModel(_) => ErrorKind::WorldModelIo,
        }
    }
}

impl From<CheckpointError> for EngineError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::VersionMismatch {
                thread_id,
                found,
                expected,
            } => EngineError::StateVersionMismatch {
                thread_id,
                found,
                expected,
            },
            other => EngineError::Checkpoint(other),
        }
    }
}

/// Errors reported by a planner adapter.
///
/// `Timeout` and `Unavailable` are transient: the engine records them and
/// continues with the next cycle. `ContractViolation` is fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlannerError {
    #[error("planner timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("planner unavailable: {0}")]
    Unavailable(String),

    #[error("planner contract violation: {0}")]
    ContractViolation(String),
}

impl PlannerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlannerError::Timeout { .. } => ErrorKind::PlannerTimeout,
            PlannerError::Unavailable(_) => ErrorKind::PlannerUnavailable,
            PlannerError::ContractViolation(_) => ErrorKind::PlannerContractViolation,
        }
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self, PlannerError::ContractViolation(_))
    }
}

/// Failure of a single tool dispatch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("input for tool '{tool}' failed schema validation: {}", messages.join("; "))]
    InputInvalid { tool: String, messages: Vec<String> },

    #[error("output of tool '{tool}' failed schema validation: {}", messages.join("; "))]
    OutputInvalid { tool: String, messages: Vec<String> },

    #[error("tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::UnknownTool(_) => ErrorKind::UnknownTool,
            ToolError::InputInvalid { .. } => ErrorKind::ToolInputInvalid,
            ToolError::OutputInvalid { .. } => ErrorKind::ToolOutputInvalid,
            ToolError::Timeout { .. } => ErrorKind::ToolTimeout,
            ToolError::Failed { .. } => ErrorKind::ToolFailed,
        }
    }
}

/// Checkpoint store failures.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint for {thread_id} has schema version {found}, expected {expected}")]
    VersionMismatch {
        thread_id: String,
        found: u32,
        expected: u32,
    },

    #[error("corrupt checkpoint {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}
