//! Stable exit codes for orchestrator CLI commands.

use crate::core::payload::TerminalStatus;

/// Command succeeded, or `run` ended `COMPLETED`.
pub const OK: i32 = 0;
/// Invalid arguments, config, store or world data, or any other error.
pub const ERROR: i32 = 1;
/// `run` suspended on the gate.
pub const NEEDS_REVIEW: i32 = 2;
/// `run` ended `FAILED`.
pub const FAILED: i32 = 3;
/// `run` hit the cycle limit.
pub const CYCLE_LIMIT: i32 = 4;

pub fn for_status(status: TerminalStatus) -> i32 {
    match status {
        TerminalStatus::Completed => OK,
        TerminalStatus::NeedsReview => NEEDS_REVIEW,
        TerminalStatus::Failed => FAILED,
        TerminalStatus::CycleLimitExceeded => CYCLE_LIMIT,
    }
}
