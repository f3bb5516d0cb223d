//! Resumable, checkpointed orchestration for a planner-driven agent.
//!
//! Every cycle rebuilds a token-budgeted context packet from the world model,
//! checks hard gates that can suspend the turn for human review, asks an
//! external planner for exactly one decision and runs at most one tool. The
//! architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (lanes, compiler, gate, phase
//!   machine, payloads). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (checkpoints, world model, planner
//!   and tool processes, configuration).
//!
//! [`engine`] drives the phase machine over both.

pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
