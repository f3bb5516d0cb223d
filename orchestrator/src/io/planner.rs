//! Planner adapters.
//!
//! A [`Planner`] turns one compiled context packet into a raw JSON decision.
//! Adapters only transport the response; validation against the decision
//! contract happens in the engine via `core::decision::decode_decision`.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::compiler::ContextPacket;
use crate::core::types::{IncomingMessage, ThreadId};
use crate::error::PlannerError;
use crate::io::process::{command_from_argv, run_command_with_timeout};
use crate::io::prompt::render_planner_prompt;
use crate::io::tools::ToolSpec;

/// Everything the planner sees for one cycle.
#[derive(Debug, Clone, Copy)]
pub struct PlannerRequest<'a> {
    pub thread_id: &'a ThreadId,
    pub message: &'a IncomingMessage,
    pub packet: &'a ContextPacket,
    pub tools: &'a [ToolSpec],
    pub cycle: u32,
}

pub trait Planner: Send + Sync {
    /// Produce one raw decision within `timeout`.
    fn decide(&self, request: &PlannerRequest<'_>, timeout: Duration)
    -> Result<Value, PlannerError>;
}

/// Planner backed by an external command.
///
/// The rendered prompt is written to stdin; the command must print one JSON
/// decision on stdout.
#[derive(Debug, Clone)]
pub struct CommandPlanner {
    argv: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandPlanner {
    pub fn new(argv: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            output_limit_bytes,
        }
    }
}

impl Planner for CommandPlanner {
    #[instrument(skip_all, fields(cycle = request.cycle))]
    fn decide(
        &self,
        request: &PlannerRequest<'_>,
        timeout: Duration,
    ) -> Result<Value, PlannerError> {
        let prompt = render_planner_prompt(request)
            .map_err(|err| PlannerError::Unavailable(format!("render prompt: {err:#}")))?;
        let cmd = command_from_argv(&self.argv)
            .map_err(|err| PlannerError::Unavailable(format!("{err:#}")))?;
        let output = run_command_with_timeout(
            cmd,
            prompt.as_bytes(),
            timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| PlannerError::Unavailable(format!("{err:#}")))?;

        if output.timed_out {
            return Err(PlannerError::Timeout {
                timeout_secs: timeout.as_secs(),
            });
        }
        if !output.status.success() {
            warn!(status = %output.status, "planner command failed");
            return Err(PlannerError::Unavailable(format!(
                "planner exited with {}: {}",
                output.status,
                output.stderr_tail()
            )));
        }
        if output.stdout_truncated > 0 {
            return Err(PlannerError::ContractViolation(format!(
                "planner output exceeded {} bytes",
                self.output_limit_bytes
            )));
        }
        let value = parse_decision_output(&output.stdout_text())?;
        debug!("planner responded");
        Ok(value)
    }
}

/// Parse planner stdout: the whole output, or failing that its last non-empty line.
fn parse_decision_output(stdout: &str) -> Result<Value, PlannerError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(PlannerError::ContractViolation(
            "planner produced no output".to_string(),
        ));
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    let last_line = trimmed.lines().rev().find(|l| !l.trim().is_empty());
    match last_line.map(|line| serde_json::from_str::<Value>(line.trim())) {
        Some(Ok(value)) => Ok(value),
        Some(Err(err)) => Err(PlannerError::ContractViolation(format!(
            "planner output is not JSON: {err}"
        ))),
        None => Err(PlannerError::ContractViolation(
            "planner produced no output".to_string(),
        )),
    }
}
