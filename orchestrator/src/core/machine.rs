//! Orchestration phases and the transition table that connects them.
//!
//! The engine never moves between phases directly; every step goes through
//! [`transition`], so an unexpected `(phase, event)` pair surfaces as an
//! error instead of a silent jump.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    ContextBuild,
    GateCheck,
    Suspended,
    Plan,
    ToolLoop,
    Exit,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::ContextBuild => "CONTEXT_BUILD",
            Phase::GateCheck => "GATE_CHECK",
            Phase::Suspended => "SUSPENDED",
            Phase::Plan => "PLAN",
            Phase::ToolLoop => "TOOL_LOOP",
            Phase::Exit => "EXIT",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A fresh or terminal thread starts a turn.
    TurnStarted,
    /// An interrupted turn resumes with a tool call still queued.
    ResumePendingTool,
    ContextCompiled,
    CycleLimitReached,
    Cancelled,
    GateClear,
    GateBlocked,
    ToolQueued,
    /// Planner timed out or was unreachable; retry on the next cycle.
    PlannerFailed,
    /// Planner finalized or asked the user a question.
    Concluded,
    /// Contract violation or unknown tool.
    Fatal,
    ToolSettled,
    ToolBlocked,
    Suspend,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

const TRANSITIONS: &[(Phase, Event, Phase)] = &[
    (Phase::Init, Event::TurnStarted, Phase::ContextBuild),
    (Phase::Init, Event::ResumePendingTool, Phase::ToolLoop),
    (Phase::ContextBuild, Event::ContextCompiled, Phase::GateCheck),
    (Phase::ContextBuild, Event::CycleLimitReached, Phase::Exit),
    (Phase::ContextBuild, Event::Cancelled, Phase::Exit),
    (Phase::GateCheck, Event::GateClear, Phase::Plan),
    (Phase::GateCheck, Event::GateBlocked, Phase::Suspended),
    (Phase::Suspended, Event::Suspend, Phase::Exit),
    (Phase::Plan, Event::ToolQueued, Phase::ToolLoop),
    (Phase::Plan, Event::PlannerFailed, Phase::ContextBuild),
    (Phase::Plan, Event::Concluded, Phase::Exit),
    (Phase::Plan, Event::Fatal, Phase::Exit),
    (Phase::ToolLoop, Event::ToolSettled, Phase::ContextBuild),
    (Phase::ToolLoop, Event::ToolBlocked, Phase::Suspended),
    (Phase::ToolLoop, Event::Fatal, Phase::Exit),
];

pub fn transition(from: Phase, event: Event) -> Result<Phase, EngineError> {
    TRANSITIONS
        .iter()
        .find(|(phase, on, _)| *phase == from && *on == event)
        .map(|(_, _, to)| *to)
        .ok_or_else(|| EngineError::InvalidTransition {
            phase: from.to_string(),
            event: event.to_string(),
        })
}
