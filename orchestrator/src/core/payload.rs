//! Terminal payloads and the per-turn summary record.

use serde::{Deserialize, Serialize};

use crate::core::compiler::ContextPacket;
use crate::core::gate::{GateReason, GateResult};
use crate::core::types::GraphState;
use crate::error::{EngineError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Completed,
    NeedsReview,
    Failed,
    CycleLimitExceeded,
}

impl TerminalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalStatus::Completed => "COMPLETED",
            TerminalStatus::NeedsReview => "NEEDS_REVIEW",
            TerminalStatus::Failed => "FAILED",
            TerminalStatus::CycleLimitExceeded => "CYCLE_LIMIT_EXCEEDED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    SupersedeLock,
    ResolveContradiction,
    ProvideAnchorInput,
    RestoreAnchorSource,
    AddEvidence,
    ResolveTask,
    AnswerQuestion,
}

/// Follow-up the caller must perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredAction {
    pub action: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub description: String,
}

/// Citation attached to a final answer.
///
/// `resolved` is false when the planner cited an id that was not in the
/// evidence lane it was shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub citation_id: String,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of one invocation, returned to the caller and stored in the final checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalPayload {
    pub status: TerminalStatus,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub references: Vec<Reference>,
    #[serde(default)]
    pub next_actions: Vec<RequiredAction>,
    #[serde(default)]
    pub blocking_reasons: Vec<GateReason>,
    #[serde(default)]
    pub error: Option<FailureDetail>,
    /// Cycles the turn consumed.
    pub cycles: u32,
}

impl TerminalPayload {
    fn base(status: TerminalStatus, cycles: u32) -> Self {
        Self {
            status,
            answer: None,
            references: Vec::new(),
            next_actions: Vec::new(),
            blocking_reasons: Vec::new(),
            error: None,
            cycles,
        }
    }

    /// Final answer. Open review tasks in the packet become `RESOLVE_TASK` actions.
    pub fn completed(
        answer: String,
        cited: &[String],
        packet: Option<&ContextPacket>,
        cycles: u32,
    ) -> Self {
        let mut payload = Self::base(TerminalStatus::Completed, cycles);
        payload.answer = Some(answer);
        payload.references = resolve_references(cited, packet);
        if let Some(packet) = packet {
            payload.next_actions = packet
                .world_snapshot
                .open_tasks
                .iter()
                .map(|task| RequiredAction {
                    action: ActionKind::ResolveTask,
                    target: Some(task.task_id.clone()),
                    description: task.title.clone(),
                })
                .collect();
        }
        payload
    }

    /// The planner asked the user something; the turn ends with the question.
    pub fn question(text: String, cycles: u32) -> Self {
        let mut payload = Self::base(TerminalStatus::Completed, cycles);
        payload.next_actions.push(RequiredAction {
            action: ActionKind::AnswerQuestion,
            target: None,
            description: text.clone(),
        });
        payload.answer = Some(text);
        payload
    }

    pub fn needs_review(gate: &GateResult, cycles: u32) -> Self {
        let mut payload = Self::base(TerminalStatus::NeedsReview, cycles);
        payload.blocking_reasons = gate.reasons.clone();
        payload.next_actions = gate.required_actions();
        payload
    }

    pub fn cycle_limit(cycles: u32, max_cycles: u32) -> Self {
        let mut payload = Self::base(TerminalStatus::CycleLimitExceeded, cycles);
        payload.answer = Some(format!(
            "no conclusion within {max_cycles} cycle(s); retry or escalate"
        ));
        payload
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>, cycles: u32) -> Self {
        let mut payload = Self::base(TerminalStatus::Failed, cycles);
        payload.error = Some(FailureDetail {
            kind,
            message: message.into(),
        });
        payload
    }

    /// `FAILED` payload for an error that escaped the engine.
    pub fn from_error(err: &EngineError) -> Self {
        Self::failed(err.kind(), format!("{err}"), 0)
    }
}

fn resolve_references(cited: &[String], packet: Option<&ContextPacket>) -> Vec<Reference> {
    let mut seen: Vec<&str> = Vec::new();
    cited
        .iter()
        .filter(|id| {
            let fresh = !seen.contains(&id.as_str());
            seen.push(id.as_str());
            fresh
        })
        .map(|id| {
            let item = packet.and_then(|p| p.evidence.items.iter().find(|i| &i.citation_id == id));
            match item {
                Some(item) => Reference {
                    citation_id: id.clone(),
                    resolved: true,
                    source_file: item.source_file.clone(),
                    page_number: item.page_number,
                    row_number: item.row_number,
                },
                None => Reference {
                    citation_id: id.clone(),
                    resolved: false,
                    source_file: None,
                    page_number: None,
                    row_number: None,
                },
            }
        })
        .collect()
}

/// Record written to the world model at EXIT; later turns read it as memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub thread_id: String,
    pub turn: u32,
    pub status: TerminalStatus,
    pub cycles: u32,
    /// Tools that ran during the turn, as `name (ok|failed)`.
    pub changed: Vec<String>,
    /// Descriptions of the payload's next actions.
    pub pending: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl SummaryRecord {
    pub fn from_turn(state: &GraphState, payload: &TerminalPayload) -> Self {
        let changed = state
            .recent_outcomes
            .iter()
            .filter(|o| o.turn == state.turn)
            .map(|o| {
                let verdict = if o.success { "ok" } else { "failed" };
                format!("{} ({verdict})", o.tool_name)
            })
            .collect();
        let pending = payload
            .next_actions
            .iter()
            .map(|a| a.description.clone())
            .collect();
        let reason = match (&payload.error, payload.blocking_reasons.is_empty()) {
            (Some(err), _) => Some(format!("{}: {}", err.kind, err.message)),
            (None, false) => Some(
                payload
                    .blocking_reasons
                    .iter()
                    .map(GateReason::describe)
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            (None, true) => None,
        };
        Self {
            thread_id: state.thread_id.to_string(),
            turn: state.turn,
            status: payload.status,
            cycles: payload.cycles,
            changed,
            pending,
            reason,
        }
    }

    /// Single-line rendering used as the memory lane text.
    pub fn render(&self) -> String {
        let mut line = format!(
            "turn {} ended {} after {} cycle(s)",
            self.turn,
            self.status.as_str(),
            self.cycles
        );
        if !self.changed.is_empty() {
            line.push_str(&format!("; tools: {}", self.changed.join(", ")));
        }
        if !self.pending.is_empty() {
            line.push_str(&format!("; pending: {}", self.pending.join(", ")));
        }
        if let Some(reason) = &self.reason {
            line.push_str(&format!("; reason: {reason}"));
        }
        line
    }
}
