//! Gate evaluation: decide whether a cycle may proceed to planning.
//!
//! The evaluator is a pure function of the world snapshot, the anchor status
//! and the evidence count. Reasons are reported in a fixed order (locks,
//! contradictions, anchor, evidence) so identical inputs give identical results.

use serde::{Deserialize, Serialize};

use crate::core::lanes::{AnchorStatus, WorldSnapshot};
use crate::core::payload::{ActionKind, RequiredAction};
use crate::core::world::Severity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GateReason {
    ActiveDecisionLock {
        lock_id: String,
        issue_key: String,
    },
    BlockingContradiction {
        contradiction_id: String,
        summary: String,
    },
    MissingAnchorInput {
        missing: Vec<String>,
        #[serde(default)]
        source_error: Option<String>,
    },
    InsufficientEvidence {
        request_kind: String,
        found: usize,
        required: usize,
    },
}

impl GateReason {
    pub fn describe(&self) -> String {
        match self {
            GateReason::ActiveDecisionLock { lock_id, issue_key } => {
                format!("active decision lock {lock_id} on {issue_key}")
            }
            GateReason::BlockingContradiction {
                contradiction_id,
                summary,
            } => format!("unresolved blocking contradiction {contradiction_id}: {summary}"),
            GateReason::MissingAnchorInput {
                source_error: Some(err),
                ..
            } => format!("anchor source unavailable: {err}"),
            GateReason::MissingAnchorInput { missing, .. } => {
                format!("missing anchor input: {}", missing.join(", "))
            }
            GateReason::InsufficientEvidence {
                request_kind,
                found,
                required,
            } => format!(
                "insufficient evidence for {request_kind}: found {found}, need {required}"
            ),
        }
    }

    /// The action that would clear this reason.
    pub fn required_action(&self) -> RequiredAction {
        match self {
            GateReason::ActiveDecisionLock { lock_id, issue_key } => RequiredAction {
                action: ActionKind::SupersedeLock,
                target: Some(lock_id.clone()),
                description: format!("supersede or release decision lock on {issue_key}"),
            },
            GateReason::BlockingContradiction {
                contradiction_id,
                summary,
            } => RequiredAction {
                action: ActionKind::ResolveContradiction,
                target: Some(contradiction_id.clone()),
                description: format!("resolve contradiction: {summary}"),
            },
            GateReason::MissingAnchorInput {
                source_error: Some(_),
                ..
            } => RequiredAction {
                action: ActionKind::RestoreAnchorSource,
                target: None,
                description: "restore access to the anchor source".to_string(),
            },
            GateReason::MissingAnchorInput { missing, .. } => RequiredAction {
                action: ActionKind::ProvideAnchorInput,
                target: (!missing.is_empty()).then(|| missing.join(",")),
                description: format!("provide anchor facts: {}", missing.join(", ")),
            },
            GateReason::InsufficientEvidence {
                request_kind,
                found,
                required,
            } => RequiredAction {
                action: ActionKind::AddEvidence,
                target: Some(request_kind.clone()),
                description: format!("add {} more evidence item(s)", required - found),
            },
        }
    }
}

/// Evidence coverage measured on the compiled packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceStatus {
    pub request_kind: String,
    pub found: usize,
    pub required: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub blocked: bool,
    pub reasons: Vec<GateReason>,
}

impl GateResult {
    pub fn required_actions(&self) -> Vec<RequiredAction> {
        self.reasons.iter().map(GateReason::required_action).collect()
    }
}

/// Evaluate the gate.
///
/// A lock blocks when it is on the current issue key, or on any issue when the
/// turn names no issue key. Only contradictions with `Blocking` severity block.
pub fn evaluate(
    world: &WorldSnapshot,
    anchor: &AnchorStatus,
    evidence: &EvidenceStatus,
) -> GateResult {
    let mut reasons = Vec::new();

    for lock in &world.active_locks {
        let applies = world
            .current_issue_key
            .as_ref()
            .is_none_or(|key| key == &lock.issue_key);
        if applies {
            reasons.push(GateReason::ActiveDecisionLock {
                lock_id: lock.lock_id.clone(),
                issue_key: lock.issue_key.clone(),
            });
        }
    }

    for contradiction in &world.open_contradictions {
        if contradiction.severity == Severity::Blocking {
            reasons.push(GateReason::BlockingContradiction {
                contradiction_id: contradiction.contradiction_id.clone(),
                summary: contradiction.summary.clone(),
            });
        }
    }

    match anchor {
        AnchorStatus::Complete => {}
        AnchorStatus::Incomplete { missing } => reasons.push(GateReason::MissingAnchorInput {
            missing: missing.clone(),
            source_error: None,
        }),
        AnchorStatus::Unavailable { error } => reasons.push(GateReason::MissingAnchorInput {
            missing: Vec::new(),
            source_error: Some(error.clone()),
        }),
    }

    if evidence.found < evidence.required {
        reasons.push(GateReason::InsufficientEvidence {
            request_kind: evidence.request_kind.clone(),
            found: evidence.found,
            required: evidence.required,
        });
    }

    GateResult {
        blocked: !reasons.is_empty(),
        reasons,
    }
}
