//! Typed views for the four context lanes.
//!
//! Lanes are produced by `io::lanes` and consumed by the compiler. Each lane
//! knows how to give up its least relevant item when the packet runs over
//! budget; see [`LaneSet::drop_one`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::RecentFailure;
use crate::core::world::{AnchorFact, MemorySource, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneKind {
    WorldSnapshot,
    Anchor,
    Memory,
    Evidence,
}

impl LaneKind {
    /// Lanes in the order their items are dropped when over budget.
    pub const DROP_ORDER: [LaneKind; 4] = [
        LaneKind::Memory,
        LaneKind::Evidence,
        LaneKind::WorldSnapshot,
        LaneKind::Anchor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LaneKind::WorldSnapshot => "world_snapshot",
            LaneKind::Anchor => "anchor",
            LaneKind::Memory => "memory",
            LaneKind::Evidence => "evidence",
        }
    }
}

impl fmt::Display for LaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lane that could not be read and was replaced by an empty one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneWarning {
    pub lane: LaneKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockView {
    pub lock_id: String,
    pub issue_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: String,
    pub issue_key: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContradictionView {
    pub contradiction_id: String,
    pub issue_key: Option<String>,
    pub summary: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeView {
    pub tool_name: String,
    pub success: bool,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldCounters {
    pub active_locks: usize,
    pub open_tasks: usize,
    pub open_contradictions: usize,
    pub anchor_facts: usize,
    pub evidence_segments: usize,
    pub tool_invocations: usize,
}

/// Point-in-time operational facts about the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub run_id: String,
    pub current_issue_key: Option<String>,
    pub counters: WorldCounters,
    pub active_locks: Vec<LockView>,
    pub open_tasks: Vec<TaskView>,
    pub open_contradictions: Vec<ContradictionView>,
    /// Newest first.
    pub last_tool_outcomes: Vec<OutcomeView>,
    /// Oldest first.
    pub recent_failures: Vec<RecentFailure>,
}

impl WorldSnapshot {
    pub fn empty(run_id: &str, current_issue_key: Option<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            current_issue_key,
            counters: WorldCounters::default(),
            active_locks: Vec::new(),
            open_tasks: Vec::new(),
            open_contradictions: Vec::new(),
            last_tool_outcomes: Vec::new(),
            recent_failures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AnchorStatus {
    Complete,
    /// Required keys are absent, or were dropped to fit the token budget.
    Incomplete { missing: Vec<String> },
    /// The anchor source could not be read at all.
    Unavailable { error: String },
}

impl AnchorStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, AnchorStatus::Complete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorLane {
    pub facts: Vec<AnchorFact>,
    pub status: AnchorStatus,
}

impl AnchorLane {
    /// Build the lane and derive its status from the required keys.
    pub fn from_facts(required: &[String], facts: Vec<AnchorFact>) -> Self {
        let missing: Vec<String> = required
            .iter()
            .filter(|key| !facts.iter().any(|f| &f.key == *key))
            .cloned()
            .collect();
        let status = if missing.is_empty() {
            AnchorStatus::Complete
        } else {
            AnchorStatus::Incomplete { missing }
        };
        Self { facts, status }
    }

    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            facts: Vec::new(),
            status: AnchorStatus::Unavailable {
                error: error.into(),
            },
        }
    }

    fn mark_dropped(&mut self, key: String) {
        match &mut self.status {
            AnchorStatus::Complete => {
                self.status = AnchorStatus::Incomplete { missing: vec![key] };
            }
            AnchorStatus::Incomplete { missing } => {
                if !missing.contains(&key) {
                    missing.push(key);
                }
            }
            AnchorStatus::Unavailable { .. } => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub memory_id: String,
    pub source: MemorySource,
    pub text: String,
}

/// Summarized prior interactions, oldest first. Non-authoritative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLane {
    pub entries: Vec<MemoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub citation_id: String,
    pub content: String,
    pub source_file: Option<String>,
    pub page_number: Option<u32>,
    pub row_number: Option<u32>,
    pub score: f64,
}

/// Retrieved fragments, highest score first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceLane {
    pub query: String,
    pub items: Vec<EvidenceItem>,
}

/// All four lanes as assembled for one cycle, before budgeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneSet {
    pub world: WorldSnapshot,
    pub anchor: AnchorLane,
    pub memory: MemoryLane,
    pub evidence: EvidenceLane,
    pub warnings: Vec<LaneWarning>,
}

/// Item removed from a lane, returned with its token cost.
pub(crate) struct Dropped {
    pub tokens: usize,
}

impl LaneSet {
    /// Remove the least relevant item from `lane`.
    ///
    /// Memory drops its oldest entry, evidence its lowest-scored item, the
    /// world snapshot its oldest outcome, then failures, tasks, contradictions
    /// and finally locks. Anchor facts drop from the end and are reported as
    /// missing on the lane status. Returns `None` once the lane is empty.
    pub(crate) fn drop_one(&mut self, lane: LaneKind) -> Option<Dropped> {
        let tokens = match lane {
            LaneKind::Memory => {
                if self.memory.entries.is_empty() {
                    return None;
                }
                estimate_item(&self.memory.entries.remove(0))
            }
            LaneKind::Evidence => estimate_item(&self.evidence.items.pop()?),
            LaneKind::WorldSnapshot => self.drop_world_item()?,
            LaneKind::Anchor => {
                let fact = self.anchor.facts.pop()?;
                let tokens = estimate_item(&fact);
                self.anchor.mark_dropped(fact.key);
                tokens
            }
        };
        Some(Dropped { tokens })
    }

    fn drop_world_item(&mut self) -> Option<usize> {
        let world = &mut self.world;
        if let Some(outcome) = world.last_tool_outcomes.pop() {
            return Some(estimate_item(&outcome));
        }
        if !world.recent_failures.is_empty() {
            return Some(estimate_item(&world.recent_failures.remove(0)));
        }
        if let Some(task) = world.open_tasks.pop() {
            return Some(estimate_item(&task));
        }
        if let Some(contradiction) = world.open_contradictions.pop() {
            return Some(estimate_item(&contradiction));
        }
        world.active_locks.pop().map(|lock| estimate_item(&lock))
    }

    /// Token cost of every lane item currently held.
    pub fn item_tokens(&self) -> usize {
        let world = &self.world;
        sum(&world.active_locks)
            + sum(&world.open_tasks)
            + sum(&world.open_contradictions)
            + sum(&world.last_tool_outcomes)
            + sum(&world.recent_failures)
            + sum(&self.anchor.facts)
            + sum(&self.memory.entries)
            + sum(&self.evidence.items)
    }
}

fn sum<T: Serialize>(items: &[T]) -> usize {
    items.iter().map(estimate_item).sum()
}

fn estimate_item<T: Serialize>(item: &T) -> usize {
    crate::core::compiler::estimate_tokens(item)
}
