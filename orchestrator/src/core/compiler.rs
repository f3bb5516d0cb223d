//! Context compiler: merges the four lanes into one token-budgeted packet.
//!
//! Compilation is a pure function of its inputs. When the lanes exceed the
//! budget, items are removed whole in lane priority order (Memory, then
//! Evidence, then World Snapshot, then Anchor), so the anchor lane is the
//! last thing to lose content and an evidence item is never cut mid-citation.
//!
//! Token accounting counts lane items only. Lane headers and warnings are
//! free, which keeps every budget achievable by dropping items.

use serde::{Deserialize, Serialize};

use crate::core::lanes::{
    AnchorLane, EvidenceLane, LaneKind, LaneSet, LaneWarning, MemoryLane, WorldSnapshot,
};

/// Items removed from one lane to meet the budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationNote {
    pub lane: LaneKind,
    pub dropped_items: usize,
}

/// The budgeted input handed to the planner each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPacket {
    pub world_snapshot: WorldSnapshot,
    pub anchor: AnchorLane,
    pub memory: MemoryLane,
    pub evidence: EvidenceLane,
    pub warnings: Vec<LaneWarning>,
    pub truncation: Vec<TruncationNote>,
    pub token_budget: usize,
    pub tokens_used: usize,
}

impl ContextPacket {
    pub fn was_truncated(&self) -> bool {
        !self.truncation.is_empty()
    }

    pub fn evidence_ids(&self) -> impl Iterator<Item = &str> {
        self.evidence.items.iter().map(|item| item.citation_id.as_str())
    }
}

/// Rough token estimate: one token per four bytes of compact JSON, rounded up.
pub fn estimate_tokens<T: Serialize>(value: &T) -> usize {
    serde_json::to_vec(value).map_or(0, |bytes| bytes.len().div_ceil(4))
}

/// Compile lanes into a packet whose `tokens_used` never exceeds `token_budget`.
pub fn compile(mut lanes: LaneSet, token_budget: usize) -> ContextPacket {
    let mut used = lanes.item_tokens();
    let mut truncation: Vec<TruncationNote> = Vec::new();

    for lane in LaneKind::DROP_ORDER {
        let mut dropped_items = 0;
        while used > token_budget {
            let Some(dropped) = lanes.drop_one(lane) else {
                break;
            };
            used -= dropped.tokens;
            dropped_items += 1;
        }
        if dropped_items > 0 {
            truncation.push(TruncationNote {
                lane,
                dropped_items,
            });
        }
    }

    ContextPacket {
        world_snapshot: lanes.world,
        anchor: lanes.anchor,
        memory: lanes.memory,
        evidence: lanes.evidence,
        warnings: lanes.warnings,
        truncation,
        token_budget,
        tokens_used: used,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lanes::{AnchorStatus, EvidenceItem, MemoryEntry, OutcomeView};
    use crate::core::world::{AnchorFact, MemorySource};
    use proptest::prelude::*;

    fn evidence_item(id: &str, content: &str, score: f64) -> EvidenceItem {
        EvidenceItem {
            citation_id: id.to_string(),
            content: content.to_string(),
            source_file: Some("ledger.csv".to_string()),
            page_number: None,
            row_number: Some(4),
            score,
        }
    }

    fn lanes(anchor: usize, memory: usize, evidence: usize) -> LaneSet {
        LaneSet {
            world: WorldSnapshot::empty("run-1", Some("ISSUE-1".to_string())),
            anchor: AnchorLane::from_facts(
                &[],
                (0..anchor)
                    .map(|i| AnchorFact {
                        key: format!("k{i}"),
                        value: "anchor value ".repeat(4),
                        source: None,
                    })
                    .collect(),
            ),
            memory: MemoryLane {
                entries: (0..memory)
                    .map(|i| MemoryEntry {
                        memory_id: format!("m{i}"),
                        source: MemorySource::Summary,
                        text: "previous turn summary ".repeat(4),
                    })
                    .collect(),
            },
            evidence: EvidenceLane {
                query: "wages".to_string(),
                items: (0..evidence)
                    .map(|i| evidence_item(&format!("e{i}"), &"wage row ".repeat(6), 1.0))
                    .collect(),
            },
            warnings: Vec::new(),
        }
    }

    #[test]
    fn under_budget_packet_keeps_everything() {
        let input = lanes(2, 2, 2);
        let total = input.item_tokens();
        let packet = compile(input, total);
        assert!(!packet.was_truncated());
        assert_eq!(packet.tokens_used, total);
        assert_eq!(packet.memory.entries.len(), 2);
    }

    #[test]
    fn memory_is_dropped_before_evidence_and_anchor() {
        let input = lanes(2, 3, 2);
        let memory_tokens: usize = input.memory.entries.iter().map(estimate_tokens).sum();
        let budget = input.item_tokens() - memory_tokens;

        let packet = compile(input, budget);
        assert!(packet.memory.entries.is_empty());
        assert_eq!(packet.evidence.items.len(), 2);
        assert_eq!(packet.anchor.facts.len(), 2);
        assert_eq!(
            packet.truncation,
            vec![TruncationNote {
                lane: LaneKind::Memory,
                dropped_items: 3
            }]
        );
    }

    #[test]
    fn anchor_is_truncated_last_and_marked_incomplete() {
        let packet = compile(lanes(3, 2, 2), 0);
        assert_eq!(packet.tokens_used, 0);
        assert!(packet.anchor.facts.is_empty());
        assert!(matches!(
            packet.anchor.status,
            AnchorStatus::Incomplete { .. }
        ));
        let order: Vec<LaneKind> = packet.truncation.iter().map(|t| t.lane).collect();
        assert_eq!(
            order,
            vec![LaneKind::Memory, LaneKind::Evidence, LaneKind::Anchor]
        );
    }

    #[test]
    fn world_snapshot_sheds_outcomes_before_locks() {
        let mut input = lanes(0, 0, 0);
        input.world.last_tool_outcomes = vec![OutcomeView {
            tool_name: "lookup".into(),
            success: true,
            summary: "x".repeat(40),
        }];
        input.world.active_locks = vec![crate::core::lanes::LockView {
            lock_id: "L1".into(),
            issue_key: "ISSUE-1".into(),
            reason: "r".into(),
        }];
        let lock_tokens = estimate_tokens(&input.world.active_locks[0]);

        let packet = compile(input, lock_tokens);
        assert!(packet.world_snapshot.last_tool_outcomes.is_empty());
        assert_eq!(packet.world_snapshot.active_locks.len(), 1);
    }

    fn arb_lanes() -> impl Strategy<Value = LaneSet> {
        (
            prop::collection::vec("[a-z ]{0,40}", 0..6),
            prop::collection::vec("[a-z ]{0,60}", 0..8),
            prop::collection::vec(("[a-z ]{0,80}", 0.0f64..1.0), 0..8),
        )
            .prop_map(|(anchor, memory, evidence)| {
                let mut input = lanes(0, 0, 0);
                input.anchor = AnchorLane::from_facts(
                    &[],
                    anchor
                        .into_iter()
                        .enumerate()
                        .map(|(i, value)| AnchorFact {
                            key: format!("k{i}"),
                            value,
                            source: None,
                        })
                        .collect(),
                );
                input.memory.entries = memory
                    .into_iter()
                    .enumerate()
                    .map(|(i, text)| MemoryEntry {
                        memory_id: format!("m{i}"),
                        source: MemorySource::Note,
                        text,
                    })
                    .collect();
                input.evidence.items = evidence
                    .into_iter()
                    .enumerate()
                    .map(|(i, (content, score))| evidence_item(&format!("e{i}"), &content, score))
                    .collect();
                input
            })
    }

    proptest! {
        /// Packets always fit the budget and the same input compiles to identical bytes.
        #[test]
        fn packet_respects_budget_and_is_deterministic(input in arb_lanes(), budget in 0usize..400) {
            let first = compile(input.clone(), budget);
            let second = compile(input.clone(), budget);
            prop_assert!(first.tokens_used <= budget);
            prop_assert_eq!(
                serde_json::to_vec(&first).expect("json"),
                serde_json::to_vec(&second).expect("json")
            );
        }

        /// Surviving evidence items are unmodified originals, kept in order.
        #[test]
        fn evidence_items_are_never_split(input in arb_lanes(), budget in 0usize..400) {
            let original = input.evidence.items.clone();
            let packet = compile(input, budget);
            prop_assert!(packet.evidence.items.len() <= original.len());
            for (kept, source) in packet.evidence.items.iter().zip(original.iter()) {
                prop_assert_eq!(kept, source);
            }
        }

        /// Anchor facts survive whenever dropping every lower lane is enough.
        #[test]
        fn anchor_outlives_lower_priority_lanes(input in arb_lanes(), budget in 0usize..400) {
            let anchor_tokens: usize = input.anchor.facts.iter().map(estimate_tokens).sum();
            let world_tokens = input.item_tokens()
                - anchor_tokens
                - input.memory.entries.iter().map(estimate_tokens).sum::<usize>()
                - input.evidence.items.iter().map(estimate_tokens).sum::<usize>();
            let anchor_count = input.anchor.facts.len();
            let packet = compile(input, budget);
            if anchor_tokens + world_tokens <= budget {
                prop_assert_eq!(packet.anchor.facts.len(), anchor_count);
            }
        }
    }
}
