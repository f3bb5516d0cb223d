//! Lane assemblers: read the world model into the four typed lanes.
//!
//! Lanes are assembled in a fixed order (World Snapshot, Anchor, Memory,
//! Evidence). A lane whose read fails degrades to an empty lane plus a
//! [`LaneWarning`]; only the anchor lane's failure can block the gate, via
//! [`AnchorStatus::Unavailable`](crate::core::lanes::AnchorStatus).

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::lanes::{
    AnchorLane, ContradictionView, EvidenceItem, EvidenceLane, LaneKind, LaneSet, LaneWarning,
    LockView, MemoryEntry, MemoryLane, OutcomeView, TaskView, WorldCounters, WorldSnapshot,
};
use crate::core::types::{IncomingMessage, RecentFailure};
use crate::io::world_store::WorldReader;

/// What the assemblers need to know about the current turn.
#[derive(Debug, Clone, Copy)]
pub struct LaneRequest<'a> {
    pub run_id: &'a str,
    pub message: &'a IncomingMessage,
    pub recent_failures: &'a [RecentFailure],
}

#[derive(Debug, Clone, Copy)]
pub struct LaneLimits {
    pub recent_outcomes: usize,
    pub evidence: usize,
    pub memory: usize,
}

#[instrument(skip_all, fields(run_id = request.run_id))]
pub fn assemble_lanes<W: WorldReader + ?Sized>(
    world: &W,
    request: &LaneRequest<'_>,
    limits: &LaneLimits,
) -> LaneSet {
    let mut warnings = Vec::new();

    let snapshot = world_snapshot_lane(world, request, limits).unwrap_or_else(|err| {
        degrade(&mut warnings, LaneKind::WorldSnapshot, &err);
        let mut empty = WorldSnapshot::empty(request.run_id, request.message.issue_key.clone());
        empty.recent_failures = request.recent_failures.to_vec();
        empty
    });

    let anchor = anchor_lane(world, request).unwrap_or_else(|err| {
        degrade(&mut warnings, LaneKind::Anchor, &err);
        AnchorLane::unavailable(format!("{err:#}"))
    });

    let memory = memory_lane(world, request, limits).unwrap_or_else(|err| {
        degrade(&mut warnings, LaneKind::Memory, &err);
        MemoryLane::default()
    });

    let evidence = evidence_lane(world, request, limits).unwrap_or_else(|err| {
        degrade(&mut warnings, LaneKind::Evidence, &err);
        EvidenceLane {
            query: request.message.text.clone(),
            items: Vec::new(),
        }
    });

    debug!(
        locks = snapshot.active_locks.len(),
        anchor_facts = anchor.facts.len(),
        memory = memory.entries.len(),
        evidence = evidence.items.len(),
        warnings = warnings.len(),
        "lanes assembled"
    );
    LaneSet {
        world: snapshot,
        anchor,
        memory,
        evidence,
        warnings,
    }
}

fn degrade(warnings: &mut Vec<LaneWarning>, lane: LaneKind, err: &anyhow::Error) {
    warn!(%lane, err = %format!("{err:#}"), "lane read failed, continuing without it");
    warnings.push(LaneWarning {
        lane,
        message: format!("{err:#}"),
    });
}

fn world_snapshot_lane<W: WorldReader + ?Sized>(
    world: &W,
    request: &LaneRequest<'_>,
    limits: &LaneLimits,
) -> Result<WorldSnapshot> {
    let document = world.world_state(request.run_id)?;
    let recent = world.recent_invocations(request.run_id, limits.recent_outcomes)?;
    let invocation_count = world.invocation_count(request.run_id)?;

    let active_locks: Vec<LockView> = document
        .active_locks()
        .map(|lock| LockView {
            lock_id: lock.lock_id.clone(),
            issue_key: lock.issue_key.clone(),
            reason: lock.reason.clone(),
        })
        .collect();
    let open_tasks: Vec<TaskView> = document
        .open_tasks()
        .map(|task| TaskView {
            task_id: task.task_id.clone(),
            issue_key: task.issue_key.clone(),
            title: task.title.clone(),
        })
        .collect();
    let open_contradictions: Vec<ContradictionView> = document
        .open_contradictions()
        .map(|c| ContradictionView {
            contradiction_id: c.contradiction_id.clone(),
            issue_key: c.issue_key.clone(),
            summary: c.summary.clone(),
            severity: c.severity,
        })
        .collect();

    Ok(WorldSnapshot {
        run_id: request.run_id.to_string(),
        current_issue_key: request.message.issue_key.clone(),
        counters: WorldCounters {
            active_locks: active_locks.len(),
            open_tasks: open_tasks.len(),
            open_contradictions: open_contradictions.len(),
            anchor_facts: document.anchor_facts.len(),
            evidence_segments: document.evidence.len(),
            tool_invocations: invocation_count,
        },
        active_locks,
        open_tasks,
        open_contradictions,
        last_tool_outcomes: recent
            .iter()
            .map(|inv| OutcomeView {
                tool_name: inv.tool_name.clone(),
                success: inv.succeeded(),
                summary: inv.summary(),
            })
            .collect(),
        recent_failures: request.recent_failures.to_vec(),
    })
}

fn anchor_lane<W: WorldReader + ?Sized>(world: &W, request: &LaneRequest<'_>) -> Result<AnchorLane> {
    let anchor = world.anchor_facts(request.run_id)?;
    Ok(AnchorLane::from_facts(&anchor.required, anchor.facts))
}

fn memory_lane<W: WorldReader + ?Sized>(
    world: &W,
    request: &LaneRequest<'_>,
    limits: &LaneLimits,
) -> Result<MemoryLane> {
    let records = world.memory(request.run_id)?;
    let skip = records.len().saturating_sub(limits.memory);
    Ok(MemoryLane {
        entries: records
            .into_iter()
            .skip(skip)
            .map(|record| MemoryEntry {
                memory_id: record.memory_id,
                source: record.source,
                text: record.text,
            })
            .collect(),
    })
}

fn evidence_lane<W: WorldReader + ?Sized>(
    world: &W,
    request: &LaneRequest<'_>,
    limits: &LaneLimits,
) -> Result<EvidenceLane> {
    let query = request.message.text.clone();
    let hits = world.search_evidence(request.run_id, &query, limits.evidence)?;
    Ok(EvidenceLane {
        query,
        items: hits
            .into_iter()
            .map(|hit| EvidenceItem {
                citation_id: hit.segment.segment_id,
                content: hit.segment.content,
                source_file: hit.segment.source_file,
                page_number: hit.segment.page_number,
                row_number: hit.segment.row_number,
                score: hit.score,
            })
            .collect(),
    })
}
