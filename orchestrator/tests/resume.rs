//! Crash/resume equivalence.
//!
//! A thread that dies on its k-th checkpoint write and is resumed by a fresh
//! engine must end in the same terminal payload as an uninterrupted thread,
//! without running a non-idempotent tool twice.

use std::sync::Arc;

use serde_json::json;

use orchestrator::core::payload::{TerminalPayload, TerminalStatus};
use orchestrator::core::types::{Idempotency, IncomingMessage, ThreadId};
use orchestrator::core::world::WorldChange;
use orchestrator::error::EngineError;
use orchestrator::io::config::OrchestratorConfig;
use orchestrator::io::world_store::{WorldReader, WorldWriter};
use orchestrator::test_support::{
    CrashingStore, FnTool, ScriptedPlanner, TestHarness, finalize, registry_with, tool_call,
    tool_spec,
};

const RUN: &str = "run-1";

fn thread_id() -> ThreadId {
    ThreadId::new(RUN, "chat").expect("thread id")
}

fn message() -> IncomingMessage {
    IncomingMessage::new("record the payroll note and report the total")
}

/// Appends a memory note on every real execution.
fn note_tool() -> Arc<FnTool> {
    Arc::new(FnTool::new(
        tool_spec("append_note", Idempotency::NonIdempotent),
        |ctx, input| {
            let count = ctx.world.world_state(ctx.run_id())?.memory.len();
            ctx.world.apply_change(
                ctx.run_id(),
                &WorldChange::AddMemory {
                    memory_id: format!("note-{}", count + 1),
                    text: input["text"].as_str().unwrap_or_default().to_string(),
                },
            )?;
            Ok(json!({"notes": count + 1}))
        },
    ))
}

fn decisions() -> Vec<serde_json::Value> {
    vec![
        tool_call("append_note", json!({"text": "payroll reviewed"})),
        finalize("total is 4200", &[]),
    ]
}

fn script() -> ScriptedPlanner {
    ScriptedPlanner::decisions(decisions())
}

struct Outcome {
    payload: TerminalPayload,
    tool_calls: usize,
    logged: usize,
    notes: usize,
}

fn uninterrupted() -> Outcome {
    let h = TestHarness::new().expect("harness");
    let tool = note_tool();
    let engine = h.engine(
        OrchestratorConfig::default(),
        script(),
        registry_with(&[Arc::clone(&tool)]),
    );
    let payload = engine.run(&thread_id(), message()).expect("run");
    Outcome {
        payload,
        tool_calls: tool.calls(),
        logged: h.world().invocation_count(RUN).expect("count"),
        notes: h.world().world_state(RUN).expect("world").memory.len(),
    }
}

/// Crash on the `fail_on`-th save, then resume with a fresh engine whose
/// planner continues the script after the `durable` decisions the last
/// successful checkpoint already reflects.
fn crash_then_resume(fail_on: u64, durable: usize) -> Outcome {
    let h = TestHarness::new().expect("harness");
    let tool = note_tool();

    let crashing = h.engine_with_store(
        OrchestratorConfig::default(),
        script(),
        CrashingStore::new(h.store(), fail_on),
        registry_with(&[Arc::clone(&tool)]),
    );
    let err = crashing
        .run(&thread_id(), message())
        .expect_err("simulated crash");
    assert!(matches!(err, EngineError::Checkpoint(_)));
    assert!(crashing.planner().calls() >= durable);
    drop(crashing);

    let remaining = ScriptedPlanner::decisions(decisions().into_iter().skip(durable).collect());
    let resumed = h.engine(
        OrchestratorConfig::default(),
        remaining,
        registry_with(&[Arc::clone(&tool)]),
    );
    let payload = resumed.run(&thread_id(), message()).expect("resume");
    assert_eq!(resumed.planner().remaining(), 0);

    Outcome {
        payload,
        tool_calls: tool.calls(),
        logged: h.world().invocation_count(RUN).expect("count"),
        notes: h.world().world_state(RUN).expect("world").memory.len(),
    }
}

fn assert_equivalent(resumed: &Outcome, baseline: &Outcome) {
    assert_eq!(resumed.payload, baseline.payload);
    assert_eq!(resumed.tool_calls, baseline.tool_calls);
    assert_eq!(resumed.logged, baseline.logged);
    assert_eq!(resumed.notes, baseline.notes);
}

#[test]
fn baseline_runs_the_tool_once_and_completes() {
    let baseline = uninterrupted();
    assert_eq!(baseline.payload.status, TerminalStatus::Completed);
    assert_eq!(baseline.payload.cycles, 2);
    assert_eq!(baseline.tool_calls, 1);
    assert_eq!(baseline.logged, 1);
    assert_eq!(baseline.notes, 1);
}

/// Nothing durable exists yet, so the resumed run starts the turn over.
#[test]
fn crash_before_the_pre_tool_checkpoint_restarts_the_turn() {
    let resumed = crash_then_resume(1, 0);
    assert_equivalent(&resumed, &uninterrupted());
}

/// The tool already ran and was logged when the post-tool write failed; the
/// resumed TOOL_LOOP replays it from the log instead of running it again.
#[test]
fn crash_after_the_tool_ran_replays_instead_of_rerunning() {
    let resumed = crash_then_resume(2, 1);
    assert_equivalent(&resumed, &uninterrupted());
}

/// The finalize decision was lost with the exit checkpoint; the resumed run
/// asks the planner again on the same cycle.
#[test]
fn crash_on_the_exit_checkpoint_finishes_on_resume() {
    let resumed = crash_then_resume(3, 1);
    assert_equivalent(&resumed, &uninterrupted());
}
