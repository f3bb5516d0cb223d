//! Test doubles and fixtures for engine, lane and executor tests.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::compiler::ContextPacket;
use crate::core::lanes::LaneKind;
use crate::core::payload::SummaryRecord;
use crate::core::types::{GraphState, Idempotency, ThreadId, ToolInvocation};
use crate::core::world::{AnchorSet, MemoryRecord, ScoredSegment, WorldChange, WorldDocument};
use crate::engine::Engine;
use crate::error::{CheckpointError, EngineError, PlannerError};
use crate::io::checkpoint::{CheckpointMeta, CheckpointRecord, CheckpointStore, FileCheckpointStore};
use crate::io::config::OrchestratorConfig;
use crate::io::in_flight::ThreadClaim;
use crate::io::paths::{InitOptions, OrchestratorPaths, init_workspace};
use crate::io::planner::{Planner, PlannerRequest};
use crate::io::tools::{Tool, ToolContext, ToolRegistry, ToolSpec};
use crate::io::world_store::{FileWorldModel, WorldModel, WorldReader, WorldWriter};

/// `ToolSpec` with permissive object schemas for both input and output.
pub fn tool_spec(name: &str, idempotency: Idempotency) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: format!("{name} test tool"),
        input_schema: json!({"type": "object"}),
        output_schema: json!({"type": "object"}),
        idempotency,
    }
}

type ToolFn = dyn Fn(&ToolContext, &Value) -> Result<Value> + Send + Sync;

/// In-process tool backed by a closure; counts how often it actually ran.
pub struct FnTool {
    spec: ToolSpec,
    func: Box<ToolFn>,
    calls: AtomicUsize,
}

impl FnTool {
    pub fn new<F>(spec: ToolSpec, func: F) -> Self
    where
        F: Fn(&ToolContext, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            spec,
            func: Box::new(func),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Tool for FnTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn call(&self, ctx: &ToolContext, input: &Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.func)(ctx, input)
    }
}

/// Registry holding the given tools.
pub fn registry_with(tools: &[Arc<FnTool>]) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry
            .register(Arc::clone(tool) as Arc<dyn Tool>)
            .expect("register test tool");
    }
    registry
}

/// Wraps a file world model and fails the reads behind selected lanes.
pub struct FlakyWorld {
    inner: Arc<FileWorldModel>,
    failing: Mutex<BTreeSet<LaneKind>>,
}

impl FlakyWorld {
    pub fn new(inner: Arc<FileWorldModel>) -> Self {
        Self {
            inner,
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn fail_lane(&self, lane: LaneKind) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(lane);
    }

    pub fn heal_lane(&self, lane: LaneKind) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&lane);
    }

    fn check(&self, lane: LaneKind) -> Result<()> {
        let failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        if failing.contains(&lane) {
            return Err(anyhow!("{lane} source unreachable"));
        }
        Ok(())
    }
}

impl WorldReader for FlakyWorld {
    fn world_state(&self, run_id: &str) -> Result<WorldDocument> {
        self.check(LaneKind::WorldSnapshot)?;
        self.inner.world_state(run_id)
    }

    fn anchor_facts(&self, run_id: &str) -> Result<AnchorSet> {
        self.check(LaneKind::Anchor)?;
        self.inner.anchor_facts(run_id)
    }

    fn memory(&self, run_id: &str) -> Result<Vec<MemoryRecord>> {
        self.check(LaneKind::Memory)?;
        self.inner.memory(run_id)
    }

    fn search_evidence(
        &self,
        run_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredSegment>> {
        self.check(LaneKind::Evidence)?;
        self.inner.search_evidence(run_id, query, limit)
    }

    fn recent_invocations(&self, run_id: &str, limit: usize) -> Result<Vec<ToolInvocation>> {
        self.check(LaneKind::WorldSnapshot)?;
        self.inner.recent_invocations(run_id, limit)
    }

    fn invocation_count(&self, run_id: &str) -> Result<usize> {
        self.check(LaneKind::WorldSnapshot)?;
        self.inner.invocation_count(run_id)
    }

    // Replay lookups belong to the executor, not a lane.
    fn find_invocation(
        &self,
        run_id: &str,
        invocation_key: &str,
    ) -> Result<Option<ToolInvocation>> {
        self.inner.find_invocation(run_id, invocation_key)
    }
}

impl WorldWriter for FlakyWorld {
    fn apply_change(&self, run_id: &str, change: &WorldChange) -> Result<()> {
        self.inner.apply_change(run_id, change)
    }

    fn record_invocation(&self, run_id: &str, invocation: &ToolInvocation) -> Result<()> {
        self.inner.record_invocation(run_id, invocation)
    }

    fn record_summary(&self, run_id: &str, summary: &SummaryRecord) -> Result<()> {
        self.inner.record_summary(run_id, summary)
    }
}

/// `{"type": "finalize", ...}`
pub fn finalize(answer: &str, references: &[&str]) -> Value {
    json!({"type": "finalize", "answer": answer, "references": references})
}

/// `{"type": "tool_call", ...}`
pub fn tool_call(name: &str, arguments: Value) -> Value {
    json!({"type": "tool_call", "name": name, "arguments": arguments})
}

/// `{"type": "user_question", ...}`
pub fn question(text: &str) -> Value {
    json!({"type": "user_question", "text": text})
}

/// Planner that replays a fixed list of responses and records every packet it saw.
pub struct ScriptedPlanner {
    responses: Mutex<VecDeque<Result<Value, PlannerError>>>,
    packets: Mutex<Vec<ContextPacket>>,
}

impl ScriptedPlanner {
    pub fn new(responses: Vec<Result<Value, PlannerError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            packets: Mutex::new(Vec::new()),
        }
    }

    /// Planner returning each decision once, in order.
    pub fn decisions(decisions: Vec<Value>) -> Self {
        Self::new(decisions.into_iter().map(Ok).collect())
    }

    pub fn calls(&self) -> usize {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn packets(&self) -> Vec<ContextPacket> {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Planner for ScriptedPlanner {
    fn decide(
        &self,
        request: &PlannerRequest<'_>,
        _timeout: Duration,
    ) -> Result<Value, PlannerError> {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.packet.clone());
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Err(PlannerError::Unavailable("script exhausted".to_string())))
    }
}

type PlannerFn = dyn Fn(&PlannerRequest<'_>) -> Result<Value, PlannerError> + Send + Sync;

/// Planner computing every decision from the request.
pub struct FnPlanner {
    func: Box<PlannerFn>,
    calls: AtomicUsize,
}

impl FnPlanner {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&PlannerRequest<'_>) -> Result<Value, PlannerError> + Send + Sync + 'static,
    {
        Self {
            func: Box::new(func),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Planner for FnPlanner {
    fn decide(
        &self,
        request: &PlannerRequest<'_>,
        _timeout: Duration,
    ) -> Result<Value, PlannerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.func)(request)
    }
}

/// File store whose `fail_on`-th save (1-based) fails without writing,
/// standing in for a process that dies mid-invocation.
pub struct CrashingStore {
    inner: FileCheckpointStore,
    fail_on: u64,
    saves: AtomicU64,
}

impl CrashingStore {
    pub fn new(inner: FileCheckpointStore, fail_on: u64) -> Self {
        Self {
            inner,
            fail_on,
            saves: AtomicU64::new(0),
        }
    }

    /// Save attempts so far, including the failed one.
    pub fn attempts(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }
}

impl CheckpointStore for CrashingStore {
    fn save(&self, thread_id: &ThreadId, state: &GraphState) -> Result<u64, CheckpointError> {
        let attempt = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == self.fail_on {
            return Err(CheckpointError::Io(anyhow!(
                "simulated crash on save {attempt}"
            )));
        }
        self.inner.save(thread_id, state)
    }

    fn load_latest(&self, thread_id: &ThreadId) -> Result<Option<CheckpointRecord>, CheckpointError> {
        self.inner.load_latest(thread_id)
    }

    fn list(&self, thread_id: &ThreadId) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        self.inner.list(thread_id)
    }

    fn prune(&self, thread_id: &ThreadId, keep: usize) -> Result<usize, CheckpointError> {
        self.inner.prune(thread_id, keep)
    }

    fn reset(&self, thread_id: &ThreadId) -> Result<usize, CheckpointError> {
        self.inner.reset(thread_id)
    }

    fn reset_run(&self, run_id: &str) -> Result<usize, CheckpointError> {
        self.inner.reset_run(run_id)
    }

    fn threads(&self) -> Result<Vec<ThreadId>, CheckpointError> {
        self.inner.threads()
    }

    fn claim(&self, thread_id: &ThreadId) -> Result<ThreadClaim, EngineError> {
        self.inner.claim(thread_id)
    }
}

/// Initialized workspace in a temp dir with a file world model and checkpoint store.
pub struct TestHarness {
    temp: TempDir,
    paths: OrchestratorPaths,
    world: Arc<FileWorldModel>,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let paths = init_workspace(temp.path(), &InitOptions { force: false })?;
        let world = Arc::new(FileWorldModel::new(&paths.world_dir));
        Ok(Self { temp, paths, world })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> &OrchestratorPaths {
        &self.paths
    }

    pub fn world(&self) -> Arc<FileWorldModel> {
        Arc::clone(&self.world)
    }

    pub fn store(&self) -> FileCheckpointStore {
        FileCheckpointStore::new(&self.paths.checkpoints_dir)
    }

    pub fn seed(&self, run_id: &str, changes: &[WorldChange]) -> Result<()> {
        for change in changes {
            self.world.apply_change(run_id, change)?;
        }
        Ok(())
    }

    /// Engine over this harness's file store and world model.
    pub fn engine<P: Planner>(
        &self,
        config: OrchestratorConfig,
        planner: P,
        registry: ToolRegistry,
    ) -> Engine<P, FileCheckpointStore> {
        self.engine_with_store(config, planner, self.store(), registry)
    }

    pub fn engine_with_store<P: Planner, S: CheckpointStore>(
        &self,
        config: OrchestratorConfig,
        planner: P,
        store: S,
        registry: ToolRegistry,
    ) -> Engine<P, S> {
        let world: Arc<dyn WorldModel> = self.world();
        Engine::new(config, planner, store, world, registry)
    }
}
