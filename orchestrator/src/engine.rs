//! The orchestration engine.
//!
//! One [`Engine::run`] drives a thread through the phase machine until EXIT:
//!
//! 1. INIT restores the latest checkpoint (or starts fresh) and opens a turn.
//! 2. CONTEXT_BUILD re-reads every lane from the world model and compiles a
//!    new packet. Nothing is carried over from the previous cycle.
//! 3. GATE_CHECK suspends the turn when the gate is blocked.
//! 4. PLAN asks the planner for one decision.
//! 5. TOOL_LOOP runs the queued tool, re-checks the gate and loops back to 2.
//! 6. EXIT writes a summary, persists the final checkpoint and returns the
//!    terminal payload.
//!
//! Checkpoints are written after a tool is queued, after a tool settles with
//! the gate still clear, and at EXIT. A crash between two checkpoints resumes
//! from the earlier one; the tool executor's replay log keeps a re-entered
//! TOOL_LOOP from running the same call twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use crate::core::budget::call_timeout;
use crate::core::compiler::{ContextPacket, compile};
use crate::core::decision::{PlannerDecision, decode_decision};
use crate::core::gate::{EvidenceStatus, GateResult, evaluate};
use crate::core::lanes::{LaneKind, LaneWarning};
use crate::core::machine::{Event, Phase, transition};
use crate::core::payload::{SummaryRecord, TerminalPayload};
use crate::core::types::{
    FailureSource, GraphState, IncomingMessage, RecentFailure, ThreadId, ToolCall,
};
use crate::error::{EngineError, ErrorKind, PlannerError, ToolError};
use crate::io::checkpoint::CheckpointStore;
use crate::io::config::OrchestratorConfig;
use crate::io::lanes::{LaneLimits, LaneRequest, assemble_lanes};
use crate::io::planner::{Planner, PlannerRequest};
use crate::io::tools::{ToolContext, ToolExecutor, ToolRegistry};
use crate::io::world_store::WorldModel;

/// Caller-owned cancellation flag, checked before every CONTEXT_BUILD.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub struct Engine<P: Planner, S: CheckpointStore> {
    config: OrchestratorConfig,
    planner: P,
    store: S,
    world: Arc<dyn WorldModel>,
    tools: ToolExecutor,
}

/// How the turn ends; decided before EXIT, rendered at EXIT.
#[derive(Debug)]
enum Ending {
    Finalized {
        answer: String,
        references: Vec<String>,
    },
    Question(String),
    Suspended(GateResult),
    CycleLimit,
    Failed {
        kind: ErrorKind,
        message: String,
    },
    Cancelled,
}

/// Mutable state of one `run` call.
struct Invocation {
    state: GraphState,
    /// Last state written to the store, if any.
    saved: Option<GraphState>,
    deadline: Instant,
    gate: Option<GateResult>,
    ending: Option<Ending>,
}

struct Observation {
    packet: ContextPacket,
    gate: GateResult,
}

impl<P: Planner, S: CheckpointStore> Engine<P, S> {
    pub fn new(
        config: OrchestratorConfig,
        planner: P,
        store: S,
        world: Arc<dyn WorldModel>,
        registry: ToolRegistry,
    ) -> Self {
        Self {
            config,
            planner,
            store,
            world,
            tools: ToolExecutor::new(registry),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn planner(&self) -> &P {
        &self.planner
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn world(&self) -> &Arc<dyn WorldModel> {
        &self.world
    }

    pub fn run(
        &self,
        thread_id: &ThreadId,
        message: IncomingMessage,
    ) -> Result<TerminalPayload, EngineError> {
        self.run_with_cancel(thread_id, message, &CancellationToken::new())
    }

    /// Drive one turn of `thread_id` to a terminal payload.
    ///
    /// Planner contract violations and unknown tools end the turn with a
    /// `FAILED` payload. Store and world-model failures, version mismatches,
    /// cancellation and concurrent invocations are returned as `Err`.
    #[instrument(skip_all, fields(thread = %thread_id))]
    pub fn run_with_cancel(
        &self,
        thread_id: &ThreadId,
        message: IncomingMessage,
        cancel: &CancellationToken,
    ) -> Result<TerminalPayload, EngineError> {
        let _claim = self.store.claim(thread_id)?;
        let (mut inv, event) = self.init(thread_id, message)?;
        let mut phase = transition(Phase::Init, event)?;
        loop {
            debug!(%phase, cycle = inv.state.cycle, "entering phase");
            let event = match phase {
                Phase::Init => {
                    return Err(EngineError::InvalidTransition {
                        phase: phase.to_string(),
                        event: "re-entry".to_string(),
                    });
                }
                Phase::ContextBuild => self.context_build(&mut inv, cancel),
                Phase::GateCheck => gate_check(&mut inv),
                Phase::Suspended => Event::Suspend,
                Phase::Plan => self.plan(&mut inv)?,
                Phase::ToolLoop => self.tool_loop(&mut inv)?,
                Phase::Exit => return self.exit(inv),
            };
            phase = transition(phase, event)?;
        }
    }

    /// Delete every checkpoint of `thread_id`. Fails while the thread is running.
    #[instrument(skip_all, fields(thread = %thread_id))]
    pub fn reset(&self, thread_id: &ThreadId) -> Result<usize, EngineError> {
        let _claim = self.store.claim(thread_id)?;
        Ok(self.store.reset(thread_id)?)
    }

    fn init(
        &self,
        thread_id: &ThreadId,
        message: IncomingMessage,
    ) -> Result<(Invocation, Event), EngineError> {
        let loaded = self.store.load_latest(thread_id)?;
        let (mut state, saved) = match loaded {
            Some(record) => {
                debug!(sequence = record.sequence, "restored checkpoint");
                (record.state.clone(), Some(record.state))
            }
            None => (GraphState::new(thread_id.clone()), None),
        };

        let event = if state.has_interrupted_turn() {
            info!(
                turn = state.turn,
                cycle = state.cycle,
                pending_tool = state.pending_tool.is_some(),
                "resuming interrupted turn"
            );
            state.message = Some(message);
            if state.pending_tool.is_some() {
                Event::ResumePendingTool
            } else {
                Event::TurnStarted
            }
        } else {
            state.begin_turn(message);
            info!(turn = state.turn, "turn started");
            Event::TurnStarted
        };

        let inv = Invocation {
            state,
            saved,
            deadline: Instant::now() + self.config.invocation_timeout(),
            gate: None,
            ending: None,
        };
        Ok((inv, event))
    }

    fn context_build(&self, inv: &mut Invocation, cancel: &CancellationToken) -> Event {
        if cancel.is_cancelled() {
            info!(cycle = inv.state.cycle, "cancellation requested");
            inv.ending = Some(Ending::Cancelled);
            return Event::Cancelled;
        }
        if inv.state.cycle >= self.config.max_cycles {
            warn!(max_cycles = self.config.max_cycles, "cycle limit reached");
            inv.ending = Some(Ending::CycleLimit);
            return Event::CycleLimitReached;
        }

        inv.state.cycle += 1;
        let cycle = inv.state.cycle;
        let observation = self.observe(&inv.state);
        for warning in &observation.packet.warnings {
            inv.state.push_failure(
                lane_failure(warning, cycle),
                self.config.recent_failures_limit,
            );
        }
        debug!(
            cycle,
            tokens_used = observation.packet.tokens_used,
            truncated = observation.packet.was_truncated(),
            blocked = observation.gate.blocked,
            "context compiled"
        );
        inv.state.context = Some(observation.packet);
        inv.gate = Some(observation.gate);
        Event::ContextCompiled
    }

    /// Assemble lanes, compile the packet and evaluate the gate.
    fn observe(&self, state: &GraphState) -> Observation {
        let message = current_message(state);
        let request = LaneRequest {
            run_id: state.thread_id.run_id(),
            message: &message,
            recent_failures: &state.recent_failures,
        };
        let limits = LaneLimits {
            recent_outcomes: self.config.recent_outcomes_limit,
            evidence: self.config.evidence_limit,
            memory: self.config.memory_limit,
        };
        let lanes = assemble_lanes(self.world.as_ref(), &request, &limits);
        // The gate sees the full snapshot even if the packet truncates it.
        let world = lanes.world.clone();
        let packet = compile(lanes, self.config.token_budget);
        let evidence = EvidenceStatus {
            request_kind: message.request_kind.clone(),
            found: packet.evidence.items.len(),
            required: self.config.gate.min_evidence_for(&message.request_kind),
        };
        let gate = evaluate(&world, &packet.anchor.status, &evidence);
        Observation { packet, gate }
    }

    #[instrument(skip_all, fields(cycle = inv.state.cycle))]
    fn plan(&self, inv: &mut Invocation) -> Result<Event, EngineError> {
        let Some(packet) = inv.state.context.as_ref() else {
            return Err(EngineError::InvalidTransition {
                phase: Phase::Plan.to_string(),
                event: "no compiled context".to_string(),
            });
        };
        let message = current_message(&inv.state);
        let specs = self.tools.registry().specs();
        let request = PlannerRequest {
            thread_id: &inv.state.thread_id,
            message: &message,
            packet,
            tools: &specs,
            cycle: inv.state.cycle,
        };
        let response = match call_timeout(
            inv.deadline,
            Instant::now(),
            self.config.planner_timeout(),
        ) {
            Ok(timeout) => self.planner.decide(&request, timeout),
            Err(_) => Err(PlannerError::Timeout { timeout_secs: 0 }),
        };
        let decision = response
            .and_then(|raw| decode_decision(&raw).map_err(PlannerError::ContractViolation));

        let decision = match decision {
            Ok(decision) => decision,
            Err(err) if err.is_transient() => {
                warn!(kind = %err.kind(), err = %err, "planner failed, retrying next cycle");
                let cycle = inv.state.cycle;
                inv.state.push_failure(
                    RecentFailure {
                        source: FailureSource::Planner,
                        message: err.to_string(),
                        cycle,
                    },
                    self.config.recent_failures_limit,
                );
                return Ok(Event::PlannerFailed);
            }
            Err(err) => {
                error!(kind = %err.kind(), err = %err, "planner broke its contract");
                inv.ending = Some(Ending::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                });
                return Ok(Event::Fatal);
            }
        };

        info!(decision = decision.kind(), "planner decided");
        match decision {
            PlannerDecision::ToolCall { name, arguments } => {
                if !self.tools.registry().contains(&name) {
                    let err = ToolError::UnknownTool(name);
                    error!(err = %err, "planner chose an unregistered tool");
                    inv.ending = Some(Ending::Failed {
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                    return Ok(Event::Fatal);
                }
                let invocation_key = inv.state.invocation_key(&name);
                inv.state.pending_tool = Some(ToolCall {
                    tool_name: name,
                    arguments,
                    invocation_key,
                });
                self.persist(inv, "tool queued")?;
                Ok(Event::ToolQueued)
            }
            PlannerDecision::UserQuestion { text } => {
                inv.ending = Some(Ending::Question(text));
                Ok(Event::Concluded)
            }
            PlannerDecision::Finalize { answer, references } => {
                inv.ending = Some(Ending::Finalized { answer, references });
                Ok(Event::Concluded)
            }
        }
    }

    #[instrument(skip_all, fields(cycle = inv.state.cycle))]
    fn tool_loop(&self, inv: &mut Invocation) -> Result<Event, EngineError> {
        let Some(call) = inv.state.pending_tool.clone() else {
            return Err(EngineError::InvalidTransition {
                phase: Phase::ToolLoop.to_string(),
                event: "no pending tool".to_string(),
            });
        };
        // A restored call may name a tool that is no longer registered.
        if !self.tools.registry().contains(&call.tool_name) {
            let err = ToolError::UnknownTool(call.tool_name);
            error!(err = %err, "queued tool is not registered");
            inv.ending = Some(Ending::Failed {
                kind: err.kind(),
                message: err.to_string(),
            });
            return Ok(Event::Fatal);
        }

        let timeout = call_timeout(inv.deadline, Instant::now(), self.config.tool_timeout())
            .unwrap_or(Duration::ZERO);
        let ctx = ToolContext {
            thread_id: inv.state.thread_id.clone(),
            world: Arc::clone(&self.world),
            timeout,
        };
        let dispatch = self
            .tools
            .execute_logged(&call, &ctx, inv.state.turn, inv.state.cycle, timeout)
            .map_err(EngineError::WorldModel)?;
        let outcome = dispatch.invocation().outcome();
        info!(
            tool = %outcome.tool_name,
            success = outcome.success,
            "tool settled"
        );

        inv.state.pending_tool = None;
        inv.state
            .push_outcome(outcome, self.config.recent_outcomes_limit);

        let observation = self.observe(&inv.state);
        if observation.gate.blocked {
            info!(
                reasons = observation.gate.reasons.len(),
                "gate blocked after tool"
            );
            inv.ending = Some(Ending::Suspended(observation.gate));
            return Ok(Event::ToolBlocked);
        }
        self.persist(inv, "tool settled")?;
        Ok(Event::ToolSettled)
    }

    #[instrument(skip_all, fields(cycle = inv.state.cycle))]
    fn exit(&self, mut inv: Invocation) -> Result<TerminalPayload, EngineError> {
        let Some(ending) = inv.ending.take() else {
            return Err(EngineError::InvalidTransition {
                phase: Phase::Exit.to_string(),
                event: "no ending recorded".to_string(),
            });
        };
        let cycles = inv.state.cycle;
        let payload = match ending {
            Ending::Cancelled => {
                self.persist(&mut inv, "cancelled")?;
                return Err(EngineError::Cancelled {
                    thread_id: inv.state.thread_id.to_string(),
                    next_cycle: cycles + 1,
                });
            }
            Ending::Finalized { answer, references } => TerminalPayload::completed(
                answer,
                &references,
                inv.state.context.as_ref(),
                cycles,
            ),
            Ending::Question(text) => TerminalPayload::question(text, cycles),
            Ending::Suspended(gate) => TerminalPayload::needs_review(&gate, cycles),
            Ending::CycleLimit => TerminalPayload::cycle_limit(cycles, self.config.max_cycles),
            Ending::Failed { kind, message } => TerminalPayload::failed(kind, message, cycles),
        };

        inv.state.terminal = true;
        inv.state.pending_tool = None;
        inv.state.last_payload = Some(payload.clone());

        let summary = SummaryRecord::from_turn(&inv.state, &payload);
        self.world
            .record_summary(inv.state.thread_id.run_id(), &summary)
            .map_err(EngineError::WorldModel)?;
        self.persist(&mut inv, "exit")?;
        if let Some(keep) = self.config.checkpoint_retention {
            self.store.prune(&inv.state.thread_id, keep)?;
        }

        info!(status = payload.status.as_str(), cycles, "turn finished");
        Ok(payload)
    }

    /// Write a checkpoint unless the state equals the last one written.
    fn persist(&self, inv: &mut Invocation, reason: &str) -> Result<(), EngineError> {
        if inv.saved.as_ref() == Some(&inv.state) {
            debug!(reason, "state unchanged, no checkpoint");
            return Ok(());
        }
        let sequence = self.store.save(&inv.state.thread_id, &inv.state)?;
        debug!(reason, sequence, "checkpoint saved");
        inv.saved = Some(inv.state.clone());
        Ok(())
    }
}

fn gate_check(inv: &mut Invocation) -> Event {
    match inv.gate.take() {
        Some(gate) if gate.blocked => {
            info!(reasons = gate.reasons.len(), "gate blocked");
            inv.ending = Some(Ending::Suspended(gate));
            Event::GateBlocked
        }
        _ => Event::GateClear,
    }
}

fn current_message(state: &GraphState) -> IncomingMessage {
    state
        .message
        .clone()
        .unwrap_or_else(|| IncomingMessage::new(String::new()))
}

fn lane_failure(warning: &LaneWarning, cycle: u32) -> RecentFailure {
    let source = match warning.lane {
        LaneKind::WorldSnapshot => FailureSource::WorldSnapshotLane,
        LaneKind::Anchor => FailureSource::AnchorLane,
        LaneKind::Memory => FailureSource::MemoryLane,
        LaneKind::Evidence => FailureSource::EvidenceLane,
    };
    RecentFailure {
        source,
        message: warning.message.clone(),
        cycle,
    }
}
