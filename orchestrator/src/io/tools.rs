//! Tool registry and executor.
//!
//! Every dispatch is validated against the tool's input schema, run with a
//! timeout, validated against its output schema and appended to the world
//! model's invocation log, whether it succeeds or not. A call whose
//! invocation key is already in the log is replayed from the log instead of
//! re-run, so resuming after a crash never repeats a side effect.
//!
//! A call that misses its deadline is reported as a timeout and cannot touch
//! the world model afterwards: the tool sees the world through a fence that
//! the executor closes at the deadline, and command-backed tools kill their
//! child process at the same deadline.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::payload::SummaryRecord;
use crate::core::types::{Idempotency, InvocationError, ThreadId, ToolCall, ToolInvocation};
use crate::core::world::{AnchorSet, MemoryRecord, ScoredSegment, WorldChange, WorldDocument};
use crate::error::ToolError;
use crate::io::config::ToolConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};
use crate::io::world_store::{WorldModel, WorldReader, WorldWriter};

/// How long a timed-out call may take to wind down before it is abandoned.
const TIMEOUT_GRACE: Duration = Duration::from_secs(2);

/// Declared shape of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub idempotency: Idempotency,
}

/// What a tool may touch while running.
#[derive(Clone)]
pub struct ToolContext {
    pub thread_id: ThreadId,
    pub world: Arc<dyn WorldModel>,
    /// Time the call may take. Work the tool starts outside this process
    /// must be stopped by then.
    pub timeout: Duration,
}

impl ToolContext {
    pub fn run_id(&self) -> &str {
        self.thread_id.run_id()
    }
}

pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;
    fn call(&self, ctx: &ToolContext, input: &Value) -> Result<Value>;
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    input: Validator,
    output: Validator,
}

/// Tools available to the planner, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let spec = tool.spec().clone();
        if spec.name.trim().is_empty() {
            bail!("tool name must be non-empty");
        }
        if self.tools.contains_key(&spec.name) {
            bail!("tool {} registered twice", spec.name);
        }
        let input = jsonschema::validator_for(&spec.input_schema)
            .map_err(|err| anyhow!("invalid input schema for {}: {}", spec.name, err))?;
        let output = jsonschema::validator_for(&spec.output_schema)
            .map_err(|err| anyhow!("invalid output schema for {}: {}", spec.name, err))?;
        self.tools.insert(
            spec.name,
            RegisteredTool {
                tool,
                input,
                output,
            },
        );
        Ok(())
    }

    pub fn from_config(tools: &[ToolConfig], output_limit_bytes: usize) -> Result<Self> {
        let mut registry = Self::new();
        for config in tools {
            registry
                .register(Arc::new(CommandTool::new(config, output_limit_bytes)))
                .with_context(|| format!("register tool {}", config.name))?;
        }
        Ok(registry)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Specs in name order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.tool.spec().clone()).collect()
    }
}

/// How a dispatch was satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Executed(ToolInvocation),
    /// Taken from the invocation log; the tool was not called again.
    Replayed(ToolInvocation),
}

impl Dispatch {
    pub fn invocation(&self) -> &ToolInvocation {
        match self {
            Dispatch::Executed(inv) | Dispatch::Replayed(inv) => inv,
        }
    }
}

pub struct ToolExecutor {
    registry: ToolRegistry,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Validate, run and validate the output of one call. Nothing is logged.
    pub fn execute(
        &self,
        name: &str,
        input: &Value,
        ctx: &ToolContext,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        let registered = self
            .registry
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let violations = schema_violations(&registered.input, input);
        if !violations.is_empty() {
            return Err(ToolError::InputInvalid {
                tool: name.to_string(),
                messages: violations,
            });
        }

        let output = call_with_timeout(
            Arc::clone(&registered.tool),
            ctx.clone(),
            input.clone(),
            timeout,
        )?;

        let violations = schema_violations(&registered.output, &output);
        if !violations.is_empty() {
            return Err(ToolError::OutputInvalid {
                tool: name.to_string(),
                messages: violations,
            });
        }
        Ok(output)
    }

    /// Execute `call` (or replay it from the log) and record the invocation.
    ///
    /// Tool failures are part of the returned invocation. `Err` means the
    /// invocation log itself could not be read or written.
    #[instrument(skip_all, fields(tool = %call.tool_name, key = %call.invocation_key))]
    pub fn execute_logged(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        turn: u32,
        cycle: u32,
        timeout: Duration,
    ) -> Result<Dispatch> {
        if let Some(previous) = ctx
            .world
            .find_invocation(ctx.run_id(), &call.invocation_key)
            .context("look up invocation log")?
        {
            info!(
                idempotency = ?self.idempotency(&call.tool_name),
                "invocation already logged, replaying recorded result"
            );
            return Ok(Dispatch::Replayed(previous));
        }

        let started = Instant::now();
        let result = if timeout.is_zero() {
            Err(ToolError::Timeout {
                tool: call.tool_name.clone(),
                timeout_ms: 0,
            })
        } else {
            self.execute(&call.tool_name, &call.arguments, ctx, timeout)
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (output, error) = match result {
            Ok(output) => {
                debug!(duration_ms, "tool succeeded");
                (Some(output), None)
            }
            Err(err) => {
                warn!(kind = %err.kind(), err = %err, "tool failed");
                (
                    None,
                    Some(InvocationError {
                        kind: err.kind(),
                        message: err.to_string(),
                    }),
                )
            }
        };
        let invocation = ToolInvocation {
            invocation_key: call.invocation_key.clone(),
            thread_id: ctx.thread_id.to_string(),
            turn,
            cycle,
            tool_name: call.tool_name.clone(),
            input: call.arguments.clone(),
            output,
            error,
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_ms,
        };
        ctx.world
            .record_invocation(ctx.run_id(), &invocation)
            .context("append invocation log")?;
        Ok(Dispatch::Executed(invocation))
    }

    fn idempotency(&self, name: &str) -> Option<Idempotency> {
        self.registry
            .tools
            .get(name)
            .map(|t| t.tool.spec().idempotency)
    }
}

fn schema_violations(validator: &Validator, value: &Value) -> Vec<String> {
    validator.iter_errors(value).map(|err| err.to_string()).collect()
}

/// Run the tool on its own thread and stop waiting after `timeout`.
///
/// At the deadline the tool's world writes are closed, and the executor
/// waits up to [`TIMEOUT_GRACE`] for it to wind down. A tool still running
/// after that is detached; its eventual result is discarded.
fn call_with_timeout(
    tool: Arc<dyn Tool>,
    ctx: ToolContext,
    input: Value,
    timeout: Duration,
) -> Result<Value, ToolError> {
    let name = tool.spec().name.clone();
    let open = Arc::new(RwLock::new(true));
    let scoped = ToolContext {
        thread_id: ctx.thread_id,
        world: Arc::new(FencedWorld {
            inner: ctx.world,
            open: Arc::clone(&open),
        }),
        timeout,
    };
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("tool-{name}"))
        .spawn(move || {
            let result = tool.call(&scoped, &input);
            // Receiver is gone once the grace period is over.
            let _ = tx.send(result);
        })
        .map_err(|err| ToolError::Failed {
            tool: name.clone(),
            message: format!("spawn tool thread: {err}"),
        })?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(ToolError::Failed {
            tool: name,
            message: format!("{err:#}"),
        }),
        Err(RecvTimeoutError::Disconnected) => Err(ToolError::Failed {
            tool: name,
            message: "tool panicked".to_string(),
        }),
        Err(RecvTimeoutError::Timeout) => {
            // Blocks until an in-progress write finishes; later writes fail.
            *open.write().unwrap_or_else(PoisonError::into_inner) = false;
            match rx.recv_timeout(TIMEOUT_GRACE) {
                Ok(_) => debug!(tool = %name, "timed-out tool wound down"),
                Err(_) => warn!(
                    tool = %name,
                    "timed-out tool still running, abandoned with world writes closed"
                ),
            }
            Err(ToolError::Timeout {
                tool: name,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }
}

/// World handle lent to a running tool. Writes are refused once the
/// executor has given up on the call.
struct FencedWorld {
    inner: Arc<dyn WorldModel>,
    open: Arc<RwLock<bool>>,
}

impl FencedWorld {
    fn write<T>(&self, op: impl FnOnce(&dyn WorldModel) -> Result<T>) -> Result<T> {
        let open = self.open.read().unwrap_or_else(PoisonError::into_inner);
        if !*open {
            bail!("tool call timed out; world writes are closed");
        }
        op(self.inner.as_ref())
    }
}

impl WorldReader for FencedWorld {
    fn world_state(&self, run_id: &str) -> Result<WorldDocument> {
        self.inner.world_state(run_id)
    }

    fn anchor_facts(&self, run_id: &str) -> Result<AnchorSet> {
        self.inner.anchor_facts(run_id)
    }

    fn memory(&self, run_id: &str) -> Result<Vec<MemoryRecord>> {
        self.inner.memory(run_id)
    }

    fn search_evidence(
        &self,
        run_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredSegment>> {
        self.inner.search_evidence(run_id, query, limit)
    }

    fn recent_invocations(&self, run_id: &str, limit: usize) -> Result<Vec<ToolInvocation>> {
        self.inner.recent_invocations(run_id, limit)
    }

    fn invocation_count(&self, run_id: &str) -> Result<usize> {
        self.inner.invocation_count(run_id)
    }

    fn find_invocation(
        &self,
        run_id: &str,
        invocation_key: &str,
    ) -> Result<Option<ToolInvocation>> {
        self.inner.find_invocation(run_id, invocation_key)
    }
}

impl WorldWriter for FencedWorld {
    fn apply_change(&self, run_id: &str, change: &WorldChange) -> Result<()> {
        self.write(|world| world.apply_change(run_id, change))
    }

    fn record_invocation(&self, run_id: &str, invocation: &ToolInvocation) -> Result<()> {
        self.write(|world| world.record_invocation(run_id, invocation))
    }

    fn record_summary(&self, run_id: &str, summary: &SummaryRecord) -> Result<()> {
        self.write(|world| world.record_summary(run_id, summary))
    }
}

/// Tool backed by an external command: JSON input on stdin, JSON output on stdout.
pub struct CommandTool {
    spec: ToolSpec,
    argv: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandTool {
    pub fn new(config: &ToolConfig, output_limit_bytes: usize) -> Self {
        Self {
            spec: ToolSpec {
                name: config.name.clone(),
                description: config.description.clone(),
                input_schema: config.input_schema.clone(),
                output_schema: config.output_schema.clone(),
                idempotency: config.idempotency,
            },
            argv: config.command.clone(),
            output_limit_bytes,
        }
    }
}

impl Tool for CommandTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn call(&self, ctx: &ToolContext, input: &Value) -> Result<Value> {
        let mut cmd = command_from_argv(&self.argv)?;
        cmd.env("ORCHESTRATOR_THREAD_ID", ctx.thread_id.to_string())
            .env("ORCHESTRATOR_RUN_ID", ctx.run_id());
        let stdin = serde_json::to_vec(input).context("serialize tool input")?;
        let output = run_command_with_timeout(cmd, &stdin, ctx.timeout, self.output_limit_bytes)?;
        if output.timed_out {
            bail!(
                "{} killed after {}ms",
                self.spec.name,
                ctx.timeout.as_millis()
            );
        }
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.spec.name,
                output.status,
                output.stderr_tail()
            );
        }
        if output.stdout_truncated > 0 {
            bail!(
                "{} output exceeded {} bytes",
                self.spec.name,
                self.output_limit_bytes
            );
        }
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("parse {} output as JSON", self.spec.name))
    }
}
