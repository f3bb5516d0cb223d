//! Shared deterministic types for the orchestration core.
//!
//! These types are persisted inside checkpoints, so their serde
//! representations are part of the on-disk contract. Bump [`STATE_VERSION`]
//! whenever `GraphState` changes incompatibly.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::compiler::ContextPacket;
use crate::core::payload::TerminalPayload;
use crate::error::{EngineError, ErrorKind};

/// Schema version stamped into every checkpoint.
pub const STATE_VERSION: u32 = 1;

/// Request kind assumed when the caller does not name one.
pub const DEFAULT_REQUEST_KIND: &str = "general";

const OUTCOME_SUMMARY_CHARS: usize = 120;

/// Identity of a resumable thread: `"{run_id}:{session_id}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThreadId {
    run_id: String,
    session_id: String,
}

impl ThreadId {
    pub fn new(run_id: &str, session_id: &str) -> Result<Self, EngineError> {
        let value = format!("{run_id}:{session_id}");
        let invalid = |reason: &str| EngineError::InvalidThreadId {
            value: value.clone(),
            reason: reason.to_string(),
        };
        if run_id.trim().is_empty() {
            return Err(invalid("run id is empty"));
        }
        if session_id.trim().is_empty() {
            return Err(invalid("session id is empty"));
        }
        if run_id.contains(':') {
            return Err(invalid("run id must not contain ':'"));
        }
        if value.chars().any(char::is_control) {
            return Err(invalid("control characters are not allowed"));
        }
        Ok(Self {
            run_id: run_id.to_string(),
            session_id: session_id.to_string(),
        })
    }

    /// Parse the `run:session` form. The first `:` separates the parts.
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        let Some((run_id, session_id)) = value.split_once(':') else {
            return Err(EngineError::InvalidThreadId {
                value: value.to_string(),
                reason: "expected '<run_id>:<session_id>'".to_string(),
            });
        };
        Self::new(run_id, session_id)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.run_id, self.session_id)
    }
}

impl TryFrom<String> for ThreadId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ThreadId> for String {
    fn from(value: ThreadId) -> Self {
        value.to_string()
    }
}

/// A user turn handed to `Engine::run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub text: String,
    /// Issue the turn concerns; scopes decision-lock gating.
    #[serde(default)]
    pub issue_key: Option<String>,
    /// Selects the minimum-evidence threshold applied by the gate.
    #[serde(default = "default_request_kind")]
    pub request_kind: String,
}

fn default_request_kind() -> String {
    DEFAULT_REQUEST_KIND.to_string()
}

impl IncomingMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            issue_key: None,
            request_kind: default_request_kind(),
        }
    }

    pub fn with_issue_key(mut self, issue_key: impl Into<String>) -> Self {
        self.issue_key = Some(issue_key.into());
        self
    }

    pub fn with_request_kind(mut self, request_kind: impl Into<String>) -> Self {
        self.request_kind = request_kind.into();
        self
    }
}

/// Whether replaying a tool with the same input is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Idempotency {
    #[default]
    Idempotent,
    NonIdempotent,
}

/// A tool call the planner requested and the engine has queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: Value,
    /// `{thread}/{turn}/{cycle}/{tool}`; identifies the call across resumes.
    pub invocation_key: String,
}

/// Compact record of a settled tool call kept in the rolling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool_name: String,
    pub success: bool,
    pub summary: String,
    pub turn: u32,
    pub cycle: u32,
}

/// Where a transient failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSource {
    Planner,
    WorldSnapshotLane,
    AnchorLane,
    MemoryLane,
    EvidenceLane,
}

/// Transient failure fed back to the planner through the World Snapshot lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentFailure {
    pub source: FailureSource,
    pub message: String,
    pub cycle: u32,
}

/// Error recorded on a failed tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Append-only log entry for one tool dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub invocation_key: String,
    pub thread_id: String,
    pub turn: u32,
    pub cycle: u32,
    pub tool_name: String,
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<InvocationError>,
    /// RFC 3339 timestamp taken when the call settled.
    pub timestamp: String,
    pub duration_ms: u64,
}

impl ToolInvocation {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// One-line summary used in outcomes and the World Snapshot lane.
    pub fn summary(&self) -> String {
        match (&self.output, &self.error) {
            (_, Some(err)) => truncate_chars(&format!("{}: {}", err.kind, err.message)),
            (Some(output), None) => truncate_chars(&output.to_string()),
            (None, None) => String::new(),
        }
    }

    pub fn outcome(&self) -> ToolOutcome {
        ToolOutcome {
            tool_name: self.tool_name.clone(),
            success: self.succeeded(),
            summary: self.summary(),
            turn: self.turn,
            cycle: self.cycle,
        }
    }
}

fn truncate_chars(text: &str) -> String {
    if text.chars().count() <= OUTCOME_SUMMARY_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(OUTCOME_SUMMARY_CHARS).collect();
    out.push_str("...");
    out
}

/// Durable per-thread state persisted at checkpoint boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphState {
    pub version: u32,
    pub thread_id: ThreadId,
    /// Number of user turns started on this thread.
    pub turn: u32,
    /// Cycles consumed by the current turn.
    pub cycle: u32,
    /// True once the current turn reached EXIT.
    pub terminal: bool,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
    #[serde(default)]
    pub context: Option<ContextPacket>,
    #[serde(default)]
    pub pending_tool: Option<ToolCall>,
    #[serde(default)]
    pub recent_outcomes: Vec<ToolOutcome>,
    #[serde(default)]
    pub recent_failures: Vec<RecentFailure>,
    #[serde(default)]
    pub last_payload: Option<TerminalPayload>,
}

impl GraphState {
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            version: STATE_VERSION,
            thread_id,
            turn: 0,
            cycle: 0,
            terminal: false,
            message: None,
            context: None,
            pending_tool: None,
            recent_outcomes: Vec::new(),
            recent_failures: Vec::new(),
            last_payload: None,
        }
    }

    /// A turn was started and never reached EXIT.
    pub fn has_interrupted_turn(&self) -> bool {
        self.turn > 0 && !self.terminal
    }

    /// Start a new turn. Recent outcomes roll over; everything else resets.
    pub fn begin_turn(&mut self, message: IncomingMessage) {
        self.turn += 1;
        self.cycle = 0;
        self.terminal = false;
        self.message = Some(message);
        self.context = None;
        self.pending_tool = None;
        self.recent_failures.clear();
        self.last_payload = None;
    }

    pub fn invocation_key(&self, tool_name: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.thread_id, self.turn, self.cycle, tool_name
        )
    }

    pub fn push_outcome(&mut self, outcome: ToolOutcome, limit: usize) {
        self.recent_outcomes.push(outcome);
        keep_last(&mut self.recent_outcomes, limit);
    }

    pub fn push_failure(&mut self, failure: RecentFailure, limit: usize) {
        self.recent_failures.push(failure);
        keep_last(&mut self.recent_failures, limit);
    }
}

fn keep_last<T>(items: &mut Vec<T>, limit: usize) {
    if items.len() > limit {
        let excess = items.len() - limit;
        items.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn thread() -> ThreadId {
        ThreadId::new("run-7", "chat").expect("thread id")
    }

    #[test]
    fn thread_id_round_trips_through_its_string_form() {
        let id = ThreadId::parse("42:session:with:colons").expect("parse");
        assert_eq!(id.run_id(), "42");
        assert_eq!(id.session_id(), "session:with:colons");
        assert_eq!(id.to_string(), "42:session:with:colons");

        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"42:session:with:colons\"");
        let back: ThreadId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn thread_id_rejects_malformed_values() {
        assert!(ThreadId::parse("no-separator").is_err());
        assert!(ThreadId::parse(":session").is_err());
        assert!(ThreadId::parse("run:").is_err());
        assert!(ThreadId::new("a:b", "c").is_err());
        assert!(ThreadId::new("run", "line\nbreak").is_err());
        assert!(serde_json::from_str::<ThreadId>("\"bad\"").is_err());
    }

    #[test]
    fn begin_turn_resets_turn_scoped_fields() {
        let mut state = GraphState::new(thread());
        assert!(!state.has_interrupted_turn());

        state.begin_turn(IncomingMessage::new("first"));
        state.cycle = 3;
        state.pending_tool = Some(ToolCall {
            tool_name: "t".into(),
            arguments: json!({}),
            invocation_key: "k".into(),
        });
        state.push_outcome(
            ToolOutcome {
                tool_name: "t".into(),
                success: true,
                summary: "ok".into(),
                turn: 1,
                cycle: 3,
            },
            5,
        );
        assert!(state.has_interrupted_turn());

        state.begin_turn(IncomingMessage::new("second"));
        assert_eq!(state.turn, 2);
        assert_eq!(state.cycle, 0);
        assert!(state.pending_tool.is_none());
        assert_eq!(state.recent_outcomes.len(), 1);
        assert_eq!(
            state.message.as_ref().map(|m| m.text.as_str()),
            Some("second")
        );
    }

    #[test]
    fn rolling_lists_keep_the_newest_entries() {
        let mut state = GraphState::new(thread());
        for cycle in 1..=7 {
            state.push_failure(
                RecentFailure {
                    source: FailureSource::Planner,
                    message: format!("f{cycle}"),
                    cycle,
                },
                3,
            );
        }
        let cycles: Vec<u32> = state.recent_failures.iter().map(|f| f.cycle).collect();
        assert_eq!(cycles, vec![5, 6, 7]);
    }

    #[test]
    fn invocation_key_names_thread_turn_cycle_and_tool() {
        let mut state = GraphState::new(thread());
        state.begin_turn(IncomingMessage::new("hi"));
        state.cycle = 2;
        assert_eq!(state.invocation_key("lookup"), "run-7:chat/1/2/lookup");
    }

    #[test]
    fn invocation_summary_prefers_the_error_and_truncates() {
        let mut invocation = ToolInvocation {
            invocation_key: "k".into(),
            thread_id: "r:s".into(),
            turn: 1,
            cycle: 1,
            tool_name: "t".into(),
            input: json!({}),
            output: Some(json!({ "text": "x".repeat(400) })),
            error: None,
            timestamp: "2026-01-01T00:00:00Z".into(),
            duration_ms: 1,
        };
        let summary = invocation.summary();
        assert!(summary.ends_with("..."));
        assert_eq!(summary.chars().count(), OUTCOME_SUMMARY_CHARS + 3);

        invocation.error = Some(InvocationError {
            kind: ErrorKind::ToolTimeout,
            message: "slow".into(),
        });
        assert_eq!(invocation.summary(), "tool_timeout: slow");
        assert!(!invocation.outcome().success);
    }

    #[test]
    fn incoming_message_defaults_request_kind() {
        let message: IncomingMessage =
            serde_json::from_value(json!({ "text": "hello" })).expect("message");
        assert_eq!(message.request_kind, DEFAULT_REQUEST_KIND);
        assert!(message.issue_key.is_none());
    }
}
