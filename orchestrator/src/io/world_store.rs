//! World model storage.
//!
//! The engine reads through [`WorldReader`] and writes through [`WorldWriter`];
//! lane assemblers only ever see the read half. [`FileWorldModel`] keeps one
//! directory per run:
//!
//! - `world.json`: the materialized [`WorldDocument`], replaced atomically
//! - `invocations.jsonl`: append-only tool invocation log
//! - `summaries.jsonl`: append-only per-turn summaries

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::core::payload::SummaryRecord;
use crate::core::types::ToolInvocation;
use crate::core::world::{
    AnchorSet, MemoryRecord, MemorySource, ScoredSegment, WorldChange, WorldDocument,
};
use crate::io::paths::{encode_component, write_atomic};

/// Point-in-time reads used by the lane assemblers and the tool executor.
pub trait WorldReader: Send + Sync {
    /// Locks, tasks, contradictions and counts for the run.
    fn world_state(&self, run_id: &str) -> Result<WorldDocument>;
    fn anchor_facts(&self, run_id: &str) -> Result<AnchorSet>;
    /// Notes then turn summaries, oldest first.
    fn memory(&self, run_id: &str) -> Result<Vec<MemoryRecord>>;
    fn search_evidence(&self, run_id: &str, query: &str, limit: usize)
    -> Result<Vec<ScoredSegment>>;
    /// Newest first.
    fn recent_invocations(&self, run_id: &str, limit: usize) -> Result<Vec<ToolInvocation>>;
    fn invocation_count(&self, run_id: &str) -> Result<usize>;
    fn find_invocation(&self, run_id: &str, invocation_key: &str)
    -> Result<Option<ToolInvocation>>;
}

pub trait WorldWriter: Send + Sync {
    fn apply_change(&self, run_id: &str, change: &WorldChange) -> Result<()>;
    fn record_invocation(&self, run_id: &str, invocation: &ToolInvocation) -> Result<()>;
    fn record_summary(&self, run_id: &str, summary: &SummaryRecord) -> Result<()>;
}

pub trait WorldModel: WorldReader + WorldWriter {}

impl<T: WorldReader + WorldWriter> WorldModel for T {}

/// File-backed world model rooted at `.orchestrator/world/`.
#[derive(Debug)]
pub struct FileWorldModel {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileWorldModel {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(encode_component(run_id))
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("world model lock poisoned"))
    }

    fn load_document(&self, run_id: &str) -> Result<WorldDocument> {
        let path = self.run_dir(run_id).join("world.json");
        if !path.exists() {
            return Ok(WorldDocument::default());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    fn invocations(&self, run_id: &str) -> Result<Vec<ToolInvocation>> {
        read_jsonl(&self.run_dir(run_id).join("invocations.jsonl"))
    }
}

impl WorldReader for FileWorldModel {
    fn world_state(&self, run_id: &str) -> Result<WorldDocument> {
        let _guard = self.guard()?;
        self.load_document(run_id)
    }

    fn anchor_facts(&self, run_id: &str) -> Result<AnchorSet> {
        let _guard = self.guard()?;
        Ok(self.load_document(run_id)?.anchor_set())
    }

    fn memory(&self, run_id: &str) -> Result<Vec<MemoryRecord>> {
        let _guard = self.guard()?;
        let document = self.load_document(run_id)?;
        let summaries: Vec<SummaryRecord> =
            read_jsonl(&self.run_dir(run_id).join("summaries.jsonl"))?;
        let mut records: Vec<MemoryRecord> = document
            .memory
            .into_iter()
            .map(|note| MemoryRecord {
                memory_id: note.memory_id,
                source: MemorySource::Note,
                text: note.text,
            })
            .collect();
        records.extend(summaries.iter().enumerate().map(|(index, summary)| MemoryRecord {
            memory_id: format!("summary-{}", index + 1),
            source: MemorySource::Summary,
            text: summary.render(),
        }));
        Ok(records)
    }

    fn search_evidence(
        &self,
        run_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredSegment>> {
        let _guard = self.guard()?;
        Ok(self.load_document(run_id)?.search_evidence(query, limit))
    }

    fn recent_invocations(&self, run_id: &str, limit: usize) -> Result<Vec<ToolInvocation>> {
        let _guard = self.guard()?;
        let mut all = self.invocations(run_id)?;
        all.reverse();
        all.truncate(limit);
        Ok(all)
    }

    fn invocation_count(&self, run_id: &str) -> Result<usize> {
        let _guard = self.guard()?;
        Ok(self.invocations(run_id)?.len())
    }

    fn find_invocation(
        &self,
        run_id: &str,
        invocation_key: &str,
    ) -> Result<Option<ToolInvocation>> {
        let _guard = self.guard()?;
        Ok(self
            .invocations(run_id)?
            .into_iter()
            .rev()
            .find(|inv| inv.invocation_key == invocation_key))
    }
}

impl WorldWriter for FileWorldModel {
    #[instrument(skip_all, fields(run_id))]
    fn apply_change(&self, run_id: &str, change: &WorldChange) -> Result<()> {
        let _guard = self.guard()?;
        let mut document = self.load_document(run_id)?;
        document
            .apply(change)
            .map_err(|msg| anyhow!("apply world change: {msg}"))?;
        let mut buf = serde_json::to_string_pretty(&document).context("serialize world")?;
        buf.push('\n');
        write_atomic(&self.run_dir(run_id).join("world.json"), buf.as_bytes())?;
        debug!(?change, "world change applied");
        Ok(())
    }

    fn record_invocation(&self, run_id: &str, invocation: &ToolInvocation) -> Result<()> {
        let _guard = self.guard()?;
        append_jsonl(&self.run_dir(run_id).join("invocations.jsonl"), invocation)
    }

    fn record_summary(&self, run_id: &str, summary: &SummaryRecord) -> Result<()> {
        let _guard = self.guard()?;
        append_jsonl(&self.run_dir(run_id).join("summaries.jsonl"), summary)
    }
}

fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(record).context("serialize log record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("sync {}", path.display()))
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), index + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::payload::TerminalStatus;
    use crate::core::world::Severity;
    use serde_json::json;

    fn invocation(key: &str, tool: &str) -> ToolInvocation {
        ToolInvocation {
            invocation_key: key.to_string(),
            thread_id: "run-1:s".to_string(),
            turn: 1,
            cycle: 1,
            tool_name: tool.to_string(),
            input: json!({}),
            output: Some(json!({"ok": true})),
            error: None,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            duration_ms: 3,
        }
    }

    #[test]
    fn unknown_run_reads_as_empty_world() {
        let temp = tempfile::tempdir().expect("tempdir");
        let world = FileWorldModel::new(temp.path());
        assert_eq!(
            world.world_state("fresh").expect("state"),
            WorldDocument::default()
        );
        assert!(world.memory("fresh").expect("memory").is_empty());
        assert_eq!(world.invocation_count("fresh").expect("count"), 0);
    }

    #[test]
    fn changes_persist_per_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let world = FileWorldModel::new(temp.path());
        world
            .apply_change(
                "run-1",
                &WorldChange::RaiseContradiction {
                    contradiction_id: "C1".into(),
                    issue_key: None,
                    summary: "totals differ".into(),
                    severity: Severity::Blocking,
                },
            )
            .expect("apply");

        let reopened = FileWorldModel::new(temp.path());
        assert_eq!(
            reopened
                .world_state("run-1")
                .expect("state")
                .open_contradictions()
                .count(),
            1
        );
        assert!(
            reopened
                .world_state("run-2")
                .expect("state")
                .contradictions
                .is_empty()
        );
    }

    #[test]
    fn invalid_change_leaves_document_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let world = FileWorldModel::new(temp.path());
        let err = world
            .apply_change(
                "run-1",
                &WorldChange::ResolveTask {
                    task_id: "T9".into(),
                },
            )
            .expect_err("unknown task");
        assert!(err.to_string().contains("T9"));
        assert!(!temp.path().join("run-1/world.json").exists());
    }

    #[test]
    fn invocation_log_is_append_only_and_searchable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let world = FileWorldModel::new(temp.path());
        world
            .record_invocation("run-1", &invocation("k1", "a"))
            .expect("log");
        world
            .record_invocation("run-1", &invocation("k2", "b"))
            .expect("log");

        assert_eq!(world.invocation_count("run-1").expect("count"), 2);
        let recent = world.recent_invocations("run-1", 1).expect("recent");
        assert_eq!(recent[0].invocation_key, "k2");
        let found = world.find_invocation("run-1", "k1").expect("find");
        assert_eq!(found.map(|i| i.tool_name), Some("a".to_string()));
        assert!(world.find_invocation("run-1", "k3").expect("find").is_none());
    }

    #[test]
    fn memory_lists_notes_then_rendered_summaries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let world = FileWorldModel::new(temp.path());
        world
            .apply_change(
                "run-1",
                &WorldChange::AddMemory {
                    memory_id: "n1".into(),
                    text: "client prefers monthly reports".into(),
                },
            )
            .expect("note");
        world
            .record_summary(
                "run-1",
                &SummaryRecord {
                    thread_id: "run-1:s".into(),
                    turn: 1,
                    status: TerminalStatus::Completed,
                    cycles: 1,
                    changed: Vec::new(),
                    pending: Vec::new(),
                    reason: None,
                },
            )
            .expect("summary");

        let memory = world.memory("run-1").expect("memory");
        assert_eq!(memory.len(), 2);
        assert_eq!(memory[0].source, MemorySource::Note);
        assert_eq!(memory[1].memory_id, "summary-1");
        assert_eq!(memory[1].text, "turn 1 ended COMPLETED after 1 cycle(s)");
    }

    #[test]
    fn corrupt_log_line_is_reported_with_its_line_number() {
        let temp = tempfile::tempdir().expect("tempdir");
        let world = FileWorldModel::new(temp.path());
        world
            .record_invocation("run-1", &invocation("k1", "a"))
            .expect("log");
        let path = temp.path().join("run-1/invocations.jsonl");
        let mut contents = fs::read_to_string(&path).expect("read");
        contents.push_str("{not json\n");
        fs::write(&path, contents).expect("write");

        let err = world.invocation_count("run-1").expect_err("corrupt");
        assert!(format!("{err:#}").contains("line 2"));
    }
}
