//! Durable per-thread checkpoints.
//!
//! [`FileCheckpointStore`] writes one JSON file per save under
//! `<root>/<run>/<session>/<sequence>.json`, with both id parts
//! percent-encoded. Sequence numbers are zero-padded so lexical order is
//! save order. Each write goes to a temp file and is renamed into place, so
//! a crash never leaves a partial checkpoint behind.
//!
//! Per-thread claim locks live under `<root>/.locks/`. A leading `.` is
//! always percent-encoded in run ids, so that directory never collides with
//! a run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{GraphState, STATE_VERSION, ThreadId};
use crate::error::{CheckpointError, EngineError};
use crate::io::in_flight::ThreadClaim;
use crate::io::paths::{decode_component, encode_component, write_atomic};

const LOCKS_DIR: &str = ".locks";

/// Stored checkpoint: metadata envelope plus the state itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub thread_id: ThreadId,
    pub sequence: u64,
    pub schema_version: u32,
    /// RFC 3339 save time.
    pub created_at: String,
    pub state: GraphState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointMeta {
    pub sequence: u64,
    pub schema_version: u32,
    pub created_at: String,
}

/// Envelope read before the state so a version mismatch is detected even
/// when the state no longer deserializes.
#[derive(Debug, Deserialize)]
struct Envelope {
    thread_id: String,
    sequence: u64,
    schema_version: u32,
    created_at: String,
    state: Value,
}

pub trait CheckpointStore: Send + Sync {
    /// Persist `state` as the newest checkpoint; returns its sequence number.
    fn save(&self, thread_id: &ThreadId, state: &GraphState) -> Result<u64, CheckpointError>;
    fn load_latest(&self, thread_id: &ThreadId) -> Result<Option<CheckpointRecord>, CheckpointError>;
    /// Oldest first.
    fn list(&self, thread_id: &ThreadId) -> Result<Vec<CheckpointMeta>, CheckpointError>;
    /// Keep the newest `keep` checkpoints; returns how many were deleted.
    fn prune(&self, thread_id: &ThreadId, keep: usize) -> Result<usize, CheckpointError>;
    /// Delete every checkpoint of the thread.
    fn reset(&self, thread_id: &ThreadId) -> Result<usize, CheckpointError>;
    /// Delete every checkpoint of every thread in the run.
    fn reset_run(&self, run_id: &str) -> Result<usize, CheckpointError>;
    /// Every thread that has at least one checkpoint, sorted.
    fn threads(&self) -> Result<Vec<ThreadId>, CheckpointError>;
    /// Exclusive claim on the thread, held for a whole invocation or reset.
    /// Fails with `ConcurrentInvocation` while any other claim is alive.
    fn claim(&self, thread_id: &ThreadId) -> Result<ThreadClaim, EngineError>;
}

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(encode_component(run_id))
    }

    fn thread_dir(&self, thread_id: &ThreadId) -> PathBuf {
        self.run_dir(thread_id.run_id())
            .join(encode_component(thread_id.session_id()))
    }

    /// Checkpoint files of a thread as `(sequence, path)`, oldest first.
    fn files(&self, thread_id: &ThreadId) -> Result<Vec<(u64, PathBuf)>, CheckpointError> {
        let dir = self.thread_dir(thread_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        let entries = fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(sequence) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                warn!(path = %path.display(), "ignoring unexpected file in checkpoint dir");
                continue;
            };
            files.push((sequence, path));
        }
        files.sort_by_key(|(sequence, _)| *sequence);
        Ok(files)
    }

    fn read_envelope(path: &Path) -> Result<Envelope, CheckpointError> {
        let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&contents).map_err(|err| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    fn delete(files: &[(u64, PathBuf)]) -> Result<usize, CheckpointError> {
        for (_, path) in files {
            fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
        }
        Ok(files.len())
    }
}

impl CheckpointStore for FileCheckpointStore {
    #[instrument(skip_all, fields(thread = %thread_id))]
    fn save(&self, thread_id: &ThreadId, state: &GraphState) -> Result<u64, CheckpointError> {
        let sequence = self
            .files(thread_id)?
            .last()
            .map_or(1, |(sequence, _)| sequence + 1);
        let record = CheckpointRecord {
            thread_id: thread_id.clone(),
            sequence,
            schema_version: STATE_VERSION,
            created_at: chrono::Utc::now().to_rfc3339(),
            state: state.clone(),
        };
        let mut buf = serde_json::to_string_pretty(&record).context("serialize checkpoint")?;
        buf.push('\n');
        let path = self.thread_dir(thread_id).join(format!("{sequence:020}.json"));
        write_atomic(&path, buf.as_bytes())?;
        debug!(sequence, path = %path.display(), "checkpoint written");
        Ok(sequence)
    }

    fn load_latest(&self, thread_id: &ThreadId) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let files = self.files(thread_id)?;
        let Some((_, path)) = files.last() else {
            return Ok(None);
        };
        let envelope = Self::read_envelope(path)?;
        if envelope.schema_version != STATE_VERSION {
            return Err(CheckpointError::VersionMismatch {
                thread_id: thread_id.to_string(),
                found: envelope.schema_version,
                expected: STATE_VERSION,
            });
        }
        if envelope.thread_id != thread_id.to_string() {
            return Err(CheckpointError::Corrupt {
                path: path.clone(),
                message: format!(
                    "checkpoint belongs to thread {}, expected {thread_id}",
                    envelope.thread_id
                ),
            });
        }
        let state: GraphState =
            serde_json::from_value(envelope.state).map_err(|err| CheckpointError::Corrupt {
                path: path.clone(),
                message: err.to_string(),
            })?;
        Ok(Some(CheckpointRecord {
            thread_id: thread_id.clone(),
            sequence: envelope.sequence,
            schema_version: envelope.schema_version,
            created_at: envelope.created_at,
            state,
        }))
    }

    fn list(&self, thread_id: &ThreadId) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        self.files(thread_id)?
            .iter()
            .map(|(_, path)| {
                let envelope = Self::read_envelope(path)?;
                Ok(CheckpointMeta {
                    sequence: envelope.sequence,
                    schema_version: envelope.schema_version,
                    created_at: envelope.created_at,
                })
            })
            .collect()
    }

    #[instrument(skip_all, fields(thread = %thread_id, keep))]
    fn prune(&self, thread_id: &ThreadId, keep: usize) -> Result<usize, CheckpointError> {
        let files = self.files(thread_id)?;
        let excess = files.len().saturating_sub(keep);
        let deleted = Self::delete(&files[..excess])?;
        if deleted > 0 {
            info!(deleted, "pruned old checkpoints");
        }
        Ok(deleted)
    }

    #[instrument(skip_all, fields(thread = %thread_id))]
    fn reset(&self, thread_id: &ThreadId) -> Result<usize, CheckpointError> {
        let deleted = Self::delete(&self.files(thread_id)?)?;
        let dir = self.thread_dir(thread_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        }
        info!(deleted, "thread checkpoints cleared");
        Ok(deleted)
    }

    #[instrument(skip_all, fields(run_id))]
    fn reset_run(&self, run_id: &str) -> Result<usize, CheckpointError> {
        let threads: Vec<ThreadId> = self
            .threads()?
            .into_iter()
            .filter(|t| t.run_id() == run_id)
            .collect();
        let mut deleted = 0;
        for thread in &threads {
            deleted += self.reset(thread)?;
        }
        let dir = self.run_dir(run_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        }
        Ok(deleted)
    }

    fn threads(&self) -> Result<Vec<ThreadId>, CheckpointError> {
        let mut threads = Vec::new();
        if !self.root.exists() {
            return Ok(threads);
        }
        for run in sorted_dirs(&self.root)? {
            if dir_name(&run).is_some_and(|n| n.starts_with('.')) {
                continue;
            }
            let Some(run_id) = dir_name(&run).and_then(|n| decode_component(&n)) else {
                continue;
            };
            for session in sorted_dirs(&run)? {
                let Some(session_id) = dir_name(&session).and_then(|n| decode_component(&n))
                else {
                    continue;
                };
                if let Ok(thread) = ThreadId::new(&run_id, &session_id) {
                    threads.push(thread);
                }
            }
        }
        threads.sort();
        Ok(threads)
    }

    fn claim(&self, thread_id: &ThreadId) -> Result<ThreadClaim, EngineError> {
        ThreadClaim::acquire(&self.root.join(LOCKS_DIR), thread_id)
    }
}

fn sorted_dirs(dir: &Path) -> Result<Vec<PathBuf>, CheckpointError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("read entry in {}", dir.display()))?
            .path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}
