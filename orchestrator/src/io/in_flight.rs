//! Per-thread mutual exclusion for engine invocations.
//!
//! A claim holds an exclusive advisory lock on
//! `<dir>/<run>/<session>.lock` (both parts percent-encoded). The lock
//! belongs to the open file, so it excludes other claims in this process as
//! well as other processes sharing the state directory, and it is released
//! when the claim drops or the holder dies. Lock files are never deleted:
//! removing one while it is held would let a second claimant lock a fresh
//! inode at the same path.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use fs2::FileExt;
use tracing::{debug, warn};

use crate::core::types::ThreadId;
use crate::error::{CheckpointError, EngineError};
use crate::io::paths::encode_component;

/// Exclusive claim on one thread; released on drop.
#[derive(Debug)]
pub struct ThreadClaim {
    file: File,
    path: PathBuf,
}

impl ThreadClaim {
    /// Claim `thread_id`, or fail with `ConcurrentInvocation` while another
    /// claim on it is alive.
    pub fn acquire(dir: &Path, thread_id: &ThreadId) -> Result<Self, EngineError> {
        let path = lock_path(dir, thread_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))
                .map_err(claim_io)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))
            .map_err(claim_io)?;

        if let Err(err) = file.try_lock_exclusive() {
            if is_contended(&err) {
                debug!(path = %path.display(), "thread already claimed");
                return Err(EngineError::ConcurrentInvocation {
                    thread_id: thread_id.to_string(),
                });
            }
            return Err(claim_io(
                anyhow::Error::new(err).context(format!("lock {}", path.display())),
            ));
        }

        // Holder pid, for whoever finds the file during an incident.
        file.set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .with_context(|| format!("write {}", path.display()))
            .map_err(claim_io)?;
        debug!(path = %path.display(), "thread claimed");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ThreadClaim {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), err = %err, "failed to release thread claim");
        }
    }
}

pub fn lock_path(dir: &Path, thread_id: &ThreadId) -> PathBuf {
    dir.join(encode_component(thread_id.run_id()))
        .join(format!("{}.lock", encode_component(thread_id.session_id())))
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn claim_io(err: anyhow::Error) -> EngineError {
    EngineError::Checkpoint(CheckpointError::Io(err))
}
