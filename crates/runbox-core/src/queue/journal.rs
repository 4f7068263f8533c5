//! Snapshot file backing the queue.
//!
//! The queue state is rewritten on every mutation through a temporary file in
//! the same directory followed by an atomic rename, so a reader never
//! observes a half-written snapshot. Writes run on the blocking pool.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

use super::QueueState;
use crate::errors::QueueError;

/// Snapshots are numbered when taken; a write that lands after a newer one
/// is skipped so the file never goes backwards.
#[derive(Debug, Clone)]
pub struct QueueJournal {
    path: PathBuf,
    next_generation: Arc<AtomicU64>,
    written: Arc<Mutex<u64>>,
}

impl QueueJournal {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            next_generation: Arc::new(AtomicU64::new(1)),
            written: Arc::new(Mutex::new(0)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Startup only; the runtime is not serving jobs yet.
    pub(crate) fn load(&self) -> Result<Option<QueueState>, QueueError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Startup only, like [`QueueJournal::load`].
    pub(crate) fn save_now(&self, state: &QueueState) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(state)?;
        write_atomic(&self.path, &bytes)
    }

    /// Must be called while the queue state is locked so generations follow
    /// mutation order.
    pub(crate) async fn save(&self, state: &QueueState) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(state)?;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let path = self.path.clone();
        let written = self.written.clone();
        tokio::task::spawn_blocking(move || {
            let mut last = written.lock().unwrap_or_else(|e| e.into_inner());
            if *last > generation {
                return Ok(());
            }
            write_atomic(&path, &bytes)?;
            *last = generation;
            Ok(())
        })
        .await
        .map_err(|e| QueueError::Storage(format!("snapshot writer failed: {}", e)))?
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), QueueError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| QueueError::Storage(e.error.to_string()))?;
    Ok(())
}
