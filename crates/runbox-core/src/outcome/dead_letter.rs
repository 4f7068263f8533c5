//! Append-only store for jobs that will not be retried again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::errors::DeadLetterError;
use crate::job::JobId;
use crate::supervisor::ErrorKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job_id: JobId,
    /// Payload exactly as it was submitted.
    pub original_payload: serde_json::Value,
    pub error: String,
    pub kind: ErrorKind,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Captured output of the last attempt, possibly truncated.
    #[serde(default)]
    pub output: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn append(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

/// One JSON document per line.
pub struct JsonlDeadLetterStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlDeadLetterStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeadLetterStore for JsonlDeadLetterStore {
    async fn append(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_string(letter)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Reads every record from a JSONL dead-letter file. A missing file holds no
/// records.
pub async fn read_dead_letters<P: AsRef<Path>>(path: P) -> Result<Vec<DeadLetter>, DeadLetterError> {
    let path = path.as_ref();
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| DeadLetterError::Malformed {
                line: index + 1,
                message: e.to_string(),
            })
        })
        .collect()
}

/// Keeps records in memory; can be told to fail.
#[derive(Debug, Default)]
pub struct MemoryDeadLetterStore {
    letters: Mutex<Vec<DeadLetter>>,
    unavailable: std::sync::atomic::AtomicBool,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn append(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DeadLetterError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "dead-letter store unavailable",
            )));
        }
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(letter.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn letter(id: &str) -> DeadLetter {
        DeadLetter {
            job_id: JobId::parse(id).unwrap(),
            original_payload: json!({"source_code": "process.exit(1)", "runtime": "nodejs"}),
            error: "Process exited with code 1".to_string(),
            kind: ErrorKind::Execution,
            attempts: 3,
            exit_code: Some(1),
            output: String::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_jsonl_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dead.jsonl");
        let store = JsonlDeadLetterStore::new(&path);
        store.append(&letter("first")).await.unwrap();
        store.append(&letter("second")).await.unwrap();

        let letters = read_dead_letters(&path).await.unwrap();
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].job_id.as_str(), "first");
        assert_eq!(letters[1].original_payload["runtime"], "nodejs");
        assert_eq!(letters[1].kind, ErrorKind::Execution);
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let letters = read_dead_letters(dir.path().join("none.jsonl")).await.unwrap();
        assert!(letters.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_line_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dead.jsonl");
        let good = serde_json::to_string(&letter("ok")).unwrap();
        tokio::fs::write(&path, format!("{}\nnot json\n", good))
            .await
            .unwrap();
        let err = read_dead_letters(&path).await.unwrap_err();
        assert!(matches!(err, DeadLetterError::Malformed { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_memory_store_can_fail() {
        let store = MemoryDeadLetterStore::new();
        store.set_unavailable(true);
        assert!(store.append(&letter("x")).await.is_err());
        store.set_unavailable(false);
        store.append(&letter("x")).await.unwrap();
        assert_eq!(store.letters().len(), 1);
    }
}
