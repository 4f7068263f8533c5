//! Historical job and log records.
//!
//! Storage is external to the engine; it only needs the three calls of
//! [`RecordStore`]. Calls arrive through an outbox, so a slow or failing
//! store delays nothing but its own records.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::events::{EventStatus, StatusUpdate};
use crate::errors::PersistenceError;
use crate::job::{Job, JobId};
use crate::sandbox::OutputStream;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save_job(&self, job: &Job) -> Result<(), PersistenceError>;

    async fn update_status(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> Result<(), PersistenceError>;

    async fn append_log(
        &self,
        job_id: &JobId,
        stream: OutputStream,
        text: &str,
    ) -> Result<(), PersistenceError>;
}

/// A single call queued for the record store.
#[derive(Debug, Clone)]
pub enum RecordCommand {
    SaveJob(Box<Job>),
    UpdateStatus(JobId, StatusUpdate),
    AppendLog(JobId, OutputStream, String),
}

impl RecordCommand {
    pub async fn apply(self, store: &dyn RecordStore) {
        let result = match &self {
            RecordCommand::SaveJob(job) => store.save_job(job).await,
            RecordCommand::UpdateStatus(id, update) => store.update_status(id, update).await,
            RecordCommand::AppendLog(id, stream, text) => store.append_log(id, *stream, text).await,
        };
        if let Err(e) = result {
            log::warn!("Record store call failed: {}", e);
        }
    }
}

/// Writes records to the log. Useful when no database is attached.
#[derive(Debug, Default)]
pub struct LoggingRecordStore;

#[async_trait]
impl RecordStore for LoggingRecordStore {
    async fn save_job(&self, job: &Job) -> Result<(), PersistenceError> {
        log::info!(
            "Job {} saved (runtime {}, timeout {}ms, max attempts {})",
            job.id,
            job.spec.runtime,
            job.spec.timeout_ms,
            job.max_attempts
        );
        Ok(())
    }

    async fn update_status(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> Result<(), PersistenceError> {
        match &update.error {
            Some(error) => log::info!("Job {} -> {}: {}", job_id, update.status, error),
            None => log::info!("Job {} -> {}", job_id, update.status),
        }
        Ok(())
    }

    async fn append_log(
        &self,
        job_id: &JobId,
        stream: OutputStream,
        text: &str,
    ) -> Result<(), PersistenceError> {
        log::debug!("[{} {}] {}", job_id, stream, text);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryRecords {
    jobs: HashMap<JobId, Job>,
    statuses: HashMap<JobId, Vec<StatusUpdate>>,
    logs: HashMap<JobId, Vec<(OutputStream, String)>>,
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<MemoryRecords>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, MemoryRecords> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn job(&self, job_id: &JobId) -> Option<Job> {
        self.records().jobs.get(job_id).cloned()
    }

    pub fn statuses(&self, job_id: &JobId) -> Vec<EventStatus> {
        self.records()
            .statuses
            .get(job_id)
            .map(|updates| updates.iter().map(|u| u.status).collect())
            .unwrap_or_default()
    }

    pub fn status_updates(&self, job_id: &JobId) -> Vec<StatusUpdate> {
        self.records()
            .statuses
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn logs(&self, job_id: &JobId) -> Vec<(OutputStream, String)> {
        self.records()
            .logs
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save_job(&self, job: &Job) -> Result<(), PersistenceError> {
        self.records().jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> Result<(), PersistenceError> {
        self.records()
            .statuses
            .entry(job_id.clone())
            .or_default()
            .push(update.clone());
        Ok(())
    }

    async fn append_log(
        &self,
        job_id: &JobId,
        stream: OutputStream,
        text: &str,
    ) -> Result<(), PersistenceError> {
        self.records()
            .logs
            .entry(job_id.clone())
            .or_default()
            .push((stream, text.to_string()));
        Ok(())
    }
}
