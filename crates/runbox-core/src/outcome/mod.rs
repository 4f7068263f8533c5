//! Terminal handling of attempts and distribution of job events.
//!
//! The [`OutcomePipeline`] turns an attempt result into a queue decision
//! (complete, retry, fail) and files exhausted jobs into the dead-letter
//! store. Events go out through the [`EventEmitter`], which publishes to live
//! subscribers and queues the matching record-store call.

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::errors::QueueError;
use crate::job::{Job, JobId, JobStatus};
use crate::queue::{JobQueue, RetryDecision};
use crate::sandbox::OutputStream;
use crate::supervisor::{AttemptFailure, AttemptResult, ErrorKind};

pub mod dead_letter;
pub mod events;
pub mod outbox;
pub mod records;

pub use dead_letter::{
    read_dead_letters, DeadLetter, DeadLetterStore, JsonlDeadLetterStore, MemoryDeadLetterStore,
};
pub use events::{EventHub, EventKind, EventStatus, LogLine, OutcomeEvent, StatusUpdate};
pub use outbox::Outbox;
pub use records::{LoggingRecordStore, MemoryRecordStore, RecordCommand, RecordStore};

/// Publishes events to subscribers and mirrors them into the record store.
#[derive(Clone)]
pub struct EventEmitter {
    hub: Arc<EventHub>,
    records: Outbox<RecordCommand>,
}

impl EventEmitter {
    /// Spawns the record outbox; call from within a tokio runtime.
    pub fn spawn(
        hub: Arc<EventHub>,
        store: Arc<dyn RecordStore>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (records, handle) = Outbox::spawn("records", capacity, move |command: RecordCommand| {
            let store = store.clone();
            async move { command.apply(store.as_ref()).await }
        });
        (Self { hub, records }, handle)
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn save_job(&self, job: &Job) {
        self.records.send(RecordCommand::SaveJob(Box::new(job.clone())));
    }

    pub fn status(&self, job_id: &JobId, update: StatusUpdate) {
        self.records
            .send(RecordCommand::UpdateStatus(job_id.clone(), update.clone()));
        self.hub.publish(OutcomeEvent::status(job_id.clone(), update));
    }

    pub fn log(&self, job_id: &JobId, stream: OutputStream, text: String) {
        self.records
            .send(RecordCommand::AppendLog(job_id.clone(), stream, text.clone()));
        self.hub.publish(OutcomeEvent::log(job_id.clone(), stream, text));
    }

    /// Waits until record-store calls issued so far have been applied.
    pub async fn flush_records(&self) {
        self.records.flush().await;
    }

    /// Record-store calls dropped because the outbox was full.
    pub fn dropped_records(&self) -> u64 {
        self.records.dropped()
    }
}

pub struct OutcomePipeline {
    queue: Arc<JobQueue>,
    emitter: EventEmitter,
    dead_letters: Arc<dyn DeadLetterStore>,
}

impl OutcomePipeline {
    pub fn new(
        queue: Arc<JobQueue>,
        emitter: EventEmitter,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            queue,
            emitter,
            dead_letters,
        }
    }

    /// Applies the result of one attempt of `job` and returns the status the
    /// job ends up in.
    pub async fn handle(&self, job: &Job, result: AttemptResult) -> Result<JobStatus, QueueError> {
        match result {
            AttemptResult::Succeeded { exit_code, output } => {
                let done = self.queue.complete(&job.id).await?;
                log::info!(
                    "Job {} completed in {}ms{}",
                    job.id,
                    done.duration_ms().unwrap_or_default(),
                    if output.truncated { " (output truncated)" } else { "" }
                );
                self.emitter.status(
                    &job.id,
                    StatusUpdate::new(EventStatus::Completed)
                        .exit_code(Some(exit_code))
                        .duration_ms(done.duration_ms())
                        .attempt(done.attempts),
                );
                self.emitter.hub().close(&job.id);
                Ok(JobStatus::Completed)
            }
            AttemptResult::Failed(failure) if failure.kind == ErrorKind::Validation => {
                log::warn!("Job {} failed validation: {}", job.id, failure.message);
                let failed = self.queue.fail(&job.id, &failure.message).await?;
                Ok(self.terminal_failure(failed, failure).await)
            }
            AttemptResult::Failed(failure) => {
                match self.queue.retry_or_fail(&job.id, &failure.message).await? {
                    RetryDecision::Retry {
                        attempt,
                        max_attempts,
                        delay,
                    } => {
                        log::warn!(
                            "Job {} attempt {}/{} failed ({}), retrying in {:?}",
                            job.id,
                            attempt,
                            max_attempts,
                            failure.message,
                            delay
                        );
                        self.emitter.status(
                            &job.id,
                            StatusUpdate::new(EventStatus::Retrying)
                                .exit_code(failure.exit_code)
                                .error(failure.message.clone())
                                .attempt(attempt),
                        );
                        Ok(JobStatus::Waiting)
                    }
                    RetryDecision::Exhausted { .. } => {
                        let failed = self
                            .queue
                            .get(&job.id)
                            .await
                            .ok_or_else(|| QueueError::NotFound(job.id.clone()))?;
                        Ok(self.terminal_failure(failed, failure).await)
                    }
                }
            }
        }
    }

    async fn terminal_failure(&self, failed: Job, failure: AttemptFailure) -> JobStatus {
        log::error!(
            "Job {} failed after {} attempt(s): {}",
            failed.id,
            failed.attempts,
            failure.message
        );
        self.emitter.status(
            &failed.id,
            StatusUpdate::new(EventStatus::Failed)
                .exit_code(failure.exit_code)
                .duration_ms(failed.duration_ms())
                .error(failure.message.clone())
                .attempt(failed.attempts),
        );

        let letter = DeadLetter {
            job_id: failed.id.clone(),
            original_payload: failed.payload.clone(),
            error: failure.message,
            kind: failure.kind,
            attempts: failed.attempts,
            exit_code: failure.exit_code,
            output: failure.output.text,
            timestamp: chrono::Utc::now(),
        };

        let status = match self.dead_letters.append(&letter).await {
            Ok(()) => match self.queue.mark_dead_lettered(&failed.id).await {
                Ok(()) => {
                    log::info!("Job {} moved to the dead-letter store", failed.id);
                    self.emitter
                        .status(&failed.id, StatusUpdate::new(EventStatus::DeadLettered));
                    JobStatus::DeadLettered
                }
                Err(e) => {
                    log::error!("Failed to mark job {} dead-lettered: {}", failed.id, e);
                    JobStatus::Failed
                }
            },
            Err(e) => {
                log::error!("Failed to dead-letter job {}: {}", failed.id, e);
                JobStatus::Failed
            }
        };
        self.emitter.hub().close(&failed.id);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobPayload, SubmissionLimits};
    use crate::queue::EnqueueOptions;
    use crate::supervisor::CapturedOutput;
    use std::time::Duration;

    struct Fixture {
        queue: Arc<JobQueue>,
        records: Arc<MemoryRecordStore>,
        dead: Arc<MemoryDeadLetterStore>,
        pipeline: OutcomePipeline,
        _drain: JoinHandle<()>,
    }

    fn fixture() -> Fixture {
        let queue = Arc::new(JobQueue::in_memory());
        let records = Arc::new(MemoryRecordStore::new());
        let dead = Arc::new(MemoryDeadLetterStore::new());
        let (emitter, drain) = EventEmitter::spawn(Arc::new(EventHub::new(16)), records.clone(), 64);
        let pipeline = OutcomePipeline::new(queue.clone(), emitter, dead.clone());
        Fixture {
            queue,
            records,
            dead,
            pipeline,
            _drain: drain,
        }
    }

    async fn claimed(queue: &JobQueue, id: &str, attempts: u32) -> Job {
        let payload = JobPayload {
            job_id: Some(id.to_string()),
            source_code: Some("process.exit(1)".to_string()),
            ..Default::default()
        };
        let normalized = payload.normalize(&SubmissionLimits::default()).unwrap();
        let job = Job::new(normalized, serde_json::to_value(&payload).unwrap());
        let options = EnqueueOptions {
            attempts,
            backoff: crate::job::Backoff::exponential(Duration::from_millis(1)),
        };
        queue.enqueue(job, options).await.unwrap();
        queue.claim_next().await.unwrap().unwrap()
    }

    fn failure(kind: ErrorKind) -> AttemptResult {
        AttemptResult::Failed(AttemptFailure {
            kind,
            message: "Process exited with code 1".to_string(),
            exit_code: Some(1),
            output: CapturedOutput::default(),
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_success_completes_job() {
        let f = fixture();
        let job = claimed(&f.queue, "ok", 3).await;
        let status = f
            .pipeline
            .handle(
                &job,
                AttemptResult::Succeeded {
                    exit_code: 0,
                    output: CapturedOutput::default(),
                },
            )
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Completed);
        settle().await;
        let updates = f.records.status_updates(&job.id);
        assert_eq!(updates.last().unwrap().status, EventStatus::Completed);
        assert_eq!(updates.last().unwrap().exit_code, Some(0));
        assert!(f.dead.letters().is_empty());
    }

    #[tokio::test]
    async fn test_failure_with_attempts_left_is_retried() {
        let f = fixture();
        let job = claimed(&f.queue, "again", 2).await;
        let status = f.pipeline.handle(&job, failure(ErrorKind::Execution)).await.unwrap();
        assert_eq!(status, JobStatus::Waiting);
        settle().await;
        assert_eq!(f.records.statuses(&job.id), vec![EventStatus::Retrying]);
        assert!(f.dead.letters().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_job_is_dead_lettered() {
        let f = fixture();
        let job = claimed(&f.queue, "dead", 1).await;
        let status = f.pipeline.handle(&job, failure(ErrorKind::TimedOut)).await.unwrap();
        assert_eq!(status, JobStatus::DeadLettered);

        let letters = f.dead.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].kind, ErrorKind::TimedOut);
        assert_eq!(letters[0].attempts, 1);
        assert_eq!(letters[0].original_payload["source_code"], "process.exit(1)");

        settle().await;
        assert_eq!(
            f.records.statuses(&job.id),
            vec![EventStatus::Failed, EventStatus::DeadLettered]
        );
    }

    #[tokio::test]
    async fn test_dead_letter_failure_leaves_job_failed() {
        let f = fixture();
        f.dead.set_unavailable(true);
        let job = claimed(&f.queue, "stuck", 1).await;
        let status = f.pipeline.handle(&job, failure(ErrorKind::Execution)).await.unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(f.queue.get(&job.id).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_validation_failure_skips_retries() {
        let f = fixture();
        let job = claimed(&f.queue, "invalid", 5).await;
        let status = f.pipeline.handle(&job, failure(ErrorKind::Validation)).await.unwrap();
        assert_eq!(status, JobStatus::DeadLettered);
        assert_eq!(f.queue.get(&job.id).await.unwrap().attempts, 1);
    }
}
