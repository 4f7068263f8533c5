//! The job execution engine.
//!
//! [`Engine`] owns the queue, the resource controller, the supervisor and the
//! outcome pipeline. [`Engine::submit`] validates and enqueues synchronously;
//! [`Engine::run`] drives a worker pool bounded by the controller's current
//! capacity until its shutdown future resolves, then waits for in-flight
//! attempts to finish.
//!
//! ```ignore
//! let sandbox = Arc::new(DockerSandbox::new(config.sandbox.pull_images)?);
//! let engine = Engine::builder(config, sandbox).build()?;
//! let id = engine.submit(payload).await?;
//! let mut events = engine.subscribe(&id);
//! engine.run(shutdown_signal).await?;
//! ```

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::config::RunboxConfig;
use crate::errors::{EngineError, ValidationError};
use crate::job::{Job, JobId, JobPayload, SubmissionLimits};
use crate::outcome::{
    DeadLetterStore, EventEmitter, EventHub, EventStatus, JsonlDeadLetterStore,
    LoggingRecordStore, OutcomeEvent, OutcomePipeline, RecordStore, StatusUpdate,
};
use crate::queue::{EnqueueOptions, JobQueue, QueueJournal, QueueStats};
use crate::resources::{HostProbe, ResourceController, ResourceSnapshot, SysinfoProbe};
use crate::sandbox::Sandbox;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub queue: QueueStats,
    pub capacity: usize,
    pub active_containers: usize,
    pub dropped_records: u64,
}

pub struct EngineBuilder {
    config: RunboxConfig,
    sandbox: Arc<dyn Sandbox>,
    probe: Option<Arc<dyn HostProbe>>,
    records: Option<Arc<dyn RecordStore>>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
}

impl EngineBuilder {
    pub fn probe(mut self, probe: Arc<dyn HostProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.records = Some(store);
        self
    }

    pub fn dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(store);
        self
    }

    /// Opens the queue and starts the record outbox. Must be called from
    /// within a tokio runtime.
    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        config.validate()?;

        let queue = match &config.queue.state_file {
            Some(path) => JobQueue::open(QueueJournal::open(path)?)?,
            None => JobQueue::in_memory(),
        };
        let queue = Arc::new(queue.with_retention(config.queue.finished_retention));

        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SysinfoProbe::new()));
        let controller = Arc::new(ResourceController::new(config.resources.clone(), probe));

        let records = self
            .records
            .unwrap_or_else(|| Arc::new(LoggingRecordStore));
        let dead_letters = self.dead_letters.unwrap_or_else(|| {
            Arc::new(JsonlDeadLetterStore::new(&config.outcome.dead_letter_file))
        });

        let hub = Arc::new(EventHub::new(config.outcome.event_buffer));
        // The drain task ends with the last emitter clone; run() flushes it.
        let (emitter, _drain) = EventEmitter::spawn(hub, records, config.outcome.event_buffer);

        let supervisor = Arc::new(Supervisor::new(
            self.sandbox,
            config.sandbox.clone(),
            emitter.clone(),
        ));
        let pipeline = Arc::new(OutcomePipeline::new(
            queue.clone(),
            emitter.clone(),
            dead_letters,
        ));

        Ok(Engine {
            limits: config.submission_limits(),
            workers: Worker {
                queue: queue.clone(),
                controller: controller.clone(),
                supervisor,
                pipeline,
                emitter: emitter.clone(),
                resource_delay: config.queue.resource_delay(),
            },
            config,
            queue,
            controller,
            emitter,
        })
    }
}

pub struct Engine {
    config: RunboxConfig,
    limits: SubmissionLimits,
    queue: Arc<JobQueue>,
    controller: Arc<ResourceController>,
    emitter: EventEmitter,
    workers: Worker,
}

impl Engine {
    pub fn builder(config: RunboxConfig, sandbox: Arc<dyn Sandbox>) -> EngineBuilder {
        EngineBuilder {
            config,
            sandbox,
            probe: None,
            records: None,
            dead_letters: None,
        }
    }

    pub fn config(&self) -> &RunboxConfig {
        &self.config
    }

    /// Validates and enqueues a payload. Only validation and queue errors
    /// are reported here; everything after admission is reported as events.
    pub async fn submit(&self, payload: JobPayload) -> Result<JobId, EngineError> {
        let original = serde_json::to_value(&payload)
            .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?;
        self.enqueue(&payload, original).await
    }

    /// Like [`Engine::submit`] for a raw JSON document, which is kept verbatim
    /// for dead-letter records.
    pub async fn submit_json(&self, document: serde_json::Value) -> Result<JobId, EngineError> {
        let payload: JobPayload = serde_json::from_value(document.clone())
            .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?;
        self.enqueue(&payload, document).await
    }

    async fn enqueue(
        &self,
        payload: &JobPayload,
        original: serde_json::Value,
    ) -> Result<JobId, EngineError> {
        let normalized = payload.normalize(&self.limits)?;
        let options = EnqueueOptions {
            attempts: normalized.max_attempts,
            backoff: self.config.queue.backoff(),
        };
        let job = Job::new(normalized, original);
        let id = job.id.clone();

        // Queued must be emitted before any worker can claim the job.
        self.queue
            .enqueue_with(job, options, |stored| {
                self.emitter.save_job(stored);
                self.emitter
                    .status(&stored.id, StatusUpdate::new(EventStatus::Queued));
            })
            .await?;
        log::info!("Accepted job {}", id);
        Ok(id)
    }

    /// Live events for a job. Dropping the receiver unsubscribes.
    pub fn subscribe(&self, job_id: &JobId) -> broadcast::Receiver<OutcomeEvent> {
        self.emitter.hub().subscribe(job_id)
    }

    pub async fn job(&self, job_id: &JobId) -> Option<Job> {
        self.queue.get(job_id).await
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            queue: self.queue.stats().await,
            capacity: self.controller.current_capacity(),
            active_containers: self.controller.active(),
            dropped_records: self.emitter.dropped_records(),
        }
    }

    pub fn resources(&self) -> ResourceSnapshot {
        self.controller.snapshot()
    }

    /// Waits until record-store calls for events emitted so far are applied.
    pub async fn flush_records(&self) {
        self.emitter.flush_records().await;
    }

    pub fn controller(&self) -> &Arc<ResourceController> {
        &self.controller
    }

    /// Runs the worker pool until `shutdown` resolves or the queue is closed,
    /// then waits for attempts already running.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), EngineError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut in_flight = JoinSet::new();
        let recheck = self.config.resources.sample_interval();
        log::info!(
            "Engine started with capacity {}",
            self.controller.current_capacity()
        );

        let outcome = loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_join(joined);
            }

            if in_flight.len() >= self.controller.current_capacity() {
                tokio::select! {
                    _ = &mut shutdown => break Ok(()),
                    Some(joined) = in_flight.join_next() => log_join(joined),
                    _ = tokio::time::sleep(recheck) => {}
                }
                continue;
            }

            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                claimed = self.queue.claim_next() => match claimed {
                    Ok(Some(job)) => {
                        let worker = self.workers.clone();
                        in_flight.spawn(async move { worker.process(job).await });
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => {
                        log::error!("Failed to claim next job: {}", e);
                        break Err(EngineError::Queue(e));
                    }
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => log_join(joined),
            }
        };

        log::info!(
            "Engine stopping, waiting for {} in-flight attempt(s)",
            in_flight.len()
        );
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
        self.flush_records().await;
        outcome
    }

    /// Stops claiming; a running [`Engine::run`] returns after draining.
    pub fn close(&self) {
        self.queue.close();
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        log::error!("Worker task failed: {}", e);
    }
}

/// What each spawned attempt needs.
#[derive(Clone)]
struct Worker {
    queue: Arc<JobQueue>,
    controller: Arc<ResourceController>,
    supervisor: Arc<Supervisor>,
    pipeline: Arc<OutcomePipeline>,
    emitter: EventEmitter,
    resource_delay: Duration,
}

impl Worker {
    async fn process(self, job: Job) {
        let resources = job.spec.resources;
        if !self
            .controller
            .can_admit(resources.memory_limit, resources.cpu_quota)
        {
            let until = Utc::now()
                + chrono::Duration::from_std(self.resource_delay)
                    .unwrap_or_else(|_| chrono::Duration::zero());
            match self.queue.delay(&job.id, until).await {
                Ok(()) => {
                    log::info!(
                        "Job {} delayed {:?} waiting for resources",
                        job.id,
                        self.resource_delay
                    );
                    self.emitter
                        .status(&job.id, StatusUpdate::new(EventStatus::Delayed));
                }
                Err(e) => log::error!("Failed to delay job {}: {}", job.id, e),
            }
            return;
        }

        let slot = self.controller.acquire();
        let attempt = job.attempts + 1;
        self.emitter.status(
            &job.id,
            StatusUpdate::new(EventStatus::Active).attempt(attempt),
        );
        log::info!(
            "Job {} attempt {}/{} started",
            job.id,
            attempt,
            job.max_attempts
        );

        let result = self.supervisor.run_attempt(&job, slot).await;
        if let Err(e) = self.pipeline.handle(&job, result).await {
            log::error!("Failed to record outcome of job {}: {}", job.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{MemoryDeadLetterStore, MemoryRecordStore};
    use crate::resources::{FixedProbe, HostSample};
    use crate::sandbox::{Script, ScriptedSandbox};
    use tempfile::TempDir;

    fn config(root: &TempDir) -> RunboxConfig {
        let mut config = RunboxConfig::default();
        config.sandbox.workspace_root = root.path().join("ws");
        config.outcome.dead_letter_file = root.path().join("dead.jsonl");
        config
    }

    fn probe() -> Arc<FixedProbe> {
        Arc::new(FixedProbe::new(HostSample {
            total_memory: 32 << 30,
            free_memory: 16 << 30,
            cpus: 8,
        }))
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_payload_synchronously() {
        let root = TempDir::new().unwrap();
        let engine = Engine::builder(config(&root), Arc::new(ScriptedSandbox::new(Script::stdout("", 0))))
            .probe(probe())
            .record_store(Arc::new(MemoryRecordStore::new()))
            .build()
            .unwrap();

        let err = engine
            .submit(JobPayload {
                source_code: Some("x".to_string()),
                timeout_ms: Some(500_000),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::TimeoutTooLarge { .. })
        ));
        assert_eq!(engine.stats().await.queue, QueueStats::default());
    }

    #[tokio::test]
    async fn test_submit_json_keeps_original_document() {
        let root = TempDir::new().unwrap();
        let engine = Engine::builder(config(&root), Arc::new(ScriptedSandbox::new(Script::stdout("", 0))))
            .probe(probe())
            .build()
            .unwrap();
        let document = serde_json::json!({
            "job_id": "doc",
            "raw_code": "print(1)",
            "runtime": "python",
            "extra": "kept"
        });
        let id = engine.submit_json(document.clone()).await.unwrap();
        let job = engine.job(&id).await.unwrap();
        assert_eq!(job.payload, document);

        let err = engine
            .submit_json(serde_json::json!({"timeout_ms": "soon"}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::MalformedPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let root = TempDir::new().unwrap();
        let dead = Arc::new(MemoryDeadLetterStore::new());
        let engine = Engine::builder(config(&root), Arc::new(ScriptedSandbox::new(Script::stdout("", 0))))
            .probe(probe())
            .dead_letter_store(dead)
            .build()
            .unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            engine.run(tokio::time::sleep(Duration::from_millis(20))),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}
