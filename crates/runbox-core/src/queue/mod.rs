//! Durable FIFO job queue with delayed re-scheduling and bounded retries.
//!
//! Jobs are claimed in submission order among those that are `Queued`.
//! `Delayed` (resource gate) and `Waiting` (retry backoff) jobs carry a ready
//! time and are promoted back to `Queued` by the next claim that observes the
//! time has passed. With a journal configured every mutation is snapshotted to
//! disk before it becomes visible and replayed on open; jobs caught `Active`
//! by a restart are handed out again, which gives at-least-once delivery.
//! Only the most recent finished jobs are retained.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::errors::QueueError;
use crate::job::{Backoff, Job, JobId, JobStatus};

pub mod journal;

pub use journal::QueueJournal;

/// Completed and dead-lettered jobs kept for lookups by default.
pub const DEFAULT_FINISHED_RETENTION: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

/// What `retry_or_fail` decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    Exhausted {
        attempts: u32,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ScheduledEntry {
    id: JobId,
    ready_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct QueueState {
    jobs: BTreeMap<JobId, Job>,
    ready: VecDeque<JobId>,
    scheduled: Vec<ScheduledEntry>,
    next_seq: u64,
    /// Completed and dead-lettered jobs, oldest first.
    #[serde(default)]
    finished: VecDeque<JobId>,
}

impl QueueState {
    fn job_mut(&mut self, id: &JobId) -> Result<&mut Job, QueueError> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    fn transition(&mut self, id: &JobId, to: JobStatus) -> Result<&mut Job, QueueError> {
        let job = self.job_mut(id)?;
        if !job.status.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                from: job.status,
                to,
            });
        }
        job.status = to;
        Ok(job)
    }

    fn schedule(&mut self, id: JobId, ready_at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.scheduled.push(ScheduledEntry { id, ready_at, seq });
    }

    /// Records a job as finished and evicts the oldest beyond `retention`.
    fn retire(&mut self, id: &JobId, retention: usize) {
        self.finished.push_back(id.clone());
        while self.finished.len() > retention {
            if let Some(evicted) = self.finished.pop_front() {
                self.jobs.remove(&evicted);
            }
        }
    }

    /// Moves every due scheduled job to the back of the ready list, oldest first.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        if self.scheduled.is_empty() {
            return;
        }
        let (mut due, pending): (Vec<_>, Vec<_>) = self
            .scheduled
            .drain(..)
            .partition(|entry| entry.ready_at <= now);
        self.scheduled = pending;
        due.sort_by(|a, b| (a.ready_at, a.seq).cmp(&(b.ready_at, b.seq)));
        for entry in due {
            match self.transition(&entry.id, JobStatus::Queued) {
                Ok(_) => self.ready.push_back(entry.id),
                Err(e) => log::warn!("Dropping stale schedule entry: {}", e),
            }
        }
    }

    fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled.iter().map(|e| e.ready_at).min()
    }

    /// Re-surfaces jobs that were mid-flight when the snapshot was written.
    fn recover(&mut self) -> usize {
        let interrupted: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Active)
            .map(|job| job.id.clone())
            .collect();
        for id in interrupted.iter().rev() {
            if let Some(job) = self.jobs.get_mut(id) {
                job.status = JobStatus::Queued;
                job.started_at = None;
            }
            self.ready.push_front(id.clone());
        }
        interrupted.len()
    }
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    journal: Option<QueueJournal>,
    closed: AtomicBool,
    retention: usize,
}

impl JobQueue {
    /// Queue that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            journal: None,
            closed: AtomicBool::new(false),
            retention: DEFAULT_FINISHED_RETENTION,
        }
    }

    /// Opens (or creates) a queue backed by a snapshot file.
    pub fn open(journal: QueueJournal) -> Result<Self, QueueError> {
        let mut state = journal.load()?.unwrap_or_default();
        let recovered = state.recover();
        if recovered > 0 {
            log::warn!(
                "Re-queued {} job(s) that were active when the queue was last saved",
                recovered
            );
        }
        log::info!(
            "Opened job queue at {} with {} job(s)",
            journal.path().display(),
            state.jobs.len()
        );
        journal.save_now(&state)?;
        Ok(Self {
            state: Mutex::new(state),
            notify: Notify::new(),
            journal: Some(journal),
            closed: AtomicBool::new(false),
            retention: DEFAULT_FINISHED_RETENTION,
        })
    }

    /// How many completed or dead-lettered jobs stay available to [`JobQueue::get`].
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// Applies `change` and persists the result. If the snapshot cannot be
    /// written the in-memory state is left untouched.
    async fn commit<T, F>(&self, state: &mut QueueState, change: F) -> Result<T, QueueError>
    where
        F: FnOnce(&mut QueueState) -> Result<T, QueueError>,
    {
        let Some(journal) = &self.journal else {
            return change(state);
        };
        let mut next = state.clone();
        let outcome = change(&mut next)?;
        journal.save(&next).await?;
        *state = next;
        Ok(outcome)
    }

    pub async fn enqueue(&self, job: Job, options: EnqueueOptions) -> Result<(), QueueError> {
        self.enqueue_with(job, options, |_| {}).await
    }

    /// Like [`JobQueue::enqueue`]. `on_accepted` runs once the job is stored
    /// and before any claimer can see it.
    pub async fn enqueue_with<F>(
        &self,
        mut job: Job,
        options: EnqueueOptions,
        on_accepted: F,
    ) -> Result<(), QueueError>
    where
        F: FnOnce(&Job),
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(QueueError::DuplicateJob(job.id));
        }

        job.status = JobStatus::Queued;
        job.attempts = 0;
        job.max_attempts = options.attempts.max(1);
        job.backoff = options.backoff;
        let id = job.id.clone();
        self.commit(&mut state, |s| {
            s.jobs.insert(id.clone(), job);
            s.ready.push_back(id.clone());
            Ok(())
        })
        .await?;

        if let Some(stored) = state.jobs.get(&id) {
            on_accepted(stored);
        }
        drop(state);

        log::debug!("Enqueued job {}", id);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Claims the oldest eligible job, waiting while none is eligible.
    /// Returns `None` once the queue is closed.
    pub async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let now = Utc::now();
            let next_due = {
                let mut state = self.state.lock().await;
                state.promote_due(now);
                if let Some(id) = state.ready.front().cloned() {
                    let claimed = self
                        .commit(&mut state, |s| {
                            s.ready.pop_front();
                            let job = s.transition(&id, JobStatus::Active)?;
                            job.started_at = Some(now);
                            job.ended_at = None;
                            Ok(job.clone())
                        })
                        .await?;
                    return Ok(Some(claimed));
                }
                state.next_ready_at()
            };

            match next_due {
                Some(at) => {
                    let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Parks a queued or active job until `until` without consuming an attempt.
    pub async fn delay(&self, id: &JobId, until: DateTime<Utc>) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        self.commit(&mut state, |s| {
            s.transition(id, JobStatus::Delayed)?.started_at = None;
            s.ready.retain(|queued| queued != id);
            s.schedule(id.clone(), until);
            Ok(())
        })
        .await?;
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Counts a failed attempt and either schedules a retry or marks the job
    /// `Failed`.
    pub async fn retry_or_fail(&self, id: &JobId, error: &str) -> Result<RetryDecision, QueueError> {
        let mut state = self.state.lock().await;
        let decision = self
            .commit(&mut state, |s| {
                let (attempts, max_attempts, backoff) = {
                    let job = s.job_mut(id)?;
                    if job.status != JobStatus::Active {
                        return Err(QueueError::InvalidTransition {
                            id: id.clone(),
                            from: job.status,
                            to: JobStatus::Waiting,
                        });
                    }
                    job.attempts += 1;
                    job.last_error = Some(error.to_string());
                    (job.attempts, job.max_attempts, job.backoff)
                };

                if attempts < max_attempts {
                    let delay = backoff.delay_for(attempts);
                    s.transition(id, JobStatus::Waiting)?.started_at = None;
                    let ready_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    s.schedule(id.clone(), ready_at);
                    Ok(RetryDecision::Retry {
                        attempt: attempts,
                        max_attempts,
                        delay,
                    })
                } else {
                    s.transition(id, JobStatus::Failed)?.ended_at = Some(Utc::now());
                    Ok(RetryDecision::Exhausted { attempts })
                }
            })
            .await?;
        drop(state);
        self.notify.notify_waiters();
        Ok(decision)
    }

    /// Fails an active job without retrying; used for permanent errors.
    pub async fn fail(&self, id: &JobId, error: &str) -> Result<Job, QueueError> {
        let mut state = self.state.lock().await;
        self.commit(&mut state, |s| {
            let job = s.transition(id, JobStatus::Failed)?;
            job.attempts += 1;
            job.last_error = Some(error.to_string());
            job.ended_at = Some(Utc::now());
            Ok(job.clone())
        })
        .await
    }

    pub async fn complete(&self, id: &JobId) -> Result<Job, QueueError> {
        let retention = self.retention;
        let mut state = self.state.lock().await;
        self.commit(&mut state, |s| {
            let done = {
                let job = s.transition(id, JobStatus::Completed)?;
                job.attempts += 1;
                job.ended_at = Some(Utc::now());
                job.clone()
            };
            s.retire(id, retention);
            Ok(done)
        })
        .await
    }

    pub async fn mark_dead_lettered(&self, id: &JobId) -> Result<(), QueueError> {
        let retention = self.retention;
        let mut state = self.state.lock().await;
        self.commit(&mut state, |s| {
            s.transition(id, JobStatus::DeadLettered)?;
            s.retire(id, retention);
            Ok(())
        })
        .await
    }

    pub async fn get(&self, id: &JobId) -> Option<Job> {
        self.state.lock().await.jobs.get(id).cloned()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Waiting => stats.waiting += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Delayed => stats.delayed += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::DeadLettered => stats.dead_lettered += 1,
            }
        }
        stats
    }

    /// Wakes every blocked claimer; subsequent claims return `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobPayload, SubmissionLimits};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn job(id: &str) -> Job {
        let payload = JobPayload {
            job_id: Some(id.to_string()),
            source_code: Some("console.log('hi')".to_string()),
            ..Default::default()
        };
        let normalized = payload.normalize(&SubmissionLimits::default()).unwrap();
        Job::new(normalized, serde_json::to_value(&payload).unwrap())
    }

    fn quick_retry(attempts: u32) -> EnqueueOptions {
        EnqueueOptions {
            attempts,
            backoff: Backoff::exponential(Duration::from_millis(10)),
        }
    }

    #[tokio::test]
    async fn test_claims_in_fifo_order() {
        let queue = JobQueue::in_memory();
        for id in ["a", "b", "c"] {
            queue.enqueue(job(id), EnqueueOptions::default()).await.unwrap();
        }
        for id in ["a", "b", "c"] {
            let claimed = queue.claim_next().await.unwrap().unwrap();
            assert_eq!(claimed.id.as_str(), id);
            assert_eq!(claimed.status, JobStatus::Active);
            assert!(claimed.started_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_duplicate_job_is_rejected_and_original_kept() {
        let queue = JobQueue::in_memory();
        queue.enqueue(job("dup"), EnqueueOptions::default()).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        let err = queue
            .enqueue(job("dup"), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateJob(id) if id.as_str() == "dup"));

        let existing = queue.get(&JobId::parse("dup").unwrap()).await.unwrap();
        assert_eq!(existing.status, JobStatus::Active);
        assert_eq!(queue.stats().await.active, 1);
        assert_eq!(queue.stats().await.queued, 0);
    }

    #[tokio::test]
    async fn test_claim_blocks_until_enqueue() {
        let queue = Arc::new(JobQueue::in_memory());
        let claimer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim_next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!claimer.is_finished());

        queue.enqueue(job("late"), EnqueueOptions::default()).await.unwrap();
        let claimed = claimer.await.unwrap().unwrap().unwrap();
        assert_eq!(claimed.id.as_str(), "late");
    }

    #[tokio::test]
    async fn test_close_releases_blocked_claimers() {
        let queue = Arc::new(JobQueue::in_memory());
        let claimer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim_next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert!(claimer.await.unwrap().unwrap().is_none());
        assert!(matches!(
            queue.enqueue(job("x"), EnqueueOptions::default()).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_delay_resurfaces_without_consuming_attempt() {
        let queue = JobQueue::in_memory();
        queue.enqueue(job("d"), EnqueueOptions::default()).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();

        let until = Utc::now() + chrono::Duration::milliseconds(30);
        queue.delay(&claimed.id, until).await.unwrap();
        assert_eq!(queue.get(&claimed.id).await.unwrap().status, JobStatus::Delayed);

        let again = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.attempts, 0);
        assert!(Utc::now() >= until);
    }

    #[tokio::test]
    async fn test_retry_until_exhausted() {
        let queue = JobQueue::in_memory();
        queue.enqueue(job("r"), quick_retry(3)).await.unwrap();

        for expected_attempt in 1..=2 {
            let claimed = queue.claim_next().await.unwrap().unwrap();
            let decision = queue.retry_or_fail(&claimed.id, "boom").await.unwrap();
            assert!(matches!(
                decision,
                RetryDecision::Retry { attempt, max_attempts: 3, .. } if attempt == expected_attempt
            ));
            assert_eq!(queue.get(&claimed.id).await.unwrap().status, JobStatus::Waiting);
        }

        let claimed = queue.claim_next().await.unwrap().unwrap();
        let decision = queue.retry_or_fail(&claimed.id, "boom").await.unwrap();
        assert_eq!(decision, RetryDecision::Exhausted { attempts: 3 });

        let failed = queue.get(&claimed.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.attempts <= failed.max_attempts);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));

        queue.mark_dead_lettered(&claimed.id).await.unwrap();
        assert_eq!(queue.stats().await.dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_retry_requires_active_job() {
        let queue = JobQueue::in_memory();
        queue.enqueue(job("q"), EnqueueOptions::default()).await.unwrap();
        let err = queue
            .retry_or_fail(&JobId::parse("q").unwrap(), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_completed_job_cannot_be_requeued() {
        let queue = JobQueue::in_memory();
        queue.enqueue(job("c"), EnqueueOptions::default()).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();
        let done = queue.complete(&claimed.id).await.unwrap();
        assert_eq!(done.attempts, 1);
        assert!(done.duration_ms().is_some());

        let err = queue.delay(&claimed.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("queue.json");
        {
            let queue = JobQueue::open(QueueJournal::open(&path).unwrap()).unwrap();
            queue.enqueue(job("first"), EnqueueOptions::default()).await.unwrap();
            queue.enqueue(job("second"), EnqueueOptions::default()).await.unwrap();
            let claimed = queue.claim_next().await.unwrap().unwrap();
            assert_eq!(claimed.id.as_str(), "first");
        }

        let reopened = JobQueue::open(QueueJournal::open(&path).unwrap()).unwrap();
        let stats = reopened.stats().await;
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.active, 0);

        // The interrupted job is handed out again first.
        let claimed = reopened.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id.as_str(), "first");
        assert_eq!(claimed.attempts, 0);
    }

    #[tokio::test]
    async fn test_failed_snapshot_write_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().join("state");
        let queue = JobQueue::open(QueueJournal::open(state_dir.join("queue.json")).unwrap()).unwrap();
        queue.enqueue(job("w"), quick_retry(3)).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();

        std::fs::remove_dir_all(&state_dir).unwrap();
        assert!(matches!(
            queue.retry_or_fail(&claimed.id, "boom").await,
            Err(QueueError::Storage(_))
        ));
        assert!(queue.complete(&claimed.id).await.is_err());
        assert!(queue.fail(&claimed.id, "boom").await.is_err());
        assert!(queue.delay(&claimed.id, Utc::now()).await.is_err());
        assert!(queue.enqueue(job("lost"), EnqueueOptions::default()).await.is_err());

        let unchanged = queue.get(&claimed.id).await.unwrap();
        assert_eq!(unchanged.status, JobStatus::Active);
        assert_eq!(unchanged.attempts, 0);
        assert!(unchanged.last_error.is_none());
        assert!(queue.get(&JobId::parse("lost").unwrap()).await.is_none());
        assert_eq!(queue.stats().await.active, 1);

        std::fs::create_dir_all(&state_dir).unwrap();
        let done = queue.complete(&claimed.id).await.unwrap();
        assert_eq!(done.attempts, 1);
    }

    #[tokio::test]
    async fn test_accept_hook_runs_before_job_is_claimable() {
        let queue = Arc::new(JobQueue::in_memory());
        let claimer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim_next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let seen = std::sync::Mutex::new(None);
        queue
            .enqueue_with(job("hooked"), EnqueueOptions::default(), |stored| {
                *seen.lock().unwrap() = Some(stored.status);
            })
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(JobStatus::Queued));

        let claimed = claimer.await.unwrap().unwrap().unwrap();
        assert_eq!(claimed.id.as_str(), "hooked");
    }

    #[tokio::test]
    async fn test_finished_jobs_beyond_retention_are_evicted() {
        let queue = JobQueue::in_memory().with_retention(1);
        for id in ["old", "new"] {
            queue.enqueue(job(id), EnqueueOptions::default()).await.unwrap();
            let claimed = queue.claim_next().await.unwrap().unwrap();
            queue.complete(&claimed.id).await.unwrap();
        }

        assert!(queue.get(&JobId::parse("old").unwrap()).await.is_none());
        assert_eq!(
            queue.get(&JobId::parse("new").unwrap()).await.map(|j| j.status),
            Some(JobStatus::Completed)
        );
        assert_eq!(queue.stats().await.completed, 1);
    }
}
