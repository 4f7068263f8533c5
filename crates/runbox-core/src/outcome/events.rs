//! Per-job status and log events and their in-process fan-out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::job::JobId;
use crate::sandbox::OutputStream;

/// Status as reported to subscribers. Wider than the queue's `JobStatus`:
/// `Retrying` marks a failed attempt that will run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Queued,
    Delayed,
    Active,
    Retrying,
    Completed,
    Failed,
    DeadLettered,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Queued => "queued",
            EventStatus::Delayed => "delayed",
            EventStatus::Active => "active",
            EventStatus::Retrying => "retrying",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 1-based attempt the update refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl StatusUpdate {
    pub fn new(status: EventStatus) -> Self {
        Self {
            status,
            exit_code: None,
            duration_ms: None,
            error: None,
            attempt: None,
        }
    }

    pub fn exit_code(mut self, code: Option<i64>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn duration_ms(mut self, duration: Option<u64>) -> Self {
        self.duration_ms = duration;
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Status(StatusUpdate),
    Log(LogLine),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub job_id: JobId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl OutcomeEvent {
    pub fn status(job_id: JobId, update: StatusUpdate) -> Self {
        Self {
            job_id,
            at: Utc::now(),
            kind: EventKind::Status(update),
        }
    }

    pub fn log(job_id: JobId, stream: OutputStream, text: String) -> Self {
        Self {
            job_id,
            at: Utc::now(),
            kind: EventKind::Log(LogLine { stream, text }),
        }
    }

    pub fn status_update(&self) -> Option<&StatusUpdate> {
        match &self.kind {
            EventKind::Status(update) => Some(update),
            EventKind::Log(_) => None,
        }
    }
}

/// Publish/subscribe keyed by job id. Publishing never blocks; a subscriber
/// that falls behind by more than the topic capacity sees `Lagged`.
pub struct EventHub {
    topics: Mutex<HashMap<JobId, broadcast::Sender<OutcomeEvent>>>,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribes to a job's future events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self, job_id: &JobId) -> broadcast::Receiver<OutcomeEvent> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(job_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn publish(&self, event: OutcomeEvent) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let job_id = event.job_id.clone();
        if let Some(sender) = topics.get(&job_id) {
            if sender.send(event).is_err() {
                topics.remove(&job_id);
            }
        }
    }

    /// Ends a job's topic; subscribers drain what is buffered and then see
    /// the channel closed.
    pub fn close(&self, job_id: &JobId) {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> JobId {
        JobId::parse(raw).unwrap()
    }

    #[test]
    fn test_event_json_shape() {
        let event = OutcomeEvent::status(
            id("job_1"),
            StatusUpdate::new(EventStatus::Completed)
                .exit_code(Some(0))
                .duration_ms(Some(12)),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["job_id"], "job_1");
        assert_eq!(value["kind"], "status");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["exit_code"], 0);
        assert!(value.get("error").is_none());

        let log = OutcomeEvent::log(id("job_1"), OutputStream::Stderr, "oops".to_string());
        let value = serde_json::to_value(&log).unwrap();
        assert_eq!(value["kind"], "log");
        assert_eq!(value["stream"], "stderr");
        assert_eq!(value["text"], "oops");

        let back: OutcomeEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, log);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let hub = EventHub::new(16);
        let job = id("ordered");
        let mut rx = hub.subscribe(&job);
        for n in 0..5 {
            hub.publish(OutcomeEvent::log(job.clone(), OutputStream::Stdout, n.to_string()));
        }
        for n in 0..5 {
            match rx.recv().await.unwrap().kind {
                EventKind::Log(line) => assert_eq!(line.text, n.to_string()),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_a_noop() {
        let hub = EventHub::new(4);
        hub.publish(OutcomeEvent::status(
            id("nobody"),
            StatusUpdate::new(EventStatus::Queued),
        ));
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_topics_pruned_after_last_unsubscribe() {
        let hub = EventHub::new(4);
        let job = id("pruned");
        let rx = hub.subscribe(&job);
        assert_eq!(hub.topic_count(), 1);
        drop(rx);
        hub.publish(OutcomeEvent::status(job, StatusUpdate::new(EventStatus::Active)));
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_subscription_after_buffered_events() {
        let hub = EventHub::new(4);
        let job = id("closing");
        let mut rx = hub.subscribe(&job);
        hub.publish(OutcomeEvent::status(
            job.clone(),
            StatusUpdate::new(EventStatus::Completed),
        ));
        hub.close(&job);
        assert!(rx.recv().await.is_ok());
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn test_slow_subscriber_never_blocks_publisher() {
        let hub = EventHub::new(2);
        let job = id("slow");
        let _rx = hub.subscribe(&job);
        for n in 0..100 {
            hub.publish(OutcomeEvent::log(job.clone(), OutputStream::Stdout, n.to_string()));
        }
        assert_eq!(hub.topic_count(), 1);
    }
}
