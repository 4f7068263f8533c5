//! Job records and their lifecycle.
//!
//! A [`Job`] is the unit of work handed between the queue, the supervisor and
//! the outcome pipeline. Its [`JobStatus`] only moves along the edges allowed by
//! [`JobStatus::can_transition_to`]; the queue refuses anything else.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::ValidationError;

pub mod command;
pub mod payload;
pub mod runtime;

pub use command::{CommandPlan, ShellStep};
pub use payload::{parse_memory_size, JobPayload, MemorySize, NormalizedJob, SubmissionLimits};
pub use runtime::{Runtime, RuntimeProfile};

static JOB_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("job id pattern"));

/// Identifier used as queue key, workspace directory, container suffix and
/// event topic. Restricted to characters safe in all four places.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("job_{}", &uuid[..8]))
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        if JOB_ID.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(ValidationError::InvalidJobId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "submission_type", rename_all = "snake_case")]
pub enum JobSource {
    GitRepo {
        git_link: String,
    },
    RawCode {
        source_code: String,
        #[serde(default)]
        dependencies: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Bytes.
    pub memory_limit: u64,
    /// Fractional cores.
    pub cpu_quota: f64,
}

impl ResourceRequest {
    /// Docker-style memory string, e.g. `512m`.
    pub fn memory_arg(&self) -> String {
        format!("{}m", self.memory_limit / payload::MIB)
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_quota * 1_000_000_000.0) as i64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub start_directory: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Validated description of what to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub source: JobSource,
    pub runtime: Runtime,
    pub resources: ResourceRequest,
    pub timeout_ms: u64,
    pub commands: CommandSpec,
}

impl JobSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for claiming.
    Queued,
    /// Scheduled for a retry once its backoff elapses.
    Waiting,
    Active,
    /// Held back by the resource gate.
    Delayed,
    Completed,
    Failed,
    DeadLettered,
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Active)
                | (Queued, Delayed)
                | (Waiting, Queued)
                | (Delayed, Queued)
                | (Active, Delayed)
                | (Active, Waiting)
                | (Active, Completed)
                | (Active, Failed)
                | (Failed, DeadLettered)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::DeadLettered
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Delayed => "delayed",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential retry backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub base_delay_ms: u64,
}

impl Backoff {
    const MAX_DELAY_MS: u64 = 60 * 60 * 1000;

    pub fn exponential(base: Duration) -> Self {
        Self {
            base_delay_ms: base.as_millis() as u64,
        }
    }

    /// Delay before the retry that follows `attempts_made` failed attempts.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(31);
        let millis = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(Self::MAX_DELAY_MS);
        Duration::from_millis(millis)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base_delay_ms: 5000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    /// Payload exactly as submitted, kept for dead-letter records.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(normalized: NormalizedJob, payload: serde_json::Value) -> Self {
        Self {
            id: normalized.id,
            spec: normalized.spec,
            payload,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: normalized.max_attempts,
            backoff: Backoff::default(),
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            last_error: None,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}
