//! Configuration type definitions for the engine
//!
//! Every field has a default so an empty YAML document is a valid
//! configuration. Memory sizes accept either a byte count or a string such as
//! `"512MB"`.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::job::payload::{MIB, MIN_MEMORY_BYTES};
use crate::job::{Backoff, MemorySize, SubmissionLimits};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunboxConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub outcome: OutcomeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Snapshot file; the queue is memory-only when unset.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default = "default_attempts")]
    pub default_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// How long a job refused by the resource gate waits before re-surfacing.
    #[serde(default = "default_resource_delay_ms")]
    pub resource_delay_ms: u64,
    /// Completed and dead-lettered jobs kept in the queue for lookups.
    #[serde(default = "default_finished_retention")]
    pub finished_retention: usize,
}

impl QueueConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::exponential(Duration::from_millis(self.backoff_base_ms))
    }

    pub fn resource_delay(&self) -> Duration {
        Duration::from_millis(self.resource_delay_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            state_file: None,
            default_attempts: default_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            resource_delay_ms: default_resource_delay_ms(),
            finished_retention: default_finished_retention(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default = "default_max_containers")]
    pub max_containers: usize,
    #[serde(
        default = "default_per_container_memory",
        deserialize_with = "deserialize_memory"
    )]
    pub per_container_memory_estimate: u64,
    /// Upper bound on memory held back for the host OS.
    #[serde(
        default = "default_reserved_memory_floor",
        deserialize_with = "deserialize_memory"
    )]
    pub reserved_memory_floor: u64,
    #[serde(default = "default_cpu_utilization_target")]
    pub cpu_utilization_target: f64,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_sample_every_checks")]
    pub sample_every_checks: u32,
}

impl ResourcesConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            max_containers: default_max_containers(),
            per_container_memory_estimate: default_per_container_memory(),
            reserved_memory_floor: default_reserved_memory_floor(),
            cpu_utilization_target: default_cpu_utilization_target(),
            sample_interval_ms: default_sample_interval_ms(),
            sample_every_checks: default_sample_every_checks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(
        default = "default_memory_limit",
        deserialize_with = "deserialize_memory"
    )]
    pub default_memory_limit: u64,
    #[serde(default = "default_cpu_quota")]
    pub default_cpu_quota: f64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_true")]
    pub pull_images: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            container_prefix: default_container_prefix(),
            max_timeout_ms: default_max_timeout_ms(),
            default_timeout_ms: default_max_timeout_ms(),
            default_memory_limit: default_memory_limit(),
            default_cpu_quota: default_cpu_quota(),
            max_output_bytes: default_max_output_bytes(),
            pull_images: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeConfig {
    /// Capacity of each per-job event topic and of the record outbox.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_dead_letter_file")]
    pub dead_letter_file: PathBuf,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
            dead_letter_file: default_dead_letter_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn deserialize_memory<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let size = MemorySize::deserialize(deserializer)?;
    size.to_bytes().map_err(serde::de::Error::custom)
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    5_000
}

fn default_resource_delay_ms() -> u64 {
    10_000
}

fn default_finished_retention() -> usize {
    crate::queue::DEFAULT_FINISHED_RETENTION
}

fn default_max_containers() -> usize {
    8
}

fn default_per_container_memory() -> u64 {
    512 * MIB
}

fn default_reserved_memory_floor() -> u64 {
    2048 * MIB
}

fn default_cpu_utilization_target() -> f64 {
    0.75
}

fn default_sample_interval_ms() -> u64 {
    5_000
}

fn default_sample_every_checks() -> u32 {
    20
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("runbox-workspaces")
}

fn default_container_prefix() -> String {
    "runbox".to_string()
}

fn default_max_timeout_ms() -> u64 {
    180_000
}

fn default_memory_limit() -> u64 {
    512 * MIB
}

fn default_cpu_quota() -> f64 {
    0.5
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_event_buffer() -> usize {
    256
}

fn default_dead_letter_file() -> PathBuf {
    PathBuf::from("dead_letters.jsonl")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RunboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.default_attempts == 0 {
            return Err(ConfigError::Invalid(
                "queue.default_attempts must be greater than 0".to_string(),
            ));
        }

        let resources = &self.resources;
        if resources.max_containers == 0 {
            return Err(ConfigError::Invalid(
                "resources.max_containers must be greater than 0".to_string(),
            ));
        }
        if resources.per_container_memory_estimate == 0 {
            return Err(ConfigError::Invalid(
                "resources.per_container_memory_estimate must be greater than 0".to_string(),
            ));
        }
        if !(resources.cpu_utilization_target > 0.0 && resources.cpu_utilization_target <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "resources.cpu_utilization_target must be in (0, 1], got {}",
                resources.cpu_utilization_target
            )));
        }
        if resources.sample_every_checks == 0 {
            return Err(ConfigError::Invalid(
                "resources.sample_every_checks must be greater than 0".to_string(),
            ));
        }

        let sandbox = &self.sandbox;
        if sandbox.max_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.max_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if sandbox.default_timeout_ms == 0 || sandbox.default_timeout_ms > sandbox.max_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "sandbox.default_timeout_ms must be between 1 and {}",
                sandbox.max_timeout_ms
            )));
        }
        if sandbox.default_memory_limit < MIN_MEMORY_BYTES {
            return Err(ConfigError::Invalid(format!(
                "sandbox.default_memory_limit must be at least {} bytes",
                MIN_MEMORY_BYTES
            )));
        }
        if !(sandbox.default_cpu_quota > 0.0 && sandbox.default_cpu_quota.is_finite()) {
            return Err(ConfigError::Invalid(
                "sandbox.default_cpu_quota must be positive".to_string(),
            ));
        }
        if sandbox.container_prefix.is_empty()
            || !sandbox
                .container_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::Invalid(format!(
                "sandbox.container_prefix '{}' must be a non-empty identifier",
                sandbox.container_prefix
            )));
        }

        if self.outcome.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "outcome.event_buffer must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn submission_limits(&self) -> SubmissionLimits {
        SubmissionLimits {
            max_timeout_ms: self.sandbox.max_timeout_ms,
            default_timeout_ms: self.sandbox.default_timeout_ms,
            default_memory_limit: self.sandbox.default_memory_limit,
            default_cpu_quota: self.sandbox.default_cpu_quota,
            default_attempts: self.queue.default_attempts,
        }
    }
}
