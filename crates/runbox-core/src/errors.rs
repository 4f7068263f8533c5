//! Error types for the job execution engine
//!
//! Errors are grouped by the subsystem that raises them so callers can pick a
//! policy per source: validation errors are returned to the submitter, queue
//! errors decide whether the engine can keep running, and sandbox or
//! persistence errors are folded into a job outcome or logged.

use thiserror::Error;

use crate::job::JobId;

/// Rejections raised while normalising or re-checking a job payload.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Either a git repository link or raw source code is required")]
    MissingSource,
    #[error("Only one of git link and raw source code may be provided")]
    ConflictingSource,
    #[error("Invalid git link '{0}': expected http(s)://, git@ or ssh:// and no shell metacharacters")]
    InvalidGitLink(String),
    #[error("Unknown runtime '{0}'")]
    UnknownRuntime(String),
    #[error("Runtime '{runtime}' is not supported for raw code execution. Supported runtimes: {supported}")]
    UnsupportedRawRuntime { runtime: String, supported: String },
    #[error("Timeout of {requested_ms}ms exceeds the maximum of {max_ms}ms")]
    TimeoutTooLarge { requested_ms: u64, max_ms: u64 },
    #[error("Timeout must be greater than zero")]
    ZeroTimeout,
    #[error("Command rejected by the allow-list: '{0}'")]
    DisallowedCommand(String),
    #[error("No runnable command after sanitization")]
    NoCommands,
    #[error("Invalid start directory '{0}'")]
    InvalidStartDirectory(String),
    #[error("Invalid job id '{0}': expected 1-64 characters of [A-Za-z0-9_-]")]
    InvalidJobId(String),
    #[error("Invalid dependency name '{0}'")]
    InvalidDependency(String),
    #[error("Invalid memory size '{0}'")]
    InvalidMemorySize(String),
    #[error("Invalid attempts value {0}: must be at least 1")]
    InvalidAttempts(u32),
    #[error("Malformed job payload: {0}")]
    MalformedPayload(String),
}

/// Failures of the durable queue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job '{0}' already exists")]
    DuplicateJob(JobId),
    #[error("Job '{0}' not found")]
    NotFound(JobId),
    #[error("Job '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: crate::job::JobStatus,
        to: crate::job::JobStatus,
    },
    #[error("Queue is closed")]
    Closed,
    #[error("Queue storage error: {0}")]
    Storage(String),
    #[error("Queue snapshot is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Storage(err.to_string())
    }
}

/// Errors raised by a sandbox backend.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Bollard (Docker client) error: {0}")]
    BollardError(#[from] bollard::errors::Error),
    #[error("I/O error during sandbox operation: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Sandbox launch failed: {0}")]
    LaunchFailed(String),
    #[error("Sandbox wait stream ended without an exit status")]
    MissingExitStatus,
}

/// Errors from the record persistence interface. Never fatal for a job.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Record store unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the dead-letter store. Logged, never escalated.
#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("I/O error writing dead letter: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Malformed dead-letter record on line {line}: {message}")]
    Malformed { line: usize, message: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },
    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error returned by [`crate::engine::Engine`].
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
