//! Job execution engine for untrusted code.
//!
//! This crate accepts jobs (a git repository or raw source plus commands),
//! runs each attempt in a resource-bounded container and reports what
//! happened as a stream of status and log events.
//!
//! # Architecture Overview
//!
//! - **Job model**: payload normalisation, allow-listed command plans, runtime table
//! - **Durable queue**: FIFO claiming, delayed re-scheduling, bounded retries with backoff
//! - **Resource controller**: host sampling and admission capacity
//! - **Execution supervisor**: workspace, container lifecycle, timeout, log capture
//! - **Outcome pipeline**: completion, retries, dead-lettering and event fan-out
//! - **Engine**: the worker pool tying the above together

pub mod config;
pub mod engine;
pub mod errors;
pub mod job;
pub mod outcome;
pub mod queue;
pub mod resources;
pub mod sandbox;
pub mod supervisor;

pub use config::{ConfigLoader, RunboxConfig};
pub use engine::{Engine, EngineBuilder, EngineStats};
pub use errors::{
    ConfigError, DeadLetterError, EngineError, PersistenceError, QueueError, SandboxError,
    ValidationError,
};
pub use job::{Job, JobId, JobPayload, JobStatus, Runtime};
pub use outcome::{EventKind, EventStatus, OutcomeEvent};
pub use sandbox::Sandbox;
