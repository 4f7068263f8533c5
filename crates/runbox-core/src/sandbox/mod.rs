//! Container backends that run a job's script in isolation.
//!
//! A [`Sandbox`] launches one container per attempt and hands back a live
//! output channel plus a future resolving to the exit code. Removal is by
//! container name so it works even when launch failed half-way.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::errors::SandboxError;

pub mod docker;
pub mod scripted;

pub use docker::DockerSandbox;
pub use scripted::{Script, ScriptedSandbox};

/// Mount point of the workspace inside the container.
pub const CONTAINER_WORKDIR: &str = "/app";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Raw bytes as read from the container; not aligned to lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub container_name: String,
    pub image: String,
    /// Passed to `/bin/sh -c`.
    pub script: String,
    /// Host directory bound to [`CONTAINER_WORKDIR`].
    pub workspace: PathBuf,
    pub memory_limit: u64,
    pub nano_cpus: i64,
    /// `KEY=value` entries.
    pub env: Vec<String>,
}

pub struct SandboxRun {
    pub output: mpsc::Receiver<OutputChunk>,
    pub exit: BoxFuture<'static, Result<i64, SandboxError>>,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Creates and starts the container. Output is delivered until the
    /// container stops; `exit` resolves with its status code.
    async fn launch(&self, spec: &LaunchSpec) -> Result<SandboxRun, SandboxError>;

    /// Force-removes the named container. Removing a container that does not
    /// exist succeeds.
    async fn force_remove(&self, container_name: &str) -> Result<(), SandboxError>;
}
