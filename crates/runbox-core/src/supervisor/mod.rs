//! Runs one attempt of a job inside a sandbox.
//!
//! Each attempt walks `Admitted -> WorkspacePrepared -> ContainerLaunched ->
//! Streaming -> {Succeeded | Failed | TimedOut} -> CleanedUp`. Cleanup runs on
//! every path, including validation and launch failures, and is what releases
//! the admission slot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::SandboxConfig;
use crate::errors::SandboxError;
use crate::job::command::sanitize_env;
use crate::job::{CommandPlan, Job, JobSource};
use crate::outcome::EventEmitter;
use crate::resources::SlotGuard;
use crate::sandbox::{LaunchSpec, Sandbox, SandboxRun};

pub mod context;

pub use context::{AttemptPhase, CapturedOutput, ExecutionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The script ran and exited non-zero.
    Execution,
    TimedOut,
    /// The sandbox could not start the container or lost track of it.
    Spawn,
    /// The job was rejected before anything was spawned. Never retried.
    Validation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Execution => "execution",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Spawn => "spawn",
            ErrorKind::Validation => "validation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub exit_code: Option<i64>,
    pub output: CapturedOutput,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Succeeded {
        exit_code: i64,
        output: CapturedOutput,
    },
    Failed(AttemptFailure),
}

impl AttemptResult {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptResult::Succeeded { .. })
    }
}

pub struct Supervisor {
    sandbox: Arc<dyn Sandbox>,
    config: SandboxConfig,
    emitter: EventEmitter,
}

impl Supervisor {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: SandboxConfig, emitter: EventEmitter) -> Self {
        Self {
            sandbox,
            config,
            emitter,
        }
    }

    pub fn container_name(&self, job: &Job) -> String {
        format!("{}-{}", self.config.container_prefix, job.id)
    }

    pub fn workspace_for(&self, job: &Job) -> PathBuf {
        self.config.workspace_root.join(job.id.as_str())
    }

    /// Runs one attempt while holding `slot`, which is released when cleanup
    /// finishes.
    pub async fn run_attempt(&self, job: &Job, slot: SlotGuard) -> AttemptResult {
        let mut ctx = ExecutionContext::new(
            self.workspace_for(job),
            self.container_name(job),
            self.config.max_output_bytes,
            slot,
        );

        let result = match job.spec.validate(self.config.max_timeout_ms) {
            Ok(plan) => self.execute(&mut ctx, job, &plan).await,
            Err(e) => self.failure(&mut ctx, ErrorKind::Validation, &e),
        };

        self.cleanup(&mut ctx).await;
        result
    }

    async fn execute(&self, ctx: &mut ExecutionContext, job: &Job, plan: &CommandPlan) -> AttemptResult {
        let workspace = match self.prepare_workspace(ctx, job).await {
            Ok(path) => path,
            Err(e) => {
                let message = format!("Failed to prepare workspace: {}", e);
                return self.failure(ctx, ErrorKind::Spawn, &message);
            }
        };
        ctx.enter(AttemptPhase::WorkspacePrepared);

        let profile = job.spec.runtime.profile();
        let env = sanitize_env(&job.spec.commands.env)
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        let spec = LaunchSpec {
            container_name: ctx.container_name.clone(),
            image: profile.image.to_string(),
            script: plan.render(),
            workspace,
            memory_limit: job.spec.resources.memory_limit,
            nano_cpus: job.spec.resources.nano_cpus(),
            env,
        };

        log::info!(
            "Launching {} for job {} (image {}, memory {}, cpus {}, timeout {}ms)",
            spec.container_name,
            job.id,
            spec.image,
            job.spec.resources.memory_arg(),
            job.spec.resources.cpu_quota,
            job.spec.timeout_ms
        );

        let run = match self.sandbox.launch(&spec).await {
            Ok(run) => run,
            Err(e) => {
                let message = format!("Failed to launch container: {}", e);
                return self.failure(ctx, ErrorKind::Spawn, &message);
            }
        };
        ctx.enter(AttemptPhase::ContainerLaunched);

        let timeout = job.spec.timeout();
        match tokio::time::timeout(timeout, self.stream_until_exit(ctx, job, run)).await {
            Ok(Ok(0)) => {
                ctx.exit_code = Some(0);
                ctx.enter(AttemptPhase::Succeeded);
                AttemptResult::Succeeded {
                    exit_code: 0,
                    output: ctx.output(),
                }
            }
            Ok(Ok(code)) => {
                ctx.exit_code = Some(code);
                ctx.enter(AttemptPhase::Failed);
                AttemptResult::Failed(AttemptFailure {
                    kind: ErrorKind::Execution,
                    message: format!("Process exited with code {}", code),
                    exit_code: Some(code),
                    output: ctx.output(),
                })
            }
            Ok(Err(e)) => {
                let message = format!("Lost track of container: {}", e);
                self.failure(ctx, ErrorKind::Spawn, &message)
            }
            Err(_) => {
                log::warn!(
                    "Job {} timed out after {}ms, removing {}",
                    job.id,
                    job.spec.timeout_ms,
                    ctx.container_name
                );
                if let Err(e) = self.sandbox.force_remove(&ctx.container_name).await {
                    log::warn!(
                        "Failed to remove timed out container {}: {}",
                        ctx.container_name,
                        e
                    );
                }
                ctx.enter(AttemptPhase::TimedOut);
                AttemptResult::Failed(AttemptFailure {
                    kind: ErrorKind::TimedOut,
                    message: format!("Execution timed out after {}ms", job.spec.timeout_ms),
                    exit_code: None,
                    output: ctx.output(),
                })
            }
        }
    }

    async fn prepare_workspace(
        &self,
        ctx: &ExecutionContext,
        job: &Job,
    ) -> Result<PathBuf, std::io::Error> {
        tokio::fs::create_dir_all(&ctx.workspace).await?;
        if let JobSource::RawCode { source_code, .. } = &job.spec.source {
            if let Some(file_name) = job.spec.runtime.profile().file_name {
                tokio::fs::write(ctx.workspace.join(file_name), source_code).await?;
            }
        }
        // Bind mounts need an absolute host path.
        tokio::fs::canonicalize(&ctx.workspace).await
    }

    async fn stream_until_exit(
        &self,
        ctx: &mut ExecutionContext,
        job: &Job,
        mut run: SandboxRun,
    ) -> Result<i64, SandboxError> {
        ctx.enter(AttemptPhase::Streaming);
        while let Some(chunk) = run.output.recv().await {
            for line in ctx.ingest(chunk.stream, &chunk.bytes) {
                self.emitter.log(&job.id, chunk.stream, line);
            }
        }
        for (stream, line) in ctx.flush() {
            self.emitter.log(&job.id, stream, line);
        }
        run.exit.await
    }

    fn failure(
        &self,
        ctx: &mut ExecutionContext,
        kind: ErrorKind,
        error: &dyn fmt::Display,
    ) -> AttemptResult {
        ctx.enter(AttemptPhase::Failed);
        AttemptResult::Failed(AttemptFailure {
            kind,
            message: error.to_string(),
            exit_code: ctx.exit_code,
            output: ctx.output(),
        })
    }

    async fn cleanup(&self, ctx: &mut ExecutionContext) {
        if ctx.is_cleaned_up() {
            return;
        }
        if let Err(e) = self.sandbox.force_remove(&ctx.container_name).await {
            log::warn!("Failed to remove container {}: {}", ctx.container_name, e);
        }
        match tokio::fs::remove_dir_all(&ctx.workspace).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "Failed to remove workspace {}: {}",
                ctx.workspace.display(),
                e
            ),
        }
        ctx.mark_cleaned_up();
    }
}
