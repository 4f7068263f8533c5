//! Normalisation of submitted job payloads.
//!
//! The submission layer hands over a loosely shaped [`JobPayload`]. This module
//! turns it into a [`JobSpec`] or rejects it with a [`ValidationError`]; nothing
//! that fails here is ever enqueued.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::command::{sanitize_env, validate_dependency, CommandPlan};
use super::runtime::Runtime;
use super::{CommandSpec, JobId, JobSource, JobSpec, ResourceRequest};
use crate::errors::ValidationError;

pub const MIB: u64 = 1024 * 1024;
pub const MIN_MEMORY_BYTES: u64 = 128 * MIB;

/// Memory given either as a byte count or a string such as `"512MB"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemorySize {
    Bytes(u64),
    Text(String),
}

impl MemorySize {
    pub fn to_bytes(&self) -> Result<u64, ValidationError> {
        match self {
            MemorySize::Bytes(b) => Ok(*b),
            MemorySize::Text(s) => parse_memory_size(s),
        }
    }
}

/// Parses `"512MB"`, `"1GB"`, `"256KB"`, `"512m"` or a plain byte count.
pub fn parse_memory_size(raw: &str) -> Result<u64, ValidationError> {
    let upper = raw.trim().to_uppercase();
    let invalid = || ValidationError::InvalidMemorySize(raw.to_string());
    let split = upper
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(upper.len());
    let (number, unit) = upper.split_at(split);
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let multiplier = match unit.trim() {
        "" | "B" => 1u64,
        "K" | "KB" => 1024,
        "M" | "MB" => MIB,
        "G" | "GB" => 1024 * MIB,
        _ => return Err(invalid()),
    };
    Ok((value * multiplier as f64).floor() as u64)
}

/// Job payload as produced by the submission layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub git_link: Option<String>,
    #[serde(default, alias = "raw_code")]
    pub source_code: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<MemorySize>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default, alias = "initial_cmds")]
    pub setup_commands: Vec<String>,
    #[serde(default, alias = "build_cmd")]
    pub run_command: Option<String>,
    #[serde(default)]
    pub start_directory: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub attempts: Option<u32>,
}

/// Limits and defaults applied while normalising payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionLimits {
    pub max_timeout_ms: u64,
    pub default_timeout_ms: u64,
    pub default_memory_limit: u64,
    pub default_cpu_quota: f64,
    pub default_attempts: u32,
}

impl Default for SubmissionLimits {
    fn default() -> Self {
        Self {
            max_timeout_ms: 180_000,
            default_timeout_ms: 180_000,
            default_memory_limit: 512 * MIB,
            default_cpu_quota: 0.5,
            default_attempts: 3,
        }
    }
}

/// A payload that passed validation.
#[derive(Debug, Clone)]
pub struct NormalizedJob {
    pub id: JobId,
    pub spec: JobSpec,
    pub max_attempts: u32,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl JobPayload {
    pub fn normalize(&self, limits: &SubmissionLimits) -> Result<NormalizedJob, ValidationError> {
        let id = match non_blank(&self.job_id) {
            Some(raw) => JobId::parse(raw)?,
            None => JobId::generate(),
        };

        let runtime = match non_blank(&self.runtime) {
            Some(raw) => raw.parse::<Runtime>()?,
            None => Runtime::default(),
        };

        let source = match (non_blank(&self.git_link), non_blank(&self.source_code)) {
            (None, None) => return Err(ValidationError::MissingSource),
            (Some(_), Some(_)) => return Err(ValidationError::ConflictingSource),
            (Some(link), None) => JobSource::GitRepo {
                git_link: link.to_string(),
            },
            (None, Some(_)) => {
                if !runtime.supports_raw_code() {
                    return Err(ValidationError::UnsupportedRawRuntime {
                        runtime: runtime.to_string(),
                        supported: Runtime::raw_code_runtimes()
                            .iter()
                            .map(|r| r.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                    });
                }
                let dependencies = self
                    .dependencies
                    .iter()
                    .filter(|d| !d.trim().is_empty())
                    .map(|d| validate_dependency(d))
                    .collect::<Result<Vec<_>, _>>()?;
                JobSource::RawCode {
                    source_code: self.source_code.clone().unwrap_or_default(),
                    dependencies,
                }
            }
        };

        let timeout_ms = self.timeout_ms.unwrap_or(limits.default_timeout_ms);
        if timeout_ms == 0 {
            return Err(ValidationError::ZeroTimeout);
        }
        if timeout_ms > limits.max_timeout_ms {
            return Err(ValidationError::TimeoutTooLarge {
                requested_ms: timeout_ms,
                max_ms: limits.max_timeout_ms,
            });
        }

        let requested_memory = match &self.memory_limit {
            Some(size) => size.to_bytes()?,
            None => limits.default_memory_limit,
        };
        let memory_limit = if requested_memory >= MIN_MEMORY_BYTES {
            requested_memory
        } else {
            log::debug!(
                "Memory request of {} bytes is below the minimum, using default",
                requested_memory
            );
            limits.default_memory_limit
        };
        let cpu_quota = match self.cpus {
            Some(cpus) if cpus > 0.0 && cpus.is_finite() => cpus,
            _ => limits.default_cpu_quota,
        };

        let max_attempts = self.attempts.unwrap_or(limits.default_attempts);
        if max_attempts == 0 {
            return Err(ValidationError::InvalidAttempts(max_attempts));
        }

        let mut setup = Vec::new();
        if let JobSource::RawCode { dependencies, .. } = &source {
            if let (Some(installer), false) = (runtime.profile().installer, dependencies.is_empty()) {
                setup.push(format!("{} {}", installer, dependencies.join(" ")));
            }
        }
        setup.extend(
            self.setup_commands
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
        );

        let run = match (non_blank(&self.run_command), &source) {
            (Some(cmd), _) => Some(cmd.to_string()),
            (None, JobSource::RawCode { .. }) => Some(runtime.profile().default_command.to_string()),
            (None, JobSource::GitRepo { .. }) => None,
        };

        let spec = JobSpec {
            source,
            runtime,
            resources: ResourceRequest {
                memory_limit,
                cpu_quota,
            },
            timeout_ms,
            commands: CommandSpec {
                setup,
                run,
                start_directory: non_blank(&self.start_directory).map(str::to_string),
                env: sanitize_env(&self.env),
            },
        };

        // Build once so every rejection surfaces at submission time.
        spec.validate(limits.max_timeout_ms)?;

        Ok(NormalizedJob {
            id,
            spec,
            max_attempts,
        })
    }
}

impl JobSpec {
    /// Re-checks invariants that must hold before anything is spawned.
    pub fn validate(&self, max_timeout_ms: u64) -> Result<CommandPlan, ValidationError> {
        if self.timeout_ms == 0 {
            return Err(ValidationError::ZeroTimeout);
        }
        if self.timeout_ms > max_timeout_ms {
            return Err(ValidationError::TimeoutTooLarge {
                requested_ms: self.timeout_ms,
                max_ms: max_timeout_ms,
            });
        }
        if let JobSource::RawCode { .. } = self.source {
            if !self.runtime.supports_raw_code() {
                return Err(ValidationError::UnsupportedRawRuntime {
                    runtime: self.runtime.to_string(),
                    supported: Runtime::raw_code_runtimes()
                        .iter()
                        .map(|r| r.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }
        self.plan()
    }

    pub fn plan(&self) -> Result<CommandPlan, ValidationError> {
        let mut builder = CommandPlan::builder();
        if let JobSource::GitRepo { git_link } = &self.source {
            builder = builder.clone_repo(git_link)?;
        }
        if let Some(dir) = &self.commands.start_directory {
            builder = builder.change_dir(dir)?;
        }
        builder = builder.commands(&self.commands.setup)?;
        if let Some(run) = &self.commands.run {
            builder = builder.command(run)?;
        }
        builder.build()
    }
}
