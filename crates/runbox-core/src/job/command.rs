//! Allow-listed command assembly.
//!
//! Commands arrive as free-form strings. Each one is split on `&&` into steps
//! and each step into argument tokens; every token must match the allow-list
//! or the whole command is rejected. Nothing is escaped. The shell script
//! handed to the sandbox is rendered only from validated steps.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

use crate::errors::ValidationError;

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9.\-/_=:@+%()\[\],]+$").expect("token pattern"));

static GIT_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i:https?://|git@|ssh://)[A-Za-z0-9._~:/@%+\-]+$").expect("git link pattern")
});

static ENV_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env key pattern"));

/// One command of the script as an argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellStep {
    argv: Vec<String>,
}

impl ShellStep {
    fn from_tokens(tokens: Vec<String>) -> Self {
        Self { argv: tokens }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn render(&self) -> String {
        self.argv.join(" ")
    }
}

/// Ordered steps joined with `&&` so the first failing step stops the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandPlan {
    steps: Vec<ShellStep>,
}

impl CommandPlan {
    pub fn builder() -> CommandPlanBuilder {
        CommandPlanBuilder::default()
    }

    pub fn steps(&self) -> &[ShellStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn render(&self) -> String {
        self.steps
            .iter()
            .map(ShellStep::render)
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

#[derive(Debug, Default)]
pub struct CommandPlanBuilder {
    steps: Vec<ShellStep>,
    user_steps: usize,
}

impl CommandPlanBuilder {
    /// `git clone <link> .` into the workspace.
    pub fn clone_repo(mut self, link: &str) -> Result<Self, ValidationError> {
        let link = validate_git_link(link)?;
        self.steps.push(ShellStep::from_tokens(vec![
            "git".to_string(),
            "clone".to_string(),
            link,
            ".".to_string(),
        ]));
        Ok(self)
    }

    pub fn change_dir(mut self, dir: &str) -> Result<Self, ValidationError> {
        let dir = validate_start_dir(dir)?;
        self.steps
            .push(ShellStep::from_tokens(vec!["cd".to_string(), dir]));
        Ok(self)
    }

    pub fn command(mut self, raw: &str) -> Result<Self, ValidationError> {
        let steps = parse_command(raw)?;
        self.user_steps += steps.len();
        self.steps.extend(steps);
        Ok(self)
    }

    pub fn commands<I, S>(self, raw: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        raw.into_iter()
            .try_fold(self, |builder, cmd| builder.command(cmd.as_ref()))
    }

    /// Fails when no user command survived; clone and cd alone do not count.
    pub fn build(self) -> Result<CommandPlan, ValidationError> {
        if self.user_steps == 0 {
            return Err(ValidationError::NoCommands);
        }
        Ok(CommandPlan { steps: self.steps })
    }
}

/// Splits a command into allow-listed steps. Blank input yields no steps.
pub fn parse_command(raw: &str) -> Result<Vec<ShellStep>, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let mut steps = Vec::new();
    for part in trimmed.split("&&") {
        let tokens: Vec<String> = part.split_whitespace().map(str::to_string).collect();
        if tokens.is_empty() || tokens.iter().any(|t| !TOKEN.is_match(t)) {
            return Err(ValidationError::DisallowedCommand(trimmed.to_string()));
        }
        steps.push(ShellStep::from_tokens(tokens));
    }
    Ok(steps)
}

pub fn validate_git_link(link: &str) -> Result<String, ValidationError> {
    let link = link.trim();
    if GIT_LINK.is_match(link) {
        Ok(link.to_string())
    } else {
        Err(ValidationError::InvalidGitLink(link.to_string()))
    }
}

/// Relative path made of allow-listed characters, no `..` components.
pub fn validate_start_dir(dir: &str) -> Result<String, ValidationError> {
    let dir = dir.trim();
    let invalid = || ValidationError::InvalidStartDirectory(dir.to_string());
    if !TOKEN.is_match(dir) || dir.starts_with('/') {
        return Err(invalid());
    }
    if dir.split('/').any(|component| component == "..") {
        return Err(invalid());
    }
    Ok(dir.to_string())
}

pub fn validate_dependency(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    if TOKEN.is_match(name) {
        Ok(name.to_string())
    } else {
        Err(ValidationError::InvalidDependency(name.to_string()))
    }
}

/// Drops entries whose key is not a plain identifier.
pub fn sanitize_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(key, _)| {
            let keep = ENV_KEY.is_match(key);
            if !keep {
                log::warn!("Dropping environment variable with unsafe key '{}'", key);
            }
            keep
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
