//! Command-line host for the runbox execution engine
//!
//! Loads the YAML configuration, connects to the local Docker daemon and runs
//! the worker pool until interrupted. Jobs are handed in as JSON files; their
//! events can be followed on stdout as JSON lines.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use runbox_core::outcome::{read_dead_letters, JsonlDeadLetterStore, LoggingRecordStore};
use runbox_core::sandbox::DockerSandbox;
use runbox_core::{ConfigLoader, Engine, JobId, RunboxConfig};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Runbox - run untrusted code in resource-bounded containers")]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(long, short, global = true, help = "Path to the YAML configuration (defaults to <config dir>/runbox/runbox.yaml when present)")]
    config: Option<PathBuf>,

    #[clap(long, short, global = true, help = "Log level; overrides logging.level from the configuration")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine (default command)
    Run {
        /// JSON job file to submit on startup; a file may hold one job or an array
        #[clap(long = "job", short)]
        jobs: Vec<PathBuf>,

        /// Print events of submitted jobs as JSON lines
        #[clap(long)]
        follow: bool,

        /// Exit once every submitted job has finished
        #[clap(long)]
        once: bool,
    },
    /// Print the dead-letter records
    DeadLetters {
        #[clap(long, help = "Dead-letter file (defaults to outcome.dead_letter_file)")]
        file: Option<PathBuf>,
    },
    /// Validate the configuration and print it with defaults filled in
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, source) = resolve_config(cli.config.as_deref()).await?;

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level)
        .parse()
        .unwrap_or(LevelFilter::Info);
    env_logger::Builder::new().filter_level(level).init();

    match &source {
        Some(path) => log::info!("Loaded configuration from {}", path.display()),
        None => log::info!("No configuration file found, using defaults"),
    }

    match cli.command {
        Some(Commands::Run { jobs, follow, once }) => run_engine(config, jobs, follow, once).await,
        Some(Commands::DeadLetters { file }) => {
            let path = file.unwrap_or_else(|| config.outcome.dead_letter_file.clone());
            print_dead_letters(&path).await
        }
        Some(Commands::CheckConfig) => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        None => run_engine(config, Vec::new(), false, false).await,
    }
}

async fn resolve_config(explicit: Option<&Path>) -> Result<(RunboxConfig, Option<PathBuf>)> {
    if let Some(path) = explicit {
        let config = ConfigLoader::from_file(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        return Ok((config, Some(path.to_path_buf())));
    }

    let default_path = dirs::config_dir().map(|dir| dir.join("runbox").join("runbox.yaml"));
    match default_path {
        Some(path) if path.exists() => {
            let config = ConfigLoader::from_file(&path).await?;
            Ok((config, Some(path)))
        }
        _ => Ok((RunboxConfig::default(), None)),
    }
}

async fn run_engine(config: RunboxConfig, jobs: Vec<PathBuf>, follow: bool, once: bool) -> Result<()> {
    let sandbox = DockerSandbox::new(config.sandbox.pull_images)?;
    sandbox
        .ping()
        .await
        .context("Docker daemon is not reachable")?;

    let dead_letters = Arc::new(JsonlDeadLetterStore::new(&config.outcome.dead_letter_file));
    let engine = Engine::builder(config, Arc::new(sandbox))
        .record_store(Arc::new(LoggingRecordStore))
        .dead_letter_store(dead_letters)
        .build()?;
    let engine = Arc::new(engine);

    let mut watchers = Vec::new();
    for path in &jobs {
        for document in read_job_file(path).await? {
            match submit(&engine, document, follow).await {
                Ok(watcher) => watchers.push(watcher),
                Err(e) => log::error!("Rejected job from {}: {}", path.display(), e),
            }
        }
    }

    if once && watchers.is_empty() {
        log::info!("Nothing to run");
        return Ok(());
    }

    let all_done = async move {
        for watcher in watchers {
            let _ = watcher.await;
        }
    };
    let shutdown = async move {
        if once {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = all_done => log::info!("All submitted jobs finished"),
            }
        } else {
            shutdown_signal().await;
        }
    };

    engine.run(shutdown).await?;
    let stats = engine.stats().await;
    log::info!(
        "Engine stopped: {} completed, {} dead-lettered, {} still queued",
        stats.queue.completed,
        stats.queue.dead_lettered,
        stats.queue.queued + stats.queue.waiting + stats.queue.delayed
    );
    Ok(())
}

/// Submits one job document and returns a task that ends with the job.
async fn submit(engine: &Engine, mut document: Value, follow: bool) -> Result<JoinHandle<()>> {
    // The id has to be known before submission so no event is missed.
    let supplied = document
        .get("job_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|raw| !raw.is_empty());
    let id = match supplied {
        Some(raw) => JobId::parse(raw)?,
        None => {
            let id = JobId::generate();
            if let Some(fields) = document.as_object_mut() {
                fields.insert("job_id".to_string(), Value::String(id.to_string()));
            }
            id
        }
    };

    let mut events = engine.subscribe(&id);
    engine.submit_json(document).await?;

    Ok(tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if follow {
                        match serde_json::to_string(&event) {
                            Ok(line) => println!("{}", line),
                            Err(e) => log::warn!("Failed to encode event: {}", e),
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("Skipped {} events for job {}", missed, id);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }))
}

async fn read_job_file(path: &Path) -> Result<Vec<Value>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    let document: Value = serde_json::from_str(&content)
        .with_context(|| format!("Job file {} is not valid JSON", path.display()))?;
    Ok(match document {
        Value::Array(jobs) => jobs,
        single => vec![single],
    })
}

async fn print_dead_letters(path: &Path) -> Result<()> {
    let letters = read_dead_letters(path).await?;
    if letters.is_empty() {
        log::info!("No dead letters in {}", path.display());
    }
    for letter in letters {
        println!("{}", serde_json::to_string(&letter)?);
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown signal received");
}
