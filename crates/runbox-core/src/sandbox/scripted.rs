//! In-process sandbox that replays canned behaviour instead of starting
//! containers. Used by the test suites and for dry runs of the engine.

use async_trait::async_trait;
use futures_util::future::{self, FutureExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{LaunchSpec, OutputChunk, OutputStream, Sandbox, SandboxRun};
use crate::errors::SandboxError;

/// What a launched container does.
#[derive(Debug, Clone)]
pub enum Script {
    /// Writes the given lines, then exits with `code`.
    Exit {
        lines: Vec<(OutputStream, String)>,
        code: i64,
    },
    /// Writes the given lines and never exits on its own.
    Hang { lines: Vec<(OutputStream, String)> },
    /// Exits after `delay`.
    Sleep { delay: Duration, code: i64 },
    /// Launch itself fails.
    LaunchError(String),
}

impl Script {
    pub fn stdout(text: &str, code: i64) -> Self {
        Script::Exit {
            lines: vec![(OutputStream::Stdout, text.to_string())],
            code,
        }
    }
}

pub struct ScriptedSandbox {
    default: Script,
    queued: Mutex<HashMap<String, VecDeque<Script>>>,
    launches: Mutex<Vec<LaunchSpec>>,
    removals: Mutex<Vec<String>>,
    live: Mutex<Liveness>,
}

/// Containers launched and not yet removed.
#[derive(Default)]
struct Liveness {
    running: HashSet<String>,
    peak: usize,
}

impl ScriptedSandbox {
    pub fn new(default: Script) -> Self {
        Self {
            default,
            queued: Mutex::new(HashMap::new()),
            launches: Mutex::new(Vec::new()),
            removals: Mutex::new(Vec::new()),
            live: Mutex::new(Liveness::default()),
        }
    }

    /// Queues `script` for the next launch of `container_name`; later
    /// launches fall back to the default once the queue is empty.
    pub fn push(&self, container_name: &str, script: Script) {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(container_name.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn removals(&self) -> Vec<String> {
        self.removals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Highest number of containers that existed at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).peak
    }

    fn next_script(&self, container_name: &str) -> Script {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(container_name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default.clone())
    }
}

fn emit(lines: Vec<(OutputStream, String)>) -> mpsc::Receiver<OutputChunk> {
    let (tx, rx) = mpsc::channel(lines.len().max(1));
    for (stream, text) in lines {
        let mut bytes = text.into_bytes();
        bytes.push(b'\n');
        // Capacity matches the line count so this never fails.
        let _ = tx.try_send(OutputChunk { stream, bytes });
    }
    rx
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn launch(&self, spec: &LaunchSpec) -> Result<SandboxRun, SandboxError> {
        self.launches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());

        let script = self.next_script(&spec.container_name);
        if !matches!(script, Script::LaunchError(_)) {
            let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
            live.running.insert(spec.container_name.clone());
            live.peak = live.peak.max(live.running.len());
        }

        match script {
            Script::Exit { lines, code } => Ok(SandboxRun {
                output: emit(lines),
                exit: future::ready(Ok(code)).boxed(),
            }),
            Script::Hang { lines } => Ok(SandboxRun {
                output: emit(lines),
                exit: future::pending().boxed(),
            }),
            Script::Sleep { delay, code } => Ok(SandboxRun {
                output: emit(Vec::new()),
                exit: async move {
                    tokio::time::sleep(delay).await;
                    Ok(code)
                }
                .boxed(),
            }),
            Script::LaunchError(message) => Err(SandboxError::LaunchFailed(message)),
        }
    }

    async fn force_remove(&self, container_name: &str) -> Result<(), SandboxError> {
        self.removals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(container_name.to_string());
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .running
            .remove(container_name);
        Ok(())
    }
}
