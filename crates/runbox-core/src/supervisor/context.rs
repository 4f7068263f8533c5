//! Per-attempt execution state.

use std::fmt;
use std::path::PathBuf;

use crate::resources::SlotGuard;
use crate::sandbox::OutputStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Admitted,
    WorkspacePrepared,
    ContainerLaunched,
    Streaming,
    Succeeded,
    Failed,
    TimedOut,
    CleanedUp,
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptPhase::Admitted => "admitted",
            AttemptPhase::WorkspacePrepared => "workspace_prepared",
            AttemptPhase::ContainerLaunched => "container_launched",
            AttemptPhase::Streaming => "streaming",
            AttemptPhase::Succeeded => "succeeded",
            AttemptPhase::Failed => "failed",
            AttemptPhase::TimedOut => "timed_out",
            AttemptPhase::CleanedUp => "cleaned_up",
        };
        f.write_str(name)
    }
}

/// Output kept for the attempt's result. Holds the first `limit` bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug)]
pub(crate) struct OutputBuffer {
    captured: CapturedOutput,
    limit: usize,
}

impl OutputBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            captured: CapturedOutput::default(),
            limit,
        }
    }

    pub(crate) fn push_line(&mut self, line: &str) {
        if self.captured.truncated {
            return;
        }
        let room = self.limit.saturating_sub(self.captured.text.len());
        let needed = line.len() + 1;
        if needed <= room {
            self.captured.text.push_str(line);
            self.captured.text.push('\n');
            return;
        }
        let mut cut = room.min(line.len());
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        self.captured.text.push_str(&line[..cut]);
        self.captured.truncated = true;
    }

    pub(crate) fn snapshot(&self) -> CapturedOutput {
        self.captured.clone()
    }
}

/// Splits a byte stream into lines. Invalid UTF-8 is replaced.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left after the stream ended without a final newline.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Everything one attempt owns. The supervisor cleans it up explicitly; if
/// that never happens the workspace is removed and the slot released on drop.
///
/// The drop fallback cannot remove the container, since that needs the
/// async sandbox. The engine drains attempts on shutdown, so this only
/// happens when an attempt panics or the run future itself is dropped. Such
/// a container must be removed by hand before the job can launch again.
pub struct ExecutionContext {
    pub workspace: PathBuf,
    pub container_name: String,
    pub exit_code: Option<i64>,
    phase: AttemptPhase,
    output: OutputBuffer,
    stdout: LineSplitter,
    stderr: LineSplitter,
    slot: Option<SlotGuard>,
    cleaned_up: bool,
}

impl ExecutionContext {
    pub fn new(
        workspace: PathBuf,
        container_name: String,
        max_output_bytes: usize,
        slot: SlotGuard,
    ) -> Self {
        Self {
            workspace,
            container_name,
            exit_code: None,
            phase: AttemptPhase::Admitted,
            output: OutputBuffer::new(max_output_bytes),
            stdout: LineSplitter::default(),
            stderr: LineSplitter::default(),
            slot: Some(slot),
            cleaned_up: false,
        }
    }

    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }

    pub(crate) fn enter(&mut self, phase: AttemptPhase) {
        log::debug!(
            "Container {}: {} -> {}",
            self.container_name,
            self.phase,
            phase
        );
        self.phase = phase;
    }

    /// Feeds a chunk and returns the complete lines it finished.
    pub(crate) fn ingest(&mut self, stream: OutputStream, bytes: &[u8]) -> Vec<String> {
        let lines = match stream {
            OutputStream::Stdout => self.stdout.push(bytes),
            OutputStream::Stderr => self.stderr.push(bytes),
        };
        for line in &lines {
            self.output.push_line(line);
        }
        lines
    }

    /// Trailing partial lines once both streams have ended.
    pub(crate) fn flush(&mut self) -> Vec<(OutputStream, String)> {
        let mut rest = Vec::new();
        if let Some(line) = self.stdout.finish() {
            rest.push((OutputStream::Stdout, line));
        }
        if let Some(line) = self.stderr.finish() {
            rest.push((OutputStream::Stderr, line));
        }
        for (_, line) in &rest {
            self.output.push_line(line);
        }
        rest
    }

    pub fn output(&self) -> CapturedOutput {
        self.output.snapshot()
    }

    pub(crate) fn is_cleaned_up(&self) -> bool {
        self.cleaned_up
    }

    /// Marks cleanup done and releases the slot.
    pub(crate) fn mark_cleaned_up(&mut self) {
        self.cleaned_up = true;
        self.enter(AttemptPhase::CleanedUp);
        self.slot.take();
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if self.cleaned_up {
            return;
        }
        log::warn!(
            "Attempt for {} dropped before cleanup, removing workspace",
            self.container_name
        );
        if let Err(e) = std::fs::remove_dir_all(&self.workspace) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "Failed to remove workspace {}: {}",
                    self.workspace.display(),
                    e
                );
            }
        }
    }
}
