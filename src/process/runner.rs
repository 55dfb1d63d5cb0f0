use super::registry::ProcessRegistry;
use crate::errors::ToolError;
use crate::util::slugify;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// How a single tool invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOutcome {
    Success,
    TimedOut,
    ExitedNonZero(i32),
    /// The run was cancelled while the tool was running.
    Cancelled,
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success)
    }
}

impl fmt::Display for ToolOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolOutcome::Success => write!(f, "success"),
            ToolOutcome::TimedOut => write!(f, "timed out"),
            ToolOutcome::ExitedNonZero(code) => write!(f, "exited with code {}", code),
            ToolOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Runs external commands under a deadline, registering each spawned process
/// with the run's `ProcessRegistry`. Cheap to clone.
#[derive(Clone)]
pub struct ToolRunner {
    registry: Arc<ProcessRegistry>,
    log_dir: Option<PathBuf>,
    working_dir: Option<PathBuf>,
}

impl ToolRunner {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self {
            registry,
            log_dir: None,
            working_dir: None,
        }
    }

    /// Capture each tool's stdout/stderr into `<dir>/<name>.log`.
    pub fn with_log_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.log_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Run `command` through `sh -c`, terminating it if it outlives `deadline`.
    ///
    /// Non-zero exits, timeouts and cancellation are reported as outcomes, not
    /// errors; `Err` is reserved for failing to launch or supervise the
    /// process at all. The invocation is logged before the outcome is returned.
    pub async fn run(
        &self,
        name: &str,
        deadline: Duration,
        command: &str,
    ) -> Result<ToolOutcome, ToolError> {
        if self.registry.is_cancelled() {
            tracing::info!(tool = name, command, outcome = %ToolOutcome::Cancelled, "tool skipped, run cancelled");
            return Ok(ToolOutcome::Cancelled);
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).stdin(Stdio::null());
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        let (stdout, stderr) = self.output_streams(name)?;
        cmd.stdout(stdout).stderr(stderr);
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::info!(
            tool = name,
            command,
            deadline_secs = deadline.as_secs_f64(),
            "starting tool"
        );
        let start = Instant::now();

        let mut child = cmd.spawn().map_err(|source| ToolError::SpawnFailed {
            name: name.to_string(),
            source,
        })?;

        let Some(pid) = child.id() else {
            // Already reaped: it exited before we could look at it.
            let status = child.wait().await.map_err(|source| ToolError::WaitFailed {
                name: name.to_string(),
                source,
            })?;
            let outcome = classify(status, false);
            log_outcome(name, command, outcome, start);
            return Ok(outcome);
        };

        let handle = match self.registry.register(pid, name) {
            Ok(handle) => handle,
            Err(_) => {
                let _ = child.wait().await;
                log_outcome(name, command, ToolOutcome::Cancelled, start);
                return Ok(ToolOutcome::Cancelled);
            }
        };

        let token = self.registry.cancellation();
        let waited = tokio::select! {
            status = child.wait() => status.map(|s| classify(s, token.is_cancelled())),
            _ = tokio::time::sleep(deadline) => {
                self.registry
                    .terminate(&handle, &mut child)
                    .await
                    .map(|_| ToolOutcome::TimedOut)
            }
            _ = token.cancelled() => {
                // cancel_all owns the signalling; we only reap.
                child.wait().await.map(|_| ToolOutcome::Cancelled)
            }
        };
        self.registry.unregister(&handle);

        let outcome = waited.map_err(|source| ToolError::WaitFailed {
            name: name.to_string(),
            source,
        })?;
        log_outcome(name, command, outcome, start);
        Ok(outcome)
    }

    fn output_streams(&self, name: &str) -> Result<(Stdio, Stdio), ToolError> {
        let Some(ref dir) = self.log_dir else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        let path = dir.join(format!("{}.log", slugify(name)));
        let open = || -> std::io::Result<(Stdio, Stdio)> {
            std::fs::create_dir_all(dir)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            let err = file.try_clone()?;
            Ok((Stdio::from(file), Stdio::from(err)))
        };
        open().map_err(|source| ToolError::LogFile { path, source })
    }
}

fn classify(status: ExitStatus, cancelled: bool) -> ToolOutcome {
    if status.success() {
        return ToolOutcome::Success;
    }
    match status.code() {
        Some(code) => ToolOutcome::ExitedNonZero(code),
        // Killed by a signal
        None if cancelled => ToolOutcome::Cancelled,
        None => ToolOutcome::ExitedNonZero(-1),
    }
}

fn log_outcome(name: &str, command: &str, outcome: ToolOutcome, start: Instant) {
    let elapsed_ms = start.elapsed().as_millis() as u64;
    if outcome.is_success() {
        tracing::info!(tool = name, command, outcome = %outcome, elapsed_ms, "tool finished");
    } else {
        tracing::warn!(tool = name, command, outcome = %outcome, elapsed_ms, "tool failed");
    }
}
