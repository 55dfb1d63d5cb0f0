//! Phase definitions for the reconductor orchestrator.
//!
//! This module provides:
//! - `PhaseBody`, the entry point contract every phase implements
//! - `Phase`, an ordered, named unit of work wrapping a body
//! - `RunContext`, the per-run state lent to phase bodies
//! - `CommandPhase`, a body that runs shell command templates through the
//!   tool runner with a bounded worker pool

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::pipeline_config::{PhaseDef, PipelineToml};
use crate::process::{ToolOutcome, ToolRunner};
use crate::state::StateStore;

/// Result summary a phase body returns on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseReport {
    pub summary: String,
}

impl PhaseReport {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
        }
    }
}

/// Entry point of a phase. Returning `Err` fails the phase; the error chain
/// becomes the failure reason.
#[async_trait]
pub trait PhaseBody: Send + Sync {
    async fn run(&self, ctx: &RunContext) -> Result<PhaseReport>;
}

/// An ordered, named unit of work. Built once by the composition root.
#[derive(Clone)]
pub struct Phase {
    /// Unique id, also used for marker file names (e.g. "subdomain")
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Category recorded in the failure ledger
    pub group: String,
    /// Position in the pipeline, assigned by the orchestrator
    pub index: usize,
    /// Disabled phases are reported as skipped and get no markers
    pub enabled: bool,
    pub body: Arc<dyn PhaseBody>,
}

impl Phase {
    pub fn new(id: &str, group: &str, body: Arc<dyn PhaseBody>) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            group: group.to_string(),
            index: 0,
            enabled: true,
            body,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Build a command phase from its configuration entry.
    pub fn from_def(def: &PhaseDef, default_timeout: Duration, default_parallelism: usize) -> Self {
        let body = CommandPhase {
            id: def.id.clone(),
            commands: def.commands.clone(),
            timeout: def
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
            parallelism: def.parallelism.unwrap_or(default_parallelism).max(1),
            fail_on_tool_error: def.fail_on_tool_error,
        };
        Phase::new(&def.id, &def.group, Arc::new(body))
            .with_name(def.name.as_deref().unwrap_or(&def.id))
            .with_enabled(def.enabled)
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("index", &self.index)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Mutable state of one scan invocation, owned by the orchestrator and lent
/// to each phase execution.
pub struct RunContext {
    pub run_dir: PathBuf,
    pub target: String,
    pub marker_dir: PathBuf,
    pub current_phase_index: usize,
    /// Shared with the orchestrator; phase bodies may record progress here.
    pub state: Arc<StateStore>,
    pub tools: ToolRunner,
}

impl RunContext {
    pub fn new(
        run_dir: impl AsRef<Path>,
        target: &str,
        marker_dir: impl AsRef<Path>,
        state: Arc<StateStore>,
        tools: ToolRunner,
    ) -> Self {
        Self {
            run_dir: run_dir.as_ref().to_path_buf(),
            target: target.to_string(),
            marker_dir: marker_dir.as_ref().to_path_buf(),
            current_phase_index: 0,
            state,
            tools,
        }
    }

    /// Output directory reserved for `phase` inside the run directory.
    pub fn phase_dir(&self, phase: &str) -> PathBuf {
        self.run_dir.join(phase)
    }
}

/// Phase body that runs shell command templates.
///
/// Templates may use `{target}`, `{run_dir}` and `{phase_dir}`; substituted
/// values are shell-quoted. Commands run in parallel, at most `parallelism`
/// at a time, each registered with the process registry by the tool runner.
#[derive(Debug, Clone)]
pub struct CommandPhase {
    pub id: String,
    pub commands: Vec<String>,
    pub timeout: Duration,
    pub parallelism: usize,
    /// Fail the phase when any tool fails; otherwise tool failures are only logged.
    pub fail_on_tool_error: bool,
}

impl CommandPhase {
    fn render(&self, template: &str, ctx: &RunContext, phase_dir: &Path) -> String {
        template
            .replace("{target}", &shell_quote(&ctx.target))
            .replace("{run_dir}", &shell_quote(&ctx.run_dir.to_string_lossy()))
            .replace("{phase_dir}", &shell_quote(&phase_dir.to_string_lossy()))
    }
}

#[async_trait]
impl PhaseBody for CommandPhase {
    async fn run(&self, ctx: &RunContext) -> Result<PhaseReport> {
        if self.commands.is_empty() {
            return Ok(PhaseReport::new("no commands configured"));
        }

        let phase_dir = ctx.phase_dir(&self.id);
        std::fs::create_dir_all(&phase_dir)?;

        let commands: Vec<(String, String)> = self
            .commands
            .iter()
            .enumerate()
            .map(|(i, template)| {
                (
                    format!("{}-{}", self.id, i + 1),
                    self.render(template, ctx, &phase_dir),
                )
            })
            .collect();
        let timeout = self.timeout;
        let jobs = commands.into_iter().map(|(name, command)| {
            let tools = ctx.tools.clone();
            async move {
                let result = tools.run(&name, timeout, &command).await;
                (name, result)
            }
        });
        let results: Vec<_> = futures::stream::iter(jobs)
            .buffer_unordered(self.parallelism.max(1))
            .collect()
            .await;

        let total = results.len();
        let mut succeeded = 0;
        let mut cancelled = 0;
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(ToolOutcome::Success) => succeeded += 1,
                Ok(ToolOutcome::Cancelled) => cancelled += 1,
                Ok(outcome) => failures.push(format!("{}: {}", name, outcome)),
                Err(e) => failures.push(format!("{}: {}", name, e)),
            }
        }

        if cancelled > 0 {
            bail!("run cancelled ({} of {} tools interrupted)", cancelled, total);
        }
        if self.fail_on_tool_error && !failures.is_empty() {
            bail!("{} of {} tools failed: {}", failures.len(), total, failures.join("; "));
        }
        Ok(PhaseReport::new(format!(
            "{}/{} tools succeeded",
            succeeded, total
        )))
    }
}

/// Build the ordered phase list described by `config`.
pub fn build_pipeline(config: &PipelineToml) -> Vec<Phase> {
    config
        .phases
        .iter()
        .map(|def| Phase::from_def(def, config.tool_timeout(), config.tools.parallelism))
        .collect()
}

/// The built-in reconnaissance pipeline: osint, subdomain, dns, ports, web, vulns.
pub fn default_pipeline() -> Vec<Phase> {
    build_pipeline(&PipelineToml::default())
}

/// Quote `value` for `sh` unless it only contains characters that never need it.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-:/@%+=,".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::ProcessRegistry;
    use tempfile::tempdir;

    fn make_context(dir: &Path) -> RunContext {
        let registry = Arc::new(ProcessRegistry::new(Duration::from_millis(200)));
        let state = Arc::new(StateStore::new(dir.join("state"), "example.com"));
        RunContext::new(
            dir,
            "example.com",
            dir.join("markers"),
            state,
            ToolRunner::new(registry),
        )
    }

    fn command_phase(commands: &[&str], fail_on_tool_error: bool) -> CommandPhase {
        CommandPhase {
            id: "probe".into(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            timeout: Duration::from_secs(5),
            parallelism: 2,
            fail_on_tool_error,
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("example.com"), "example.com");
        assert_eq!(shell_quote("/tmp/run-1"), "/tmp/run-1");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("x;rm -rf /"), "'x;rm -rf /'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn test_command_phase_substitutes_placeholders() {
        let dir = tempdir().unwrap();
        let ctx = make_context(dir.path());
        let phase = command_phase(&["echo {target} > {phase_dir}/out.txt"], true);
        let report = phase.run(&ctx).await.unwrap();
        assert_eq!(report.summary, "1/1 tools succeeded");
        let out = std::fs::read_to_string(dir.path().join("probe/out.txt")).unwrap();
        assert_eq!(out.trim(), "example.com");
    }

    #[tokio::test]
    async fn test_command_phase_tolerates_tool_failure_by_default() {
        let dir = tempdir().unwrap();
        let ctx = make_context(dir.path());
        let report = command_phase(&["true", "exit 2"], false)
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(report.summary, "1/2 tools succeeded");
    }

    #[tokio::test]
    async fn test_command_phase_fails_when_configured() {
        let dir = tempdir().unwrap();
        let ctx = make_context(dir.path());
        let err = command_phase(&["true", "exit 2"], true)
            .run(&ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 of 2 tools failed"));
        assert!(err.to_string().contains("exited with code 2"));
    }

    #[tokio::test]
    async fn test_command_phase_fails_when_cancelled() {
        let dir = tempdir().unwrap();
        let ctx = make_context(dir.path());
        ctx.tools.registry().cancel_all().await;
        let err = command_phase(&["true"], false).run(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_command_phase_runs_on_spawned_task() {
        let dir = tempdir().unwrap();
        let ctx = make_context(dir.path());
        let body: Arc<dyn PhaseBody> = Arc::new(command_phase(&["true", "true", "true"], true));
        let report = tokio::spawn(async move { body.run(&ctx).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.summary, "3/3 tools succeeded");
    }

    #[tokio::test]
    async fn test_empty_command_phase_succeeds() {
        let dir = tempdir().unwrap();
        let ctx = make_context(dir.path());
        let report = command_phase(&[], true).run(&ctx).await.unwrap();
        assert_eq!(report.summary, "no commands configured");
    }

    #[test]
    fn test_default_pipeline_order() {
        let ids: Vec<String> = default_pipeline().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["osint", "subdomain", "dns", "ports", "web", "vulns"]);
    }

    #[test]
    fn test_from_def_applies_defaults() {
        let def = PhaseDef {
            id: "dns".into(),
            name: None,
            group: "hosts".into(),
            enabled: false,
            commands: vec!["true".into()],
            timeout_secs: None,
            parallelism: Some(0),
            fail_on_tool_error: false,
        };
        let phase = Phase::from_def(&def, Duration::from_secs(60), 4);
        assert_eq!(phase.id, "dns");
        assert_eq!(phase.name, "dns");
        assert_eq!(phase.group, "hosts");
        assert!(!phase.enabled);
    }
}
