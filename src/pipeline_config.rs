//! Pipeline configuration read from `reconductor.toml`.
//!
//! Settings are layered file → environment → CLI. The file is optional; a
//! missing file yields the built-in defaults, including the default phase
//! list.
//!
//! # Configuration File Format
//!
//! ```toml
//! [run]
//! policy = "best-effort"      # or "fail-fast"
//! checkpoint_every = 1        # phases between checkpoints, 0 disables
//! grace_period_secs = 5       # SIGTERM → SIGKILL window during cleanup
//! drain_timeout_secs = 30     # time the in-flight phase gets after a signal
//! log_level = "info"
//! log_format = "pretty"       # pretty, compact or json
//!
//! [tools]
//! timeout_secs = 3600
//! parallelism = 4
//!
//! [[phases]]
//! id = "subdomain"
//! group = "subdomains"
//! commands = ["subfinder -silent -d {target} -o {phase_dir}/subfinder.txt"]
//! fail_on_tool_error = true
//! ```
//!
//! Declaring any `[[phases]]` replaces the default phase list entirely.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::util::validate_phase_id;

pub const CONFIG_FILE: &str = "reconductor.toml";

/// What the orchestrator does after a phase fails.
///
/// | Policy        | Behaviour                                            |
/// |---------------|------------------------------------------------------|
/// | `BestEffort`  | Record the failure and continue with the next phase  |
/// | `FailFast`    | Halt the run before the next phase                   |
///
/// `BestEffort` is the default so independent phases still produce partial
/// results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    #[default]
    BestEffort,
    FailFast,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::BestEffort => write!(f, "best-effort"),
            FailurePolicy::FailFast => write!(f, "fail-fast"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "best-effort" => Ok(FailurePolicy::BestEffort),
            "fail-fast" => Ok(FailurePolicy::FailFast),
            _ => bail!(
                "Invalid failure policy '{}'. Valid values: best-effort, fail-fast",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => bail!(
                "Invalid log format '{}'. Valid values: pretty, compact, json",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default)]
    pub policy: FailurePolicy,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u32,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::default(),
            checkpoint_every: default_checkpoint_every(),
            grace_period_secs: default_grace_period_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

fn default_checkpoint_every() -> u32 {
    1
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_drain_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsSection {
    /// Default per-command deadline
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// Default number of commands a phase runs concurrently
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            parallelism: default_parallelism(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    3600
}

fn default_parallelism() -> usize {
    4
}

/// One `[[phases]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    #[serde(default)]
    pub fail_on_tool_error: bool,
}

fn default_group() -> String {
    "general".to_string()
}

fn default_true() -> bool {
    true
}

impl PhaseDef {
    fn new(id: &str, name: &str, group: &str, commands: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: Some(name.to_string()),
            group: group.to_string(),
            enabled: true,
            commands: commands.iter().map(|c| c.to_string()).collect(),
            timeout_secs: None,
            parallelism: None,
            fail_on_tool_error: false,
        }
    }
}

/// The built-in pipeline used when no `[[phases]]` are configured.
pub fn default_phases() -> Vec<PhaseDef> {
    vec![
        PhaseDef::new(
            "osint",
            "Passive reconnaissance",
            "osint",
            &["whois {target} > {phase_dir}/whois.txt"],
        ),
        PhaseDef::new(
            "subdomain",
            "Subdomain enumeration",
            "subdomains",
            &[
                "subfinder -silent -d {target} -o {phase_dir}/subfinder.txt",
                "assetfinder --subs-only {target} > {phase_dir}/assetfinder.txt",
            ],
        ),
        PhaseDef::new(
            "dns",
            "DNS resolution",
            "hosts",
            &["cat {run_dir}/subdomain/*.txt 2>/dev/null | sort -u | dnsx -silent -o {phase_dir}/resolved.txt"],
        ),
        PhaseDef::new(
            "ports",
            "Port scanning",
            "hosts",
            &["nmap -Pn --top-ports 1000 -oA {phase_dir}/nmap {target}"],
        ),
        PhaseDef::new(
            "web",
            "Web probing",
            "web",
            &["httpx -silent -u {target} -o {phase_dir}/httpx.txt"],
        ),
        PhaseDef::new(
            "vulns",
            "Vulnerability checks",
            "vulns",
            &["nuclei -silent -u {target} -o {phase_dir}/nuclei.txt"],
        ),
    ]
}

/// Parsed `reconductor.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineToml {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default = "default_phases")]
    pub phases: Vec<PhaseDef>,
}

impl Default for PipelineToml {
    fn default() -> Self {
        Self {
            run: RunSection::default(),
            tools: ToolsSection::default(),
            phases: default_phases(),
        }
    }
}

impl PipelineToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse reconductor.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, the defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize reconductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for phase in &self.phases {
            validate_phase_id(&phase.id)
                .with_context(|| format!("Invalid phase id '{}'", phase.id))?;
            if !seen.insert(phase.id.as_str()) {
                bail!("Duplicate phase id '{}'", phase.id);
            }
        }
        if self.tools.parallelism == 0 {
            bail!("tools.parallelism must be at least 1");
        }
        Ok(())
    }

    /// Failure policy, with `RECONDUCTOR_POLICY` overriding the file.
    pub fn policy(&self) -> FailurePolicy {
        if let Ok(value) = std::env::var("RECONDUCTOR_POLICY")
            && let Ok(policy) = value.parse()
        {
            return policy;
        }
        self.run.policy
    }

    /// Log format, with `RECONDUCTOR_LOG_FORMAT` overriding the file.
    pub fn log_format(&self) -> LogFormat {
        if let Ok(value) = std::env::var("RECONDUCTOR_LOG_FORMAT")
            && let Ok(format) = value.parse()
        {
            return format;
        }
        self.run.log_format
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.run.grace_period_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.run.drain_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.timeout_secs)
    }
}
