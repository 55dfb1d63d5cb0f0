use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

use crate::errors::OrchestratorError;
use crate::pipeline_config::{CONFIG_FILE, PipelineToml};
use crate::util::slugify;

/// Runtime configuration for one target.
///
/// Resolves the run directory layout from the output directory and target,
/// and carries the parsed pipeline configuration.
///
/// ```text
/// <output_dir>/<target>/
///   markers/            one file per (phase, state)
///   state/              current.json, checkpoints/
///   logs/               reconductor.log, tools/<tool>.log
///   runs/               one JSON record per finished run
///   failures.jsonl      failure ledger
///   <phase>/            phase output, owned by the phase
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub output_dir: PathBuf,
    pub target: String,
    pub run_dir: PathBuf,
    pub markers_dir: PathBuf,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub tool_log_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub ledger_file: PathBuf,
    /// Config file actually loaded, if any
    pub config_file: Option<PathBuf>,
    pub verbose: bool,
    pipeline: PipelineToml,
}

impl Config {
    /// Build the configuration for `target`.
    ///
    /// `config_file` must exist when given explicitly; otherwise
    /// `./reconductor.toml` is used if present, and the built-in defaults if not.
    pub fn new(
        output_dir: &Path,
        target: &str,
        config_file: Option<&Path>,
        verbose: bool,
    ) -> Result<Self> {
        let target = target.trim();
        if target.is_empty() {
            bail!("Target must not be empty");
        }

        let (pipeline, config_file) = Self::resolve_pipeline(config_file)?;

        // Tools run with the run directory as their working directory, so
        // every path handed to them must be absolute.
        let output_dir = if output_dir.is_absolute() {
            output_dir.to_path_buf()
        } else {
            std::env::current_dir()
                .context("Failed to get current directory")?
                .join(output_dir)
        };
        let run_dir = output_dir.join(slugify(target));
        let log_dir = run_dir.join("logs");
        Ok(Self {
            output_dir,
            target: target.to_string(),
            markers_dir: run_dir.join("markers"),
            state_dir: run_dir.join("state"),
            tool_log_dir: log_dir.join("tools"),
            log_dir,
            runs_dir: run_dir.join("runs"),
            ledger_file: run_dir.join("failures.jsonl"),
            run_dir,
            config_file,
            verbose,
            pipeline,
        })
    }

    /// Locate and load the pipeline configuration without a target.
    ///
    /// Returns the configuration and the file it came from, `None` for defaults.
    pub fn resolve_pipeline(explicit: Option<&Path>) -> Result<(PipelineToml, Option<PathBuf>)> {
        if let Some(path) = explicit {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            return Ok((PipelineToml::load(path)?, Some(path.to_path_buf())));
        }
        let local = std::env::current_dir()
            .context("Failed to get current directory")?
            .join(CONFIG_FILE);
        if local.exists() {
            Ok((PipelineToml::load(&local)?, Some(local)))
        } else {
            Ok((PipelineToml::default(), None))
        }
    }

    pub fn pipeline(&self) -> &PipelineToml {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut PipelineToml {
        &mut self.pipeline
    }

    pub fn run_exists(&self) -> bool {
        self.run_dir.is_dir()
    }

    /// Create the run directory skeleton. Failure here is fatal: no phase runs.
    pub fn ensure_directories(&self) -> Result<(), OrchestratorError> {
        for dir in [
            &self.run_dir,
            &self.markers_dir,
            &self.state_dir,
            &self.log_dir,
            &self.tool_log_dir,
            &self.runs_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|source| {
                OrchestratorError::RunDirUnavailable {
                    path: dir.clone(),
                    source,
                }
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_config(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_layout_under_output_dir() {
        let dir = tempdir().unwrap();
        let cfg_file = write_config(dir.path(), "");
        let config = Config::new(dir.path(), "example.com", Some(&cfg_file), false).unwrap();
        let run_dir = dir.path().join("example.com");
        assert_eq!(config.run_dir, run_dir);
        assert_eq!(config.markers_dir, run_dir.join("markers"));
        assert_eq!(config.state_dir, run_dir.join("state"));
        assert_eq!(config.ledger_file, run_dir.join("failures.jsonl"));
        assert_eq!(config.tool_log_dir, run_dir.join("logs/tools"));
        assert_eq!(config.config_file.as_deref(), Some(cfg_file.as_path()));
    }

    #[test]
    fn test_run_directory_entries_are_reserved_phase_ids() {
        let dir = tempdir().unwrap();
        let cfg_file = write_config(dir.path(), "");
        let config = Config::new(dir.path(), "example.com", Some(&cfg_file), false).unwrap();
        for path in [
            &config.markers_dir,
            &config.state_dir,
            &config.log_dir,
            &config.runs_dir,
        ] {
            let entry = path.strip_prefix(&config.run_dir).unwrap();
            assert!(crate::util::validate_phase_id(&entry.to_string_lossy()).is_err());
        }
    }

    #[test]
    fn test_cidr_target_is_slugified() {
        let dir = tempdir().unwrap();
        let cfg_file = write_config(dir.path(), "");
        let config = Config::new(dir.path(), "10.0.0.0/24", Some(&cfg_file), false).unwrap();
        assert_eq!(config.run_dir, dir.path().join("10.0.0.0_24"));
        assert_eq!(config.target, "10.0.0.0/24");
    }

    #[test]
    fn test_empty_target_rejected() {
        let dir = tempdir().unwrap();
        let result = Config::new(dir.path(), "  ", None, false);
        assert!(result.unwrap_err().to_string().contains("Target"));
    }

    #[test]
    fn test_missing_explicit_config_rejected() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let result = Config::new(dir.path(), "example.com", Some(&missing), false);
        assert!(result.unwrap_err().to_string().contains("Config file not found"));
    }

    #[test]
    fn test_explicit_config_is_loaded() {
        let dir = tempdir().unwrap();
        let cfg_file = write_config(
            dir.path(),
            "[run]\npolicy = \"fail-fast\"\n\n[[phases]]\nid = \"only\"\n",
        );
        let config = Config::new(dir.path(), "example.com", Some(&cfg_file), false).unwrap();
        assert_eq!(config.pipeline().phases.len(), 1);
        assert_eq!(
            config.pipeline().run.policy,
            crate::pipeline_config::FailurePolicy::FailFast
        );
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let cfg_file = write_config(dir.path(), "");
        let config = Config::new(dir.path(), "example.com", Some(&cfg_file), false).unwrap();
        assert!(!config.run_exists());
        config.ensure_directories().unwrap();
        assert!(config.run_exists());
        assert!(config.markers_dir.is_dir());
        assert!(config.state_dir.is_dir());
        assert!(config.runs_dir.is_dir());
        assert!(config.tool_log_dir.is_dir());
    }

    #[test]
    fn test_ensure_directories_fails_when_blocked() {
        let dir = tempdir().unwrap();
        let cfg_file = write_config(dir.path(), "");
        // A file where the run directory should go
        fs::write(dir.path().join("example.com"), "not a dir").unwrap();
        let config = Config::new(dir.path(), "example.com", Some(&cfg_file), false).unwrap();
        assert!(matches!(
            config.ensure_directories(),
            Err(OrchestratorError::RunDirUnavailable { .. })
        ));
    }
}
