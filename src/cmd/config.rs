//! Configuration view and initialization: `reconductor config`.

use anyhow::Result;
use std::path::PathBuf;

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    use reconductor::config::Config;
    use reconductor::pipeline_config::{CONFIG_FILE, PipelineToml};

    match command {
        None | Some(ConfigCommands::Show) => {
            let (mut pipeline, source) = Config::resolve_pipeline(cli.config.as_deref())?;

            println!();
            match &source {
                Some(path) => println!("Config file: {}", path.display()),
                None => println!("No {} found, using defaults", CONFIG_FILE),
            }
            println!();

            // Effective values, including environment overrides
            pipeline.run.policy = pipeline.policy();
            pipeline.run.log_format = pipeline.log_format();
            print!("{}", toml::to_string_pretty(&pipeline)?);
            println!();
        }
        Some(ConfigCommands::Init) => {
            let path = cli
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
            if path.exists() {
                println!("{} already exists", path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            PipelineToml::default().save(&path)?;

            println!("Created {}", path.display());
            println!();
            println!("You can now customize:");
            println!("  - [run] policy, checkpoint_every, grace_period_secs, log_level");
            println!("  - [tools] timeout_secs, parallelism");
            println!("  - [[phases]] id, group, commands, fail_on_tool_error");
            println!();
        }
    }

    Ok(())
}
