//! Run directory inspection and maintenance: status, phases, checkpoint, reset.

use anyhow::{Context, Result};
use console::style;

use super::super::{CheckpointCommands, Cli};

fn load_config(cli: &Cli, target: &str) -> Result<reconductor::config::Config> {
    reconductor::config::Config::new(&cli.output_dir, target, cli.config.as_deref(), cli.verbose)
}

pub fn cmd_status(cli: &Cli, target: &str) -> Result<()> {
    use reconductor::ledger::FailureLedger;
    use reconductor::markers::{MarkerState, MarkerStore};
    use reconductor::orchestrator::RunRecord;
    use reconductor::state::StateStore;

    let config = load_config(cli, target)?;

    println!();
    println!("Status for {}", style(&config.target).bold());
    println!("==========={}", "=".repeat(config.target.len()));
    println!();

    if !config.run_exists() {
        println!("No run directory at {}", config.run_dir.display());
        println!();
        println!("Run 'reconductor run --target {}' to start.", config.target);
        println!();
        return Ok(());
    }
    println!("Run directory: {}", config.run_dir.display());
    println!();

    let markers = MarkerStore::new(&config.markers_dir);
    println!("{:<14} {:<10} Detail", "Phase", "Status");
    println!("{:<14} {:<10} ------", "-----", "------");
    for def in &config.pipeline().phases {
        let (status, detail) = if !def.enabled {
            (style("disabled").dim(), String::new())
        } else {
            match markers.terminal_state(&def.id) {
                Some(MarkerState::Completed) => (
                    style("completed").green(),
                    markers
                        .read(&def.id, MarkerState::Completed)
                        .and_then(|r| r.summary)
                        .unwrap_or_default(),
                ),
                Some(_) => (
                    style("failed").red(),
                    markers
                        .read(&def.id, MarkerState::Failed)
                        .and_then(|r| r.reason)
                        .unwrap_or_default(),
                ),
                None if markers.exists(&def.id, MarkerState::Started) => {
                    (style("started").yellow(), "interrupted or running".to_string())
                }
                None => (style("pending").dim(), String::new()),
            }
        };
        println!("{:<14} {:<10} {}", def.id, status, detail);
    }
    println!();

    let state = StateStore::new(&config.state_dir, &config.target);
    let entries = state.entries();
    if entries.is_empty() {
        println!("State: empty");
    } else {
        println!("State:");
        for (key, value) in &entries {
            println!("  {} = {}", key, value);
        }
    }

    let checkpoints = state.list_checkpoints()?;
    println!();
    println!(
        "Checkpoints: {}{}",
        checkpoints.len(),
        state
            .latest_checkpoint()
            .map(|id| format!(" (latest: {})", id))
            .unwrap_or_default()
    );

    let ledger = FailureLedger::new(&config.ledger_file, uuid::Uuid::nil());
    let failures = ledger.entries()?;
    if !failures.is_empty() {
        println!();
        println!("Recent failures:");
        for failure in failures.iter().rev().take(5) {
            println!(
                "  {} [{}] {} ({})",
                style(&failure.phase).red(),
                failure.group,
                failure.reason,
                failure.timestamp.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    if let Some(last) = RunRecord::list(&config.runs_dir)?.last() {
        println!();
        println!(
            "Last run: {} at {} (exit code {})",
            last.status,
            last.finished_at.format("%Y-%m-%d %H:%M:%S"),
            last.exit_code
        );
    }
    println!();
    Ok(())
}

pub fn cmd_phases(cli: &Cli) -> Result<()> {
    use reconductor::config::Config;

    let (pipeline, source) = Config::resolve_pipeline(cli.config.as_deref())?;

    println!();
    match &source {
        Some(path) => println!("Phases loaded from: {}", path.display()),
        None => println!("Using the built-in pipeline"),
    }
    println!();
    println!(
        "{:<4} {:<14} {:<12} {:<8} Name",
        "#", "Phase", "Group", "Tools"
    );
    println!(
        "{:<4} {:<14} {:<12} {:<8} ----",
        "-", "-----", "-----", "-----"
    );
    for (i, def) in pipeline.phases.iter().enumerate() {
        let name = def.name.as_deref().unwrap_or(&def.id);
        let line = format!(
            "{:<4} {:<14} {:<12} {:<8} {}",
            i + 1,
            def.id,
            def.group,
            def.commands.len(),
            name
        );
        if def.enabled {
            println!("{}", line);
        } else {
            println!("{} {}", style(line).dim(), style("(disabled)").dim());
        }
    }
    println!();
    Ok(())
}

pub fn cmd_checkpoint(cli: &Cli, target: &str, command: &CheckpointCommands) -> Result<()> {
    use reconductor::state::StateStore;

    let config = load_config(cli, target)?;
    let state = StateStore::new(&config.state_dir, &config.target);

    match command {
        CheckpointCommands::List => {
            let checkpoints = state.list_checkpoints()?;
            if checkpoints.is_empty() {
                println!("No checkpoints for {}", config.target);
                return Ok(());
            }
            let latest = state.latest_checkpoint();
            println!(
                "  {:<32} {:<20} {:<12} {:<8} Description",
                "Id", "Created", "Phase", "Rev"
            );
            for meta in checkpoints {
                let marker = if latest.as_deref() == Some(meta.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{} {:<32} {:<20} {:<12} {:<8} {}",
                    marker,
                    meta.id,
                    meta.created.format("%Y-%m-%d %H:%M:%S"),
                    meta.phase.as_deref().unwrap_or("-"),
                    meta.revision,
                    meta.description
                );
            }
        }
        CheckpointCommands::Create { name, description } => {
            config.ensure_directories()?;
            let id = state.checkpoint(name.as_deref(), description.as_deref())?;
            println!("Created checkpoint {}", style(id).green());
        }
        CheckpointCommands::Restore { id } => {
            let restored = if id == "latest" {
                state.restore_latest()?
            } else {
                state
                    .restore(id)
                    .with_context(|| format!("Cannot restore checkpoint '{}'", id))?;
                id.clone()
            };
            println!("Restored state from checkpoint {}", style(restored).green());
        }
    }
    Ok(())
}

pub fn cmd_reset(cli: &Cli, target: &str, force: bool) -> Result<()> {
    use dialoguer::Confirm;

    let config = load_config(cli, target)?;
    if !config.run_exists() {
        println!("Nothing to reset for {}", config.target);
        return Ok(());
    }

    if !force {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "This will delete markers, state, checkpoints and the failure ledger for {}. Are you sure?",
                config.target
            ))
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    for dir in [&config.markers_dir, &config.state_dir] {
        if dir.exists() {
            std::fs::remove_dir_all(dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
    }
    if config.ledger_file.exists() {
        std::fs::remove_file(&config.ledger_file)
            .with_context(|| format!("Failed to remove {}", config.ledger_file.display()))?;
    }

    println!("Reset complete");
    Ok(())
}
