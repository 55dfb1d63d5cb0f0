//! Pipeline execution: `reconductor run`.

use anyhow::{Context, Result, bail};
use std::sync::Arc;

use super::super::{Cli, RunArgs};

pub async fn run_pipeline(cli: &Cli, args: &RunArgs) -> Result<u8> {
    use reconductor::config::Config;
    use reconductor::ledger::FailureLedger;
    use reconductor::logging::init_tracing;
    use reconductor::markers::MarkerStore;
    use reconductor::orchestrator::{Orchestrator, RunOptions, wait_for_shutdown_signal};
    use reconductor::phase::{RunContext, build_pipeline};
    use reconductor::pipeline_config::{FailurePolicy, LogFormat};
    use reconductor::process::{ProcessRegistry, ToolRunner};
    use reconductor::state::StateStore;
    use reconductor::ui::RunUI;

    let config = Config::new(
        &cli.output_dir,
        &args.target.target,
        cli.config.as_deref(),
        cli.verbose,
    )?;
    config.ensure_directories()?;
    let pipeline = config.pipeline();

    let log_format = pipeline.log_format();
    let level = if cli.verbose {
        "debug"
    } else {
        pipeline.run.log_level.as_str()
    };
    // Flushes the file log when dropped at the end of this function.
    let _log_guard = init_tracing(level, log_format, Some(&config.log_dir))?;

    let mut phases = build_pipeline(pipeline);
    for id in args.only.iter().chain(&args.skip) {
        if !phases.iter().any(|p| &p.id == id) {
            bail!("Unknown phase '{}'", id);
        }
    }
    if !args.only.is_empty() {
        for phase in &mut phases {
            phase.enabled = args.only.contains(&phase.id);
        }
    }
    for phase in &mut phases {
        if args.skip.contains(&phase.id) {
            phase.enabled = false;
        }
    }

    let policy = if args.fail_fast {
        FailurePolicy::FailFast
    } else if args.best_effort {
        FailurePolicy::BestEffort
    } else {
        pipeline.policy()
    };

    let state = Arc::new(StateStore::new(&config.state_dir, &config.target));
    let mut resume = args.resume;
    if let Some(id) = &args.restore {
        let restored = if id == "latest" {
            state
                .restore_latest()
                .context("Cannot restore latest checkpoint")?
        } else {
            state
                .restore(id)
                .with_context(|| format!("Cannot restore checkpoint '{}'", id))?;
            id.clone()
        };
        tracing::info!(checkpoint = %restored, "state restored from checkpoint");
        resume = true;
    }

    let markers = Arc::new(MarkerStore::new(&config.markers_dir));
    let ledger = Arc::new(FailureLedger::new(
        &config.ledger_file,
        uuid::Uuid::new_v4(),
    ));
    let registry = Arc::new(ProcessRegistry::new(pipeline.grace_period()));
    let tools = ToolRunner::new(registry.clone())
        .with_log_dir(&config.tool_log_dir)
        .with_working_dir(&config.run_dir);
    let mut ctx = RunContext::new(
        &config.run_dir,
        &config.target,
        &config.markers_dir,
        state.clone(),
        tools,
    );

    let options = RunOptions {
        resume,
        policy,
        checkpoint_every: pipeline.run.checkpoint_every as usize,
        drain_timeout: pipeline.drain_timeout(),
    };

    let ui = Arc::new(if log_format == LogFormat::Json {
        RunUI::hidden()
    } else {
        RunUI::new(phases.len() as u64, cli.verbose)
    });
    let orchestrator = Orchestrator::new(phases, markers, state, ledger.clone(), registry, options)?
        .with_runs_dir(&config.runs_dir)
        .with_observer(ui.clone());

    ui.print_header(&config.target, resume, &policy.to_string());

    let signal_ui = ui.clone();
    let shutdown = async move {
        match wait_for_shutdown_signal().await {
            Ok(signal) => {
                tracing::warn!(signal, "shutdown signal received");
                signal_ui.interrupted(signal);
            }
            Err(e) => {
                tracing::error!(error = %e, "signal handlers unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    let summary = orchestrator.run(&mut ctx, shutdown).await;

    let failures = ledger.entries_for_run().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "could not read failure ledger");
        Vec::new()
    });
    ui.print_summary(&summary, &failures);

    Ok(summary.exit_code())
}
