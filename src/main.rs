use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "reconductor")]
#[command(version, about = "Phase orchestrator for multi-stage scanning pipelines")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding one run directory per target
    #[arg(short, long, global = true, default_value = "output")]
    pub output_dir: PathBuf,

    /// Path to reconductor.toml. Defaults to ./reconductor.toml when present.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Clone)]
pub struct TargetArgs {
    /// Scan target (domain, host or CIDR)
    #[arg(short, long)]
    pub target: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the phase pipeline against a target
    Run(RunArgs),
    /// Show markers, state and failures for a target
    Status(TargetArgs),
    /// List the configured phases
    Phases,
    /// Manage checkpoints of the state store
    Checkpoint {
        #[command(flatten)]
        target: TargetArgs,
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Delete all markers, state and checkpoints for a target
    Reset {
        #[command(flatten)]
        target: TargetArgs,
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Skip phases that already completed in a previous run
    #[arg(long)]
    pub resume: bool,

    /// Halt the run at the first failed phase
    #[arg(long, conflicts_with = "best_effort")]
    pub fail_fast: bool,

    /// Record failures and continue with the next phase (default)
    #[arg(long)]
    pub best_effort: bool,

    /// Restore this checkpoint before running ("latest" for the newest); implies --resume
    #[arg(long)]
    pub restore: Option<String>,

    /// Run only these phases (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,

    /// Disable these phases (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub skip: Vec<String>,
}

#[derive(Subcommand, Clone)]
pub enum CheckpointCommands {
    /// List checkpoints, oldest first
    List,
    /// Snapshot the current state
    Create {
        /// Checkpoint name (defaults to a timestamp)
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Replace the current state with a checkpoint ("latest" for the newest)
    Restore { id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default reconductor.toml
    Init,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: &Cli) -> Result<u8> {
    match &cli.command {
        Commands::Run(args) => return cmd::run_pipeline(cli, args).await,
        Commands::Status(target) => cmd::cmd_status(cli, &target.target)?,
        Commands::Phases => cmd::cmd_phases(cli)?,
        Commands::Checkpoint { target, command } => {
            cmd::cmd_checkpoint(cli, &target.target, command)?
        }
        Commands::Reset { target, force } => cmd::cmd_reset(cli, &target.target, *force)?,
        Commands::Config { command } => cmd::cmd_config(cli, command.clone())?,
    }
    Ok(0)
}
