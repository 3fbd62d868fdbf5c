use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "phasegate")]
#[command(version, about = "Phase-gated orchestration kernel with audited transitions")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Override the state directory. Takes precedence over PHASEGATE_STATE_DIR.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a fresh project state at NEW
    Init {
        /// Project name (defaults to the directory name)
        name: Option<String>,
        /// Replace an existing project state
        #[arg(long)]
        force: bool,
    },
    /// Show phase, step and progress
    Status,
    /// Advance one step or phase
    Advance,
    /// Return to step 1 of the previous phase
    Rollback,
    /// Request an explicit action: advance, rollback, skip, override
    Transition { action: String },
    /// Run the quality gate without transitioning
    Gate,
    /// Inspect and export the transition audit trail
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
    /// Record a project decision
    Decide {
        description: String,
        #[arg(short, long)]
        rationale: Option<String>,
    },
    /// Record or resolve project errors
    Error {
        #[command(subcommand)]
        command: ErrorCommands,
    },
    /// Edit the free-form project context
    Context {
        #[command(subcommand)]
        command: ContextCommands,
    },
    /// Check and reconcile drift between state and workspace
    Drift {
        #[command(subcommand)]
        command: DriftCommands,
    },
    /// Record artifact checksums used by drift detection
    Checksums {
        #[command(subcommand)]
        command: ChecksumCommands,
    },
    /// Inspect or reset the circuit breaker
    Breaker {
        #[command(subcommand)]
        command: BreakerCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Delete all persisted state for this project
    Reset {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Print the audit trail
    Show {
        /// Only show failed attempts
        #[arg(long)]
        failed: bool,
        /// Only show entries leaving or entering this phase
        #[arg(long)]
        phase: Option<String>,
    },
    /// Write the audit trail to the audit/ directory
    Export,
    /// List earlier exports, newest first
    Exports,
    /// Print the write-ahead log
    Wal,
}

#[derive(Subcommand)]
pub enum ErrorCommands {
    Add {
        message: String,
        #[arg(short, long)]
        code: Option<String>,
    },
    Resolve { id: String },
}

#[derive(Subcommand)]
pub enum ContextCommands {
    /// Set a key. The value is parsed as JSON, falling back to a string.
    Set { key: String, value: String },
    Show,
}

#[derive(Subcommand)]
pub enum DriftCommands {
    /// Compare persisted state with the workspace
    Check,
    /// Record the current drift report into the project state
    Reconcile,
    /// Save a baseline hash of the state directory
    Baseline,
    /// Compare the state directory with its baseline
    Dir,
}

#[derive(Subcommand)]
pub enum ChecksumCommands {
    /// Hash files relative to the project root (defaults to the current phase's artifacts)
    Record { paths: Vec<String> },
    Show,
}

#[derive(Subcommand)]
pub enum BreakerCommands {
    Status,
    /// Close the circuit after human review
    Reset,
    /// Mark an intervention request handled
    Resolve { id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default phasegate.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = phasegate::config::PhasegateConfig::with_cli_args(
        project_dir,
        cli.state_dir.clone(),
        cli.verbose,
    )?;
    let _log_guard = cmd::logging::init(&config)?;

    match &cli.command {
        Commands::Init { name, force } => {
            cmd::cmd_init(&config, &cli, name.as_deref(), *force)?
        }
        Commands::Status => cmd::cmd_status(&config, &cli)?,
        Commands::Advance => {
            cmd::cmd_transition(&config, &cli, phasegate::TransitionAction::Advance).await?
        }
        Commands::Rollback => {
            cmd::cmd_transition(&config, &cli, phasegate::TransitionAction::Rollback).await?
        }
        Commands::Transition { action } => {
            let action = action.parse()?;
            cmd::cmd_transition(&config, &cli, action).await?
        }
        Commands::Gate => cmd::cmd_gate(&config, &cli).await?,
        Commands::Audit { command } => cmd::cmd_audit(&config, &cli, command)?,
        Commands::Decide {
            description,
            rationale,
        } => cmd::cmd_decide(&config, &cli, description, rationale.as_deref())?,
        Commands::Error { command } => cmd::cmd_error(&config, &cli, command)?,
        Commands::Context { command } => cmd::cmd_context(&config, &cli, command)?,
        Commands::Drift { command } => cmd::cmd_drift(&config, &cli, command)?,
        Commands::Checksums { command } => cmd::cmd_checksums(&config, &cli, command)?,
        Commands::Breaker { command } => cmd::cmd_breaker(&config, &cli, command)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
        Commands::Reset { force } => cmd::cmd_reset(&config, *force)?,
    }

    Ok(())
}
