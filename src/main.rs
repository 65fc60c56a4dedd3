use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use waypoint::config::WaypointConfig;
use waypoint::escalation::EscalationStatus;

mod cmd;

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(version, about = "Operate durable workflows, escalations and decision trails")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Waypoint home directory. Defaults to $WAYPOINT_HOME, then the platform data directory.
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and answer escalations
    Escalations {
        #[command(subcommand)]
        command: EscalationCommands,
    },
    /// Inspect, recover or reset persisted workflow state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Read decision audit trails
    Decisions {
        #[command(subcommand)]
        command: DecisionCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum EscalationCommands {
    /// List escalations, oldest first
    List {
        /// Only show escalations with this status (pending or resolved)
        #[arg(long)]
        status: Option<EscalationStatus>,
        /// Only show escalations raised by this workflow
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Show one escalation with its context
    Show { id: String },
    /// Answer a pending escalation. A waiting workflow resumes on its next poll.
    Respond { id: String, response: String },
    /// Pending and resolved counts and mean resolution time
    Metrics,
}

#[derive(Subcommand, Clone)]
pub enum StateCommands {
    /// List persisted workflows
    List,
    /// Show a workflow's state and step log
    Show { id: String },
    /// Replace a corrupt state file with the newest valid backup
    Recover { id: String },
    /// Delete a workflow's state and backups
    Reset {
        id: String,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum DecisionCommands {
    /// List workflows with recorded decisions
    List,
    /// Show a workflow's decision trail
    Show { workflow_id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default waypoint.toml file
    Init,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "waypoint=debug" } else { "waypoint=warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .without_time(),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = WaypointConfig::load(cli.home.clone())?;

    match &cli.command {
        Commands::Escalations { command } => cmd::cmd_escalations(&config, command).await?,
        Commands::State { command } => cmd::cmd_state(&config, command)?,
        Commands::Decisions { command } => cmd::cmd_decisions(&config, command)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
