use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Pull-based orchestrator for tracker work items")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Stderr log format: pretty or json
    #[arg(long, global = true, default_value = "pretty")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .foreman/ with a default foreman.toml and an empty tracker
    Init,
    /// Run the control loop until stopped
    Run {
        /// Run a single iteration and exit (workers keep running)
        #[arg(long)]
        once: bool,

        /// normal or aggressive
        #[arg(long)]
        mode: Option<String>,

        #[arg(long)]
        max_workers: Option<usize>,

        /// Stop after this many iterations
        #[arg(long)]
        max_iterations: Option<u64>,
    },
    /// Claim one item and drive it through its phases in the foreground
    Drive {
        item: String,

        #[arg(long)]
        mode: Option<String>,
    },
    /// Show the persisted orchestrator state
    Status {
        /// Print the raw state file
        #[arg(long)]
        json: bool,
    },
    /// Ask a running loop to stop gracefully
    Stop,
    /// Return an in-progress item to Ready at its next phase boundary
    Abort { item: String },
    /// Approve an item waiting at the approval gate
    Approve { item: String },
    /// Unblock a blocked item
    Retry { item: String },
    /// Write an arbitrary signal into the mailbox
    Signal {
        /// claim, abort, approve, retry, merge, set_mode, trigger_role, shutdown
        action: String,

        #[arg(long)]
        item: Option<String>,

        #[arg(long)]
        mode: Option<String>,

        #[arg(long = "flag")]
        flags: Vec<String>,
    },
    /// Manage work items in the local tracker
    Item {
        #[command(subcommand)]
        command: ItemCommands,
    },
    /// Manage change artifacts in the local tracker
    Artifact {
        #[command(subcommand)]
        command: ArtifactCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ItemCommands {
    /// Create a work item
    Add {
        title: String,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Lower runs first
        #[arg(short, long, default_value = "0")]
        priority: i32,

        /// Initial state (proposed, curated, ready)
        #[arg(long, default_value = "ready")]
        state: String,

        /// Item that must be closed first (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },
    /// List work items
    List {
        #[arg(long)]
        state: Option<String>,
    },
    /// Show one item with its comments
    Show { id: String },
}

#[derive(Subcommand, Clone)]
pub enum ArtifactCommands {
    /// Attach a change artifact to an item
    Add {
        item: String,

        #[arg(long, default_value = "0")]
        size: u64,
    },
    /// Update an artifact's review state or mergeability
    Set {
        id: String,

        #[arg(long)]
        state: Option<String>,

        #[arg(long)]
        mergeable: Option<bool>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default foreman.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let _ = dotenvy::from_path(project_dir.join(".env"));

    let format = cli
        .log_format
        .parse::<foreman::logging::LogFormat>()
        .map_err(anyhow::Error::msg)?;
    // Long-running commands also log to .foreman/logs/.
    let log_dir = match &cli.command {
        Commands::Run { .. } | Commands::Drive { .. } => {
            Some(project_dir.join(".foreman").join("logs"))
        }
        _ => None,
    };
    let _log_guard = foreman::logging::init(&foreman::logging::LogOptions {
        verbose: cli.verbose,
        format,
        log_dir,
    })?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Run {
            once,
            mode,
            max_workers,
            max_iterations,
        } => {
            let max_iterations = if *once { Some(1) } else { *max_iterations };
            cmd::cmd_run(&cli, project_dir, mode.as_deref(), *max_workers, max_iterations)
                .await?;
        }
        Commands::Drive { item, mode } => {
            cmd::cmd_drive(&cli, project_dir, item, mode.as_deref()).await?
        }
        Commands::Status { json } => cmd::cmd_status(&project_dir, *json)?,
        Commands::Stop => cmd::cmd_stop(&project_dir)?,
        Commands::Abort { item } => cmd::cmd_item_signal(&project_dir, "abort", item)?,
        Commands::Approve { item } => cmd::cmd_item_signal(&project_dir, "approve", item)?,
        Commands::Retry { item } => cmd::cmd_item_signal(&project_dir, "retry", item)?,
        Commands::Signal {
            action,
            item,
            mode,
            flags,
        } => cmd::cmd_signal(&project_dir, action, item.as_deref(), mode.as_deref(), flags)?,
        Commands::Item { command } => cmd::cmd_item(&project_dir, command.clone()).await?,
        Commands::Artifact { command } => {
            cmd::cmd_artifact(&project_dir, command.clone()).await?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
