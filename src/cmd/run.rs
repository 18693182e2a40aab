//! Control loop and single-item driver — `foreman run`, `foreman drive`.

use anyhow::{Context, Result};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use foreman::config::Config;
use foreman::foreman_config::{ForemanConfig, Mode};
use foreman::orchestrator::{Orchestrator, Shutdown, StopReason};
use foreman::phase::{DriveOutcome, ItemDriver};
use foreman::pool::PoolManager;
use foreman::tracker::DbHandle;
use foreman::worker::{ProcessHost, ProgressStore};

use crate::Cli;

fn load_config(
    cli: &Cli,
    project_dir: PathBuf,
    mode: Option<&str>,
    max_workers: Option<usize>,
    max_iterations: Option<u64>,
) -> Result<Config> {
    let mut foreman_config =
        ForemanConfig::new(project_dir).context("Failed to load foreman configuration")?;
    foreman_config.verbose = cli.verbose;
    foreman_config.cli_mode = mode.map(str::parse::<Mode>).transpose()?;
    foreman_config.cli_max_workers = max_workers;
    foreman_config.cli_max_iterations = max_iterations;

    for warning in foreman_config.validate() {
        tracing::warn!(%warning, "Configuration warning");
    }

    let config = Config::from_foreman_config(foreman_config);
    config.ensure_directories()?;
    Ok(config)
}

fn process_host(config: &Config) -> ProcessHost {
    ProcessHost::new(
        config.worker_cmd.clone(),
        config.settings().worker.args.clone(),
        config.worker_log_dir.clone(),
    )
}

pub async fn cmd_run(
    cli: &Cli,
    project_dir: PathBuf,
    mode: Option<&str>,
    max_workers: Option<usize>,
    max_iterations: Option<u64>,
) -> Result<()> {
    let config = load_config(cli, project_dir, mode, max_workers, max_iterations)?;

    let shutdown = Shutdown::new(config.stop_file.clone());
    shutdown.clear_marker()?;
    shutdown.listen_for_ctrl_c();

    let tracker = DbHandle::open(&config.tracker_db)?;
    let host = process_host(&config);

    println!();
    println!("{}", style("Foreman Orchestrator").bold().cyan());
    println!("─────────────────────────");
    println!("Mode: {}", config.mode);
    println!("Workers: {}", config.max_workers);
    println!("Worker command: {}", config.worker_cmd);
    println!("Tracker: {}", config.tracker_db.display());
    println!();

    let mut orchestrator =
        Orchestrator::new(&config, Arc::new(tracker), Arc::new(host), shutdown)?;
    let summary = orchestrator.run().await?;

    println!();
    match summary.reason {
        StopReason::Shutdown => println!(
            "{} after {} iterations.",
            style("Stopped").yellow(),
            summary.iterations
        ),
        StopReason::IterationCap => println!(
            "{} after {} iterations; running workers were left in place.",
            style("Iteration limit reached").yellow(),
            summary.iterations
        ),
    }
    if !summary.unresolved.is_empty() {
        println!(
            "{} {}",
            style("Returned to ready without a clean finish:").red(),
            summary.unresolved.join(", ")
        );
    }

    Ok(())
}

pub async fn cmd_drive(
    cli: &Cli,
    project_dir: PathBuf,
    item_id: &str,
    mode: Option<&str>,
) -> Result<()> {
    let config = load_config(cli, project_dir, mode, Some(1), None)?;
    let settings = config.settings();

    let shutdown = Shutdown::new(config.stop_file.clone());
    shutdown.clear_marker()?;
    shutdown.listen_for_ctrl_c();

    let tracker = DbHandle::open(&config.tracker_db)?;
    let pool = PoolManager::new(
        Arc::new(tracker),
        Arc::new(process_host(&config)),
        ProgressStore::new(config.progress_dir.clone()),
        settings.limits.clone(),
        config.worker_workdir(),
    );

    println!(
        "Driving {} in {} mode",
        style(item_id).bold(),
        config.mode
    );

    let driver = ItemDriver::new(&pool, &shutdown, config.mode)
        .with_poll_interval(Duration::from_secs(
            settings.orchestrator.poll_interval_secs.max(1),
        ))
        .with_approval_wait(Duration::from_secs(settings.approval.wait_secs))
        .with_grace(Duration::from_secs(settings.orchestrator.shutdown_grace_secs));

    let outcome = driver.drive(item_id).await?;
    match outcome {
        DriveOutcome::Closed => println!("{} {} closed", style("✓").green(), item_id),
        DriveOutcome::ParkedForApproval => println!(
            "{} waiting for approval; run `foreman approve {}`",
            style("⏸").yellow(),
            item_id
        ),
        DriveOutcome::ParkedForMerge => println!(
            "{} ready to merge; run `foreman signal merge --item {}`",
            style("⏸").yellow(),
            item_id
        ),
        DriveOutcome::Blocked(reason) => {
            println!("{} blocked: {}", style("✗").red(), reason)
        }
        DriveOutcome::Aborted => println!("{} aborted; returned to ready", style("↩").yellow()),
        DriveOutcome::Interrupted => {
            println!("{} interrupted; returned to ready", style("↩").yellow())
        }
        DriveOutcome::Requeued(reason) => {
            println!("{} {}; returned to ready", style("↩").yellow(), reason)
        }
        DriveOutcome::NotStarted(reason) => {
            println!("{} not started: {}", style("✗").red(), reason)
        }
        DriveOutcome::Moved(state) => println!(
            "{} item was moved to {} by someone else",
            style("!").yellow(),
            state
        ),
    }

    Ok(())
}
