//! Configuration view and validation commands — `foreman config`.

use anyhow::Result;
use std::path::Path;

use foreman::foreman_config::{ForemanConfig, ForemanToml};

use crate::ConfigCommands;

fn print_settings(toml: &ForemanToml) {
    println!("[orchestrator]");
    println!("  max_workers = {}", toml.orchestrator.max_workers);
    println!("  mode = \"{}\"", toml.orchestrator.mode);
    println!("  poll_interval_secs = {}", toml.orchestrator.poll_interval_secs);
    println!("  recovery_every = {}", toml.orchestrator.recovery_every);
    println!("  shutdown_grace_secs = {}", toml.orchestrator.shutdown_grace_secs);
    if let Some(max) = toml.orchestrator.max_iterations {
        println!("  max_iterations = {}", max);
    }
    println!();

    println!("[limits]");
    println!("  max_failures = {}", toml.limits.max_failures);
    println!("  max_fix_iterations = {}", toml.limits.max_fix_iterations);
    println!();

    println!("[health]");
    println!("  stale_heartbeat_secs = {}", toml.health.stale_heartbeat_secs);
    println!("  stuck_heartbeat_secs = {}", toml.health.stuck_heartbeat_secs);
    println!(
        "  systematic_failure_ratio = {}",
        toml.health.systematic_failure_ratio
    );
    println!();

    println!("[roles]");
    println!(
        "  proposer: enabled = {}, interval_secs = {}, ready_threshold = {}",
        toml.roles.proposer.enabled,
        toml.roles.proposer.interval_secs,
        toml.roles.proposer.ready_threshold
    );
    println!(
        "  triage: enabled = {}, interval_secs = {}",
        toml.roles.triage.enabled, toml.roles.triage.interval_secs
    );
    println!(
        "  auditor: enabled = {}, interval_secs = {}",
        toml.roles.auditor.enabled, toml.roles.auditor.interval_secs
    );
    println!();
}

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let foreman_dir = project_dir.join(".foreman");
    let config_path = foreman_dir.join("foreman.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Foreman Configuration");
            println!("=====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                print_settings(&ForemanToml::load(&config_path)?);

                println!("Effective values (with env/CLI overrides):");
                let config = ForemanConfig::new(project_dir.to_path_buf())?;
                println!("  worker_cmd = \"{}\"", config.worker_cmd());
                println!("  mode = \"{}\"", config.mode());
                println!("  tracker_db = \"{}\"", config.tracker_db_path().display());
                println!();
            } else {
                println!("No foreman.toml found at {}", config_path.display());
                println!();
                println!("Using default configuration:");
                print_settings(&ForemanToml::default());
                println!("Run 'foreman config init' to create a foreman.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No foreman.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ForemanToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("foreman.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&foreman_dir)?;
            ForemanToml::default().save(&config_path)?;

            println!("Created foreman.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [orchestrator] max_workers, mode, poll_interval_secs");
            println!("  - [worker] command, args, workdir");
            println!("  - [roles.proposer] ready_threshold, interval_secs");
            println!();
        }
    }

    Ok(())
}
