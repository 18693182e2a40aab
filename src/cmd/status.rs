//! Orchestrator state view — `foreman status`.

use anyhow::{Context, Result};
use chrono::Utc;
use console::style;
use std::path::Path;

use foreman::config::Config;
use foreman::orchestrator::{OrchestratorState, StateStore};

pub fn cmd_status(project_dir: &Path, json: bool) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;

    let Some(state) = StateStore::load(&config.state_file)? else {
        println!("No orchestrator state found. Run `foreman run` first.");
        return Ok(());
    };

    if json {
        let out = serde_json::to_string_pretty(&state).context("Failed to serialize state")?;
        println!("{}", out);
        return Ok(());
    }

    print_state(&state, config.stop_file.exists());
    Ok(())
}

fn print_state(state: &OrchestratorState, stop_pending: bool) {
    let now = Utc::now();

    println!();
    println!("{}", style("Foreman Status").bold().cyan());
    println!("─────────────────────────");
    println!("Session: {}", state.session_token);
    println!("Mode: {}", state.mode);
    println!("Iterations: {}", state.iteration_count);
    println!(
        "Updated: {} ({}s ago)",
        state.updated_at.format("%Y-%m-%d %H:%M:%S"),
        (now - state.updated_at).num_seconds().max(0)
    );
    if stop_pending {
        println!("{}", style("Stop requested").yellow());
    }
    println!();

    println!(
        "Workers: {}/{} busy",
        state.working_count(),
        state.worker_slots.len()
    );
    for slot in &state.worker_slots {
        match (&slot.assigned_item_id, slot.is_working()) {
            (Some(item), true) => {
                let phase = slot.phase.map(|p| p.to_string()).unwrap_or_default();
                let elapsed = slot
                    .started_at
                    .map(|t| format!("{}m", (now - t).num_minutes().max(0)))
                    .unwrap_or_default();
                let cancel = if slot.cancel_requested {
                    format!(" {}", style("(aborting)").yellow())
                } else {
                    String::new()
                };
                println!(
                    "  [{}] {} {} {}{}",
                    slot.slot_id,
                    style(item).bold(),
                    phase,
                    style(elapsed).dim(),
                    cancel
                );
            }
            _ => println!("  [{}] {}", slot.slot_id, style("idle").dim()),
        }
    }

    if !state.support_roles.is_empty() {
        println!();
        println!("Support roles:");
        for (role, role_state) in &state.support_roles {
            let status = if role_state.running {
                style("running").green().to_string()
            } else {
                style("idle").dim().to_string()
            };
            let last = role_state
                .last_completed
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".to_string());
            println!("  {:<10} {}  last completed: {}", role, status, last);
        }
    }

    if !state.retry_queue.is_empty() {
        println!();
        println!("Retry queue:");
        for info in state.retry_queue.values() {
            let marker = if info.exhausted {
                style("exhausted").red().to_string()
            } else {
                format!("{} failures", info.failure_count)
            };
            println!("  {} ({}): {}", info.item_id, marker, info.last_error);
        }
    }

    if !state.warnings.is_empty() {
        println!();
        println!("{}", style("Warnings:").yellow());
        for warning in &state.warnings {
            let item = warning.item_id.as_deref().unwrap_or("-");
            println!("  {:?} {}: {}", warning.kind, item, warning.message);
        }
    }
    println!();
}
