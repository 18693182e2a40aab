//! Out-of-band control — `foreman stop`, `abort`, `approve`, `retry`, `signal`.
//!
//! These never touch the state file. They write the STOP marker or drop a
//! message into the signal mailbox, and the running loop picks it up on its
//! next iteration.

use anyhow::Result;
use console::style;
use std::path::Path;

use foreman::config::Config;
use foreman::foreman_config::Mode;
use foreman::orchestrator::request_stop;
use foreman::signals::{Mailbox, SignalAction, SignalMessage};

pub fn cmd_stop(project_dir: &Path) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    request_stop(&config.stop_file, "stop requested from cli")?;

    println!("{}", style("Stop signal sent.").yellow());
    println!("The orchestrator will finish its current iteration and shut down.");
    println!();
    println!("Use 'foreman status' to check progress.");
    Ok(())
}

/// Shorthand for item-targeted signals.
pub fn cmd_item_signal(project_dir: &Path, action: &str, item: &str) -> Result<()> {
    cmd_signal(project_dir, action, Some(item), None, &[])
}

pub fn cmd_signal(
    project_dir: &Path,
    action: &str,
    item: Option<&str>,
    mode: Option<&str>,
    flags: &[String],
) -> Result<()> {
    let action: SignalAction = action.parse().map_err(anyhow::Error::msg)?;

    let mut message = SignalMessage::new(action);
    message.target_item = item.map(str::to_string);
    if let Some(mode) = mode {
        message = message.with_mode(mode.parse::<Mode>()?);
    }
    for flag in flags {
        message = message.with_flag(flag.clone());
    }
    message.validate()?;

    let config = Config::new(project_dir.to_path_buf(), false)?;
    let path = Mailbox::new(config.signals_dir).send(message)?;

    let target = item.map(|i| format!(" for {}", i)).unwrap_or_default();
    println!("{} {}{}", style("Signal queued:").green(), action, target);
    println!("  {}", style(path.display()).dim());
    Ok(())
}
