use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::foreman_config::{ForemanConfig, ForemanToml, Mode};

/// Runtime configuration for foreman.
///
/// Bridges the layered `ForemanConfig` with what the engine needs at run
/// time: resolved paths under `.foreman/` and the effective pool settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub foreman_dir: PathBuf,
    pub state_file: PathBuf,
    pub signals_dir: PathBuf,
    pub progress_dir: PathBuf,
    pub log_dir: PathBuf,
    pub worker_log_dir: PathBuf,
    pub stop_file: PathBuf,
    pub tracker_db: PathBuf,
    pub worker_cmd: String,
    pub verbose: bool,
    pub max_workers: usize,
    pub mode: Mode,
    pub max_iterations: Option<u64>,
    foreman_config: ForemanConfig,
}

impl Config {
    /// Load `.foreman/foreman.toml` from `project_dir` with no CLI overrides.
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let mut foreman_config =
            ForemanConfig::new(project_dir).context("Failed to load foreman configuration")?;
        foreman_config.verbose = verbose;
        Ok(Self::from_foreman_config(foreman_config))
    }

    pub fn from_foreman_config(foreman_config: ForemanConfig) -> Self {
        let foreman_dir = foreman_config.foreman_dir.clone();
        let log_dir = foreman_dir.join("logs");
        Self {
            project_dir: foreman_config.project_dir.clone(),
            state_file: foreman_dir.join("state.json"),
            signals_dir: foreman_dir.join("signals"),
            progress_dir: foreman_dir.join("progress"),
            worker_log_dir: log_dir.join("workers"),
            log_dir,
            stop_file: foreman_dir.join("STOP"),
            tracker_db: foreman_config.tracker_db_path(),
            worker_cmd: foreman_config.worker_cmd(),
            verbose: foreman_config.verbose,
            max_workers: foreman_config.max_workers(),
            mode: foreman_config.mode(),
            max_iterations: foreman_config.max_iterations(),
            foreman_dir,
            foreman_config,
        }
    }

    pub fn foreman_config(&self) -> &ForemanConfig {
        &self.foreman_config
    }

    /// Shorthand for the parsed foreman.toml.
    pub fn settings(&self) -> &ForemanToml {
        &self.foreman_config.toml
    }

    /// Working directory handed to spawned workers.
    pub fn worker_workdir(&self) -> PathBuf {
        match &self.settings().worker.workdir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.project_dir.join(dir),
            None => self.project_dir.clone(),
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.signals_dir).context("Failed to create signals directory")?;
        std::fs::create_dir_all(&self.progress_dir)
            .context("Failed to create progress directory")?;
        std::fs::create_dir_all(&self.worker_log_dir)
            .context("Failed to create worker log directory")?;
        if let Some(parent) = self.tracker_db.parent() {
            std::fs::create_dir_all(parent).context("Failed to create tracker directory")?;
        }
        Ok(())
    }
}
