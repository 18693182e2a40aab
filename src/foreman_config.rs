//! Layered configuration for foreman.
//!
//! Settings are read from `.foreman/foreman.toml`, then overridden by
//! environment variables, then by CLI flags. Every field is optional.
//!
//! # Configuration File Format
//!
//! ```toml
//! [orchestrator]
//! max_workers = 3
//! mode = "normal"
//! poll_interval_secs = 10
//! recovery_every = 5
//!
//! [limits]
//! max_failures = 3
//! max_fix_iterations = 3
//!
//! [health]
//! stale_heartbeat_secs = 300
//! stuck_heartbeat_secs = 900
//!
//! [worker]
//! command = "foreman-worker"
//! args = ["--quiet"]
//!
//! [roles.proposer]
//! interval_secs = 1800
//! ready_threshold = 2
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How far the orchestrator may go without a human.
///
/// | Mode         | Approval gate         | Merge gate                       |
/// |--------------|-----------------------|----------------------------------|
/// | `Normal`     | waits for `approved`  | stops and reports ready          |
/// | `Aggressive` | satisfied immediately | merges, one conflict-fix retry   |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Normal,
    Aggressive,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Normal => write!(f, "normal"),
            Mode::Aggressive => write!(f, "aggressive"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Mode::Normal),
            "aggressive" => Ok(Mode::Aggressive),
            _ => anyhow::bail!("Invalid mode '{}': expected normal or aggressive", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Run the recovery sweep every this many iterations.
    #[serde(default = "default_recovery_every")]
    pub recovery_every: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
}

fn default_max_workers() -> usize {
    3
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_recovery_every() -> u64 {
    5
}

fn default_shutdown_grace_secs() -> u64 {
    60
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            mode: Mode::default(),
            poll_interval_secs: default_poll_interval_secs(),
            recovery_every: default_recovery_every(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            max_iterations: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    /// Consecutive spawn failures before an item is forced `Blocked`.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Review/fix cycles before an item is forced `Blocked`.
    #[serde(default = "default_max_fix_iterations")]
    pub max_fix_iterations: u32,
    /// Multiplied by the failure count to get the wait before the next attempt.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_merge_conflict_retries")]
    pub merge_conflict_retries: u32,
}

fn default_max_failures() -> u32 {
    3
}

fn default_max_fix_iterations() -> u32 {
    3
}

fn default_retry_backoff_secs() -> u64 {
    30
}

fn default_merge_conflict_retries() -> u32 {
    1
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            max_fix_iterations: default_max_fix_iterations(),
            retry_backoff_secs: default_retry_backoff_secs(),
            merge_conflict_retries: default_merge_conflict_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_stale_heartbeat_secs")]
    pub stale_heartbeat_secs: u64,
    #[serde(default = "default_stuck_heartbeat_secs")]
    pub stuck_heartbeat_secs: u64,
    /// Share of recent failures that must share a signature.
    #[serde(default = "default_systematic_failure_ratio")]
    pub systematic_failure_ratio: f64,
    #[serde(default = "default_systematic_failure_min_samples")]
    pub systematic_failure_min_samples: usize,
    /// Failures older than this are not "recent".
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
}

fn default_stale_heartbeat_secs() -> u64 {
    300
}

fn default_stuck_heartbeat_secs() -> u64 {
    900
}

fn default_systematic_failure_ratio() -> f64 {
    0.5
}

fn default_systematic_failure_min_samples() -> usize {
    3
}

fn default_failure_window_secs() -> u64 {
    3600
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            stale_heartbeat_secs: default_stale_heartbeat_secs(),
            stuck_heartbeat_secs: default_stuck_heartbeat_secs(),
            systematic_failure_ratio: default_systematic_failure_ratio(),
            systematic_failure_min_samples: default_systematic_failure_min_samples(),
            failure_window_secs: default_failure_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSection {
    /// How long the single-item driver waits at the approval gate.
    #[serde(default = "default_approval_wait_secs")]
    pub wait_secs: u64,
}

fn default_approval_wait_secs() -> u64 {
    300
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            wait_secs: default_approval_wait_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSection {
    #[serde(default = "default_role_enabled")]
    pub enabled: bool,
    #[serde(default = "default_role_interval_secs")]
    pub interval_secs: u64,
}

fn default_role_enabled() -> bool {
    true
}

fn default_role_interval_secs() -> u64 {
    3600
}

impl Default for RoleSection {
    fn default() -> Self {
        Self {
            enabled: default_role_enabled(),
            interval_secs: default_role_interval_secs(),
        }
    }
}

/// The proposer refills the Ready queue, so it carries demand thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposerSection {
    #[serde(default = "default_role_enabled")]
    pub enabled: bool,
    #[serde(default = "default_proposer_interval_secs")]
    pub interval_secs: u64,
    /// Trigger when fewer than this many items are Ready.
    #[serde(default = "default_ready_threshold")]
    pub ready_threshold: usize,
    /// Do not trigger while this many proposals await curation.
    #[serde(default = "default_max_outstanding_proposals")]
    pub max_outstanding_proposals: usize,
    /// Minimum gap between demand-triggered runs.
    #[serde(default = "default_proposer_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_proposer_interval_secs() -> u64 {
    1800
}

fn default_ready_threshold() -> usize {
    2
}

fn default_max_outstanding_proposals() -> usize {
    5
}

fn default_proposer_cooldown_secs() -> u64 {
    300
}

impl Default for ProposerSection {
    fn default() -> Self {
        Self {
            enabled: default_role_enabled(),
            interval_secs: default_proposer_interval_secs(),
            ready_threshold: default_ready_threshold(),
            max_outstanding_proposals: default_max_outstanding_proposals(),
            cooldown_secs: default_proposer_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RolesSection {
    #[serde(default)]
    pub proposer: ProposerSection,
    #[serde(default)]
    pub triage: RoleSection,
    #[serde(default)]
    pub auditor: RoleSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrackerSection {
    /// Relative paths resolve against the project directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

/// The complete foreman.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForemanToml {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub approval: ApprovalSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub roles: RolesSection,
    #[serde(default)]
    pub tracker: TrackerSection,
}

impl ForemanToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foreman.toml")
    }

    /// Load `.foreman/foreman.toml`, or defaults when the file is absent.
    pub fn load_or_default(foreman_dir: &Path) -> Result<Self> {
        let config_path = foreman_dir.join("foreman.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize foreman.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Worker command (env → file → default).
    pub fn worker_cmd(&self) -> String {
        std::env::var("FOREMAN_WORKER_CMD")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.worker.command.clone())
            .unwrap_or_else(|| "foreman-worker".to_string())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.orchestrator.max_workers == 0 {
            warnings.push("orchestrator.max_workers is 0: no items will ever be worked".into());
        }
        if self.orchestrator.poll_interval_secs == 0 {
            warnings.push("orchestrator.poll_interval_secs is 0: the loop will spin".into());
        }
        if self.orchestrator.recovery_every == 0 {
            warnings.push("orchestrator.recovery_every is 0: recovery sweep disabled".into());
        }
        if self.limits.max_failures == 0 {
            warnings.push("limits.max_failures is 0: every item blocks on first failure".into());
        }
        if self.health.stale_heartbeat_secs >= self.health.stuck_heartbeat_secs {
            warnings.push(format!(
                "health.stale_heartbeat_secs ({}) should be below stuck_heartbeat_secs ({})",
                self.health.stale_heartbeat_secs, self.health.stuck_heartbeat_secs
            ));
        }
        if !(0.0..=1.0).contains(&self.health.systematic_failure_ratio)
            || self.health.systematic_failure_ratio == 0.0
        {
            warnings.push(format!(
                "health.systematic_failure_ratio {} should be in (0, 1]",
                self.health.systematic_failure_ratio
            ));
        }

        warnings
    }
}

/// Unified configuration: foreman.toml merged with CLI overrides.
#[derive(Debug, Clone)]
pub struct ForemanConfig {
    pub project_dir: PathBuf,
    pub foreman_dir: PathBuf,
    pub toml: ForemanToml,
    pub verbose: bool,
    pub cli_max_workers: Option<usize>,
    pub cli_mode: Option<Mode>,
    pub cli_max_iterations: Option<u64>,
}

impl ForemanConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let foreman_dir = project_dir.join(".foreman");
        let toml = ForemanToml::load_or_default(&foreman_dir)?;

        Ok(Self {
            project_dir,
            foreman_dir,
            toml,
            verbose: false,
            cli_max_workers: None,
            cli_mode: None,
            cli_max_iterations: None,
        })
    }

    pub fn max_workers(&self) -> usize {
        self.cli_max_workers
            .unwrap_or(self.toml.orchestrator.max_workers)
    }

    /// Mode (CLI → env → file).
    pub fn mode(&self) -> Mode {
        if let Some(mode) = self.cli_mode {
            return mode;
        }
        if let Ok(raw) = std::env::var("FOREMAN_MODE")
            && let Ok(mode) = raw.parse()
        {
            return mode;
        }
        self.toml.orchestrator.mode
    }

    pub fn max_iterations(&self) -> Option<u64> {
        self.cli_max_iterations
            .or(self.toml.orchestrator.max_iterations)
    }

    pub fn worker_cmd(&self) -> String {
        self.toml.worker_cmd()
    }

    pub fn tracker_db_path(&self) -> PathBuf {
        match &self.toml.tracker.db_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.project_dir.join(path),
            None => self.foreman_dir.join("tracker.db"),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        if self.cli_max_workers == Some(0) {
            warnings.push("--max-workers 0: no items will ever be worked".into());
        }
        warnings
    }
}
