//! Support-role scheduler.
//!
//! Support roles are auxiliary workers not bound to any item: the proposer
//! refills the backlog, triage curates proposals, the auditor sweeps the
//! codebase. Each runs at most once at a time, on its interval or on demand.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::foreman_config::RolesSection;
use crate::orchestrator::state::{OrchestratorState, RoleState};
use crate::worker::{SpawnRequest, WorkerHost};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Proposer,
    Triage,
    Auditor,
}

impl RoleKind {
    pub const ALL: [RoleKind; 3] = [Self::Proposer, Self::Triage, Self::Auditor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposer => "proposer",
            Self::Triage => "triage",
            Self::Auditor => "auditor",
        }
    }
}

impl std::fmt::Display for RoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposer" => Ok(Self::Proposer),
            "triage" => Ok(Self::Triage),
            "auditor" => Ok(Self::Auditor),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// True when a role is marked running behind a handle that could be real.
fn is_running(state: &RoleState) -> bool {
    state.running && state.handle.as_ref().is_some_and(|h| h.is_well_formed())
}

fn elapsed(since: Option<DateTime<Utc>>, interval_secs: u64, now: DateTime<Utc>) -> bool {
    since.is_none_or(|at| now.signed_duration_since(at).num_seconds() >= interval_secs as i64)
}

/// Spawn when not running and either demanded or due by interval.
/// Demand bypasses the interval, never the running check or the cooldown
/// after a failed spawn.
pub fn should_spawn(state: &RoleState, interval_secs: u64, now: DateTime<Utc>) -> bool {
    if is_running(state) || !elapsed(state.last_failed, interval_secs, now) {
        return false;
    }
    state.demand || elapsed(state.last_completed, interval_secs, now)
}

pub struct RoleScheduler {
    host: Arc<dyn WorkerHost>,
    config: RolesSection,
    workdir: PathBuf,
}

impl RoleScheduler {
    pub fn new(host: Arc<dyn WorkerHost>, config: RolesSection, workdir: PathBuf) -> Self {
        Self {
            host,
            config,
            workdir,
        }
    }

    pub fn enabled(&self, role: RoleKind) -> bool {
        match role {
            RoleKind::Proposer => self.config.proposer.enabled,
            RoleKind::Triage => self.config.triage.enabled,
            RoleKind::Auditor => self.config.auditor.enabled,
        }
    }

    pub fn interval_secs(&self, role: RoleKind) -> u64 {
        match role {
            RoleKind::Proposer => self.config.proposer.interval_secs,
            RoleKind::Triage => self.config.triage.interval_secs,
            RoleKind::Auditor => self.config.auditor.interval_secs,
        }
    }

    /// Mark finished roles complete and reset roles whose handle is bogus.
    pub async fn poll(&self, state: &mut OrchestratorState, now: DateTime<Utc>) {
        for role in RoleKind::ALL {
            let rs = state.role_state(role);
            if !rs.running {
                continue;
            }
            let Some(handle) = rs.handle.clone().filter(|h| h.is_well_formed()) else {
                tracing::warn!(role = %role, handle = ?rs.handle, "Role marked running with invalid handle; resetting");
                rs.running = false;
                rs.handle = None;
                continue;
            };
            if self.host.is_alive(&handle).await {
                continue;
            }
            let code = self.host.exit_code(&handle).await;
            tracing::info!(role = %role, exit_code = ?code, "Support role finished");
            let rs = state.role_state(role);
            rs.running = false;
            rs.handle = None;
            rs.last_completed = Some(now);
        }
    }

    /// Record demand triggers, then spawn every role that is due.
    pub async fn tick(
        &self,
        state: &mut OrchestratorState,
        demands: &[RoleKind],
        now: DateTime<Utc>,
    ) -> Vec<RoleKind> {
        for role in demands {
            state.role_state(*role).demand = true;
        }

        let mut spawned = Vec::new();
        for role in RoleKind::ALL {
            if !self.enabled(role) {
                continue;
            }
            let interval = self.interval_secs(role);
            if !should_spawn(state.role_state(role), interval, now) {
                continue;
            }
            let request = SpawnRequest::new(role.as_str())
                .with_workdir(self.workdir.clone())
                .with_env("FOREMAN_ROLE", role.as_str());
            match self.host.spawn(&request).await {
                Ok(handle) => {
                    tracing::info!(role = %role, handle = %handle, "Spawned support role");
                    let rs = state.role_state(role);
                    rs.running = true;
                    rs.handle = Some(handle);
                    rs.last_started = Some(now);
                    rs.last_failed = None;
                    rs.demand = false;
                    spawned.push(role);
                }
                Err(e) => {
                    tracing::warn!(role = %role, error = %e, "Failed to spawn support role");
                    let rs = state.role_state(role);
                    rs.last_failed = Some(now);
                    rs.demand = false;
                }
            }
        }
        spawned
    }

    /// Destroy any role still running, used at shutdown.
    pub async fn stop_all(&self, state: &mut OrchestratorState) {
        for role in RoleKind::ALL {
            let rs = state.role_state(role);
            if let Some(handle) = rs.handle.take() {
                if let Err(e) = self.host.destroy(&handle).await {
                    tracing::warn!(role = %role, error = %e, "Failed to stop support role");
                }
            }
            state.role_state(role).running = false;
        }
    }
}
