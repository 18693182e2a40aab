//! The persisted orchestrator document (`.foreman/state.json`).
//!
//! Plain data. Components read it and mutate their own parts in memory;
//! the control loop commits it once per iteration through
//! [`super::guard::StateStore`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::foreman_config::Mode;
use crate::roles::RoleKind;
use crate::tracker::Phase;
use crate::worker::WorkerHandle;

/// Failure messages kept for systematic-failure detection.
const RECENT_FAILURE_CAP: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    #[default]
    Idle,
    Working,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkerSlot {
    pub slot_id: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_handle: Option<WorkerHandle>,
    #[serde(default)]
    pub status: SlotStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Phase the assigned worker is executing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Abort requested; honored when the worker's phase ends.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl WorkerSlot {
    pub fn idle(slot_id: usize) -> Self {
        Self {
            slot_id,
            ..Default::default()
        }
    }

    pub fn is_working(&self) -> bool {
        self.status == SlotStatus::Working
    }

    pub fn assign(&mut self, item_id: &str, handle: WorkerHandle, phase: Phase, now: DateTime<Utc>) {
        self.assigned_item_id = Some(item_id.to_string());
        self.session_handle = Some(handle);
        self.status = SlotStatus::Working;
        self.started_at = Some(now);
        self.last_heartbeat = Some(now);
        self.phase = Some(phase);
        self.cancel_requested = false;
    }

    pub fn clear(&mut self) {
        *self = Self::idle(self.slot_id);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryInfo {
    pub item_id: String,
    pub failure_count: u32,
    pub last_error: String,
    pub last_attempt: DateTime<Utc>,
    /// Set once the item hit the failure limit and was blocked.
    #[serde(default)]
    pub exhausted: bool,
}

impl RetryInfo {
    /// Earliest time the item may be attempted again.
    pub fn next_eligible(&self, backoff_secs: u64) -> DateTime<Utc> {
        let wait = backoff_secs.saturating_mul(u64::from(self.failure_count));
        self.last_attempt + chrono::Duration::seconds(i64::try_from(wait).unwrap_or(i64::MAX / 2))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RoleState {
    #[serde(default)]
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<WorkerHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed: Option<DateTime<Utc>>,
    /// Pending demand trigger; consumed when the role spawns.
    #[serde(default)]
    pub demand: bool,
    /// Last failed spawn. Holds the role back for one interval, demand or not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    StaleHeartbeat,
    Stuck,
    SystematicFailure,
    RetryExhausted,
    CycleExhausted,
    UnresolvedSlot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Warning {
    pub kind: WarningKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub item_id: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorState {
    pub session_token: String,
    #[serde(default)]
    pub iteration_count: u64,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub worker_slots: Vec<WorkerSlot>,
    #[serde(default)]
    pub support_roles: BTreeMap<RoleKind, RoleState>,
    #[serde(default)]
    pub retry_queue: BTreeMap<String, RetryInfo>,
    #[serde(default)]
    pub warnings: Vec<Warning>,
    #[serde(default)]
    pub recent_failures: Vec<FailureRecord>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl OrchestratorState {
    pub fn new(session_token: impl Into<String>, mode: Mode, max_workers: usize) -> Self {
        let mut state = Self {
            session_token: session_token.into(),
            iteration_count: 0,
            mode,
            worker_slots: Vec::new(),
            support_roles: BTreeMap::new(),
            retry_queue: BTreeMap::new(),
            warnings: Vec::new(),
            recent_failures: Vec::new(),
            updated_at: Utc::now(),
        };
        state.resize_slots(max_workers);
        state
    }

    /// Bring the pool to exactly `max_workers` slots. Working slots are kept
    /// ahead of idle ones, in slot order. Working slots beyond the limit are
    /// removed and returned; the caller stops their workers and reverts
    /// their claims.
    pub fn resize_slots(&mut self, max_workers: usize) -> Vec<WorkerSlot> {
        let mut kept: Vec<WorkerSlot> = Vec::with_capacity(max_workers);
        let mut surplus = Vec::new();
        let mut working_budget = max_workers;
        let mut idle_budget = max_workers.saturating_sub(self.working_count());
        for slot in self.worker_slots.drain(..) {
            if slot.is_working() {
                if working_budget > 0 {
                    working_budget -= 1;
                    kept.push(slot);
                } else {
                    surplus.push(slot);
                }
            } else if idle_budget > 0 {
                idle_budget -= 1;
                kept.push(slot);
            }
        }
        while kept.len() < max_workers {
            kept.push(WorkerSlot::idle(0));
        }
        for (i, slot) in kept.iter_mut().enumerate() {
            slot.slot_id = i;
        }
        self.worker_slots = kept;
        surplus
    }

    pub fn working_count(&self) -> usize {
        self.worker_slots.iter().filter(|s| s.is_working()).count()
    }

    pub fn idle_count(&self) -> usize {
        self.worker_slots.len() - self.working_count()
    }

    pub fn first_idle_slot(&self) -> Option<usize> {
        self.worker_slots.iter().position(|s| !s.is_working())
    }

    pub fn slot_for_item(&self, item_id: &str) -> Option<usize> {
        self.worker_slots
            .iter()
            .position(|s| s.is_working() && s.assigned_item_id.as_deref() == Some(item_id))
    }

    pub fn role_state(&mut self, role: RoleKind) -> &mut RoleState {
        self.support_roles.entry(role).or_default()
    }

    pub fn warn(
        &mut self,
        kind: WarningKind,
        item_id: Option<&str>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let item_id = item_id.map(str::to_string);
        if self
            .warnings
            .iter()
            .any(|w| w.kind == kind && w.item_id == item_id)
        {
            return;
        }
        self.warnings.push(Warning {
            kind,
            item_id,
            message: message.into(),
            raised_at: now,
        });
    }

    /// Remove warnings of `kind` so the next sweep can re-evaluate them.
    pub fn clear_warnings(&mut self, kind: WarningKind) {
        self.warnings.retain(|w| w.kind != kind);
    }

    pub fn record_failure(&mut self, item_id: &str, message: &str, now: DateTime<Utc>) {
        self.recent_failures.push(FailureRecord {
            item_id: item_id.to_string(),
            message: message.to_string(),
            at: now,
        });
        if self.recent_failures.len() > RECENT_FAILURE_CAP {
            let excess = self.recent_failures.len() - RECENT_FAILURE_CAP;
            self.recent_failures.drain(..excess);
        }
    }
}
