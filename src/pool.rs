//! Worker pool: claims items, launches their workers into bounded slots,
//! detects completion, and applies the spawn retry/circuit-breaker policy.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::errors::SpawnError;
use crate::foreman_config::LimitsSection;
use crate::orchestrator::state::{OrchestratorState, RetryInfo, WarningKind};
use crate::tracker::{Phase, PrimaryState, Tracker, WorkItem};
use crate::worker::{
    ProgressRecord, ProgressStatus, ProgressStore, SpawnRequest, WorkerHandle, WorkerHost,
    WorkerOutcome,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub slot_id: usize,
    pub item_id: String,
    pub handle: WorkerHandle,
    pub phase: Phase,
}

/// A working slot whose worker is done, by exit or by its own report.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub slot_id: usize,
    pub item_id: String,
    pub phase: Phase,
    pub exit_code: Option<i32>,
    pub record: Option<ProgressRecord>,
    /// Process was still running when the progress record reported completion.
    pub still_alive: bool,
}

impl CompletionEvent {
    /// The worker wrote a finished progress record.
    pub fn reported(&self) -> bool {
        self.record.as_ref().is_some_and(|r| r.status.is_finished())
    }

    /// The process is gone without a report and without a clean exit.
    pub fn crashed(&self) -> bool {
        !self.reported() && !self.still_alive && self.exit_code != Some(0)
    }

    /// A finished progress record decides. Without one, a clean exit counts
    /// as success.
    pub fn succeeded(&self) -> bool {
        match &self.record {
            Some(r) if r.status.is_finished() => r.status == ProgressStatus::Completed,
            _ => self.exit_code == Some(0),
        }
    }

    pub fn outcome(&self) -> Option<WorkerOutcome> {
        self.record.as_ref().and_then(|r| r.outcome)
    }

    pub fn failure_message(&self) -> String {
        if let Some(msg) = self.record.as_ref().and_then(|r| r.message.clone()) {
            return msg;
        }
        match self.exit_code {
            Some(code) => format!("worker exited with code {}", code),
            None => "worker disappeared without reporting".to_string(),
        }
    }
}

pub struct PoolManager {
    tracker: Arc<dyn Tracker>,
    host: Arc<dyn WorkerHost>,
    progress: ProgressStore,
    limits: LimitsSection,
    workdir: PathBuf,
}

impl PoolManager {
    pub fn new(
        tracker: Arc<dyn Tracker>,
        host: Arc<dyn WorkerHost>,
        progress: ProgressStore,
        limits: LimitsSection,
        workdir: PathBuf,
    ) -> Self {
        Self {
            tracker,
            host,
            progress,
            limits,
            workdir,
        }
    }

    pub fn tracker(&self) -> &Arc<dyn Tracker> {
        &self.tracker
    }

    pub fn host(&self) -> &Arc<dyn WorkerHost> {
        &self.host
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    pub fn limits(&self) -> &LimitsSection {
        &self.limits
    }

    /// Claim a Ready item (test-and-set at the tracker) and launch the worker
    /// for the phase it starts or resumes in.
    pub async fn claim_and_spawn(
        &self,
        state: &mut OrchestratorState,
        item_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Assignment, SpawnError> {
        if state.first_idle_slot().is_none() {
            return Err(SpawnError::PoolFull);
        }
        let item = self
            .tracker
            .get_item(item_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Item {} not found", item_id))?;
        if item.primary_state != PrimaryState::Ready {
            return Err(SpawnError::NotClaimable {
                item: item.id,
                state: item.primary_state,
            });
        }
        if !self
            .tracker
            .compare_and_set_state(item_id, PrimaryState::Ready, PrimaryState::InProgress)
            .await?
        {
            tracing::info!(item_id, "Claim lost to another actor");
            return Err(SpawnError::ClaimLost {
                item: item_id.to_string(),
            });
        }
        tracing::info!(item_id, "Claimed item");

        let mut item = item;
        item.primary_state = PrimaryState::InProgress;
        let phase = crate::phase::claim_phase(&item);
        self.launch(state, &mut item, phase, now).await
    }

    /// Launch the worker for `phase` on an item we already hold InProgress.
    /// On failure the claim is reverted and the failure counted.
    pub async fn launch(
        &self,
        state: &mut OrchestratorState,
        item: &mut WorkItem,
        phase: Phase,
        now: DateTime<Utc>,
    ) -> Result<Assignment, SpawnError> {
        let Some(slot_id) = state.first_idle_slot() else {
            return Err(SpawnError::PoolFull);
        };
        let role = phase.worker_role().ok_or_else(|| {
            anyhow::anyhow!("Phase {} does not run a worker", phase)
        })?;

        item.phase = phase;
        self.tracker.save_progress(item).await?;

        let request = self.request_for(item, phase, role);
        if let Err(e) = self.progress.write(&ProgressRecord::running(&item.id, phase)) {
            tracing::warn!(item_id = %item.id, error = %e, "Failed to seed progress record");
        }

        match self.host.spawn(&request).await {
            Ok(handle) => {
                state.worker_slots[slot_id].assign(&item.id, handle.clone(), phase, now);
                tracing::info!(item_id = %item.id, slot = slot_id, phase = %phase, handle = %handle, "Worker started");
                Ok(Assignment {
                    slot_id,
                    item_id: item.id.clone(),
                    handle,
                    phase,
                })
            }
            Err(source) => {
                if let Err(e) = self.progress.remove(&item.id) {
                    tracing::warn!(item_id = %item.id, error = %e, "Failed to remove progress record");
                }
                self.record_failure(state, &item.id, &source, now).await?;
                Err(SpawnError::Launch {
                    role: role.to_string(),
                    source,
                })
            }
        }
    }

    fn request_for(&self, item: &WorkItem, phase: Phase, role: &str) -> SpawnRequest {
        let mut request = SpawnRequest::for_item(role, &item.id)
            .with_workdir(self.workdir.clone())
            .with_env("FOREMAN_PHASE", phase.as_str())
            .with_env(
                "FOREMAN_PROGRESS_FILE",
                self.progress.path_for(&item.id).to_string_lossy(),
            );
        if phase == Phase::Implementing
            && let Some(next) = item.checkpoint.as_ref().and_then(|cp| cp.stage.next())
        {
            request = request.with_env("FOREMAN_RESUME_FROM", next.as_str());
        }
        request
    }

    /// Revert the claim and count the failure; block the item at the limit.
    /// Failed launches and crashed workers share the count, which is cleared
    /// once a worker reports success or the item closes. True if the item
    /// is now blocked.
    pub async fn record_failure(
        &self,
        state: &mut OrchestratorState,
        item_id: &str,
        error: &anyhow::Error,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let message = format!("{:#}", error);
        let entry = state
            .retry_queue
            .entry(item_id.to_string())
            .or_insert_with(|| RetryInfo {
                item_id: item_id.to_string(),
                failure_count: 0,
                last_error: String::new(),
                last_attempt: now,
                exhausted: false,
            });
        entry.failure_count += 1;
        entry.last_error = message.clone();
        entry.last_attempt = now;
        let count = entry.failure_count;
        state.record_failure(item_id, &message, now);

        if count >= self.limits.max_failures {
            if let Some(retry) = state.retry_queue.get_mut(item_id) {
                retry.exhausted = true;
            }
            let blocked = self
                .tracker
                .compare_and_set_state(item_id, PrimaryState::InProgress, PrimaryState::Blocked)
                .await?;
            let note = format!(
                "foreman: blocked after {} failed worker attempts. Last error: {}",
                count, message
            );
            self.tracker.add_comment(item_id, &note).await?;
            state.warn(WarningKind::RetryExhausted, Some(item_id), note, now);
            tracing::error!(item_id, failures = count, blocked, error = %message, "Worker retries exhausted; item blocked");
            Ok(true)
        } else {
            self.tracker
                .compare_and_set_state(item_id, PrimaryState::InProgress, PrimaryState::Ready)
                .await?;
            tracing::warn!(item_id, failures = count, error = %message, "Worker failed; item returned to Ready");
            Ok(false)
        }
    }

    /// Non-blocking check of every working slot.
    pub async fn poll_completions(&self, state: &mut OrchestratorState) -> Vec<CompletionEvent> {
        let mut events = Vec::new();
        for slot in state.worker_slots.iter_mut().filter(|s| s.is_working()) {
            let (Some(item_id), Some(phase)) = (slot.assigned_item_id.clone(), slot.phase) else {
                continue;
            };
            let handle = slot
                .session_handle
                .clone()
                .unwrap_or_else(|| WorkerHandle::from_raw(""));

            let record = match self.progress.read(&item_id) {
                Ok(record) => record.filter(|r| r.phase == phase),
                Err(e) => {
                    tracing::warn!(item_id = %item_id, error = %e, "Unreadable progress record");
                    None
                }
            };
            if let Some(r) = &record {
                slot.last_heartbeat = Some(r.heartbeat);
            }

            let reported = record.as_ref().is_some_and(|r| r.status.is_finished());
            let alive = self.host.is_alive(&handle).await;
            if reported || !alive {
                let exit_code = if alive {
                    None
                } else {
                    self.host.exit_code(&handle).await
                };
                if reported && alive {
                    tracing::debug!(item_id = %item_id, handle = %handle, "Worker reported completion but is still running");
                }
                events.push(CompletionEvent {
                    slot_id: slot.slot_id,
                    item_id,
                    phase,
                    exit_code,
                    record,
                    still_alive: alive,
                });
            }
        }
        events
    }

    /// Return a slot to Idle, stopping its worker and dropping its progress record.
    pub async fn release(&self, state: &mut OrchestratorState, slot_id: usize) {
        let Some(slot) = state.worker_slots.get_mut(slot_id) else {
            return;
        };
        if let Some(handle) = slot.session_handle.take()
            && handle.is_well_formed()
            && self.host.is_alive(&handle).await
            && let Err(e) = self.host.destroy(&handle).await
        {
            tracing::warn!(slot = slot_id, handle = %handle, error = %e, "Failed to stop worker on release");
        }
        if let Some(item_id) = slot.assigned_item_id.as_deref()
            && let Err(e) = self.progress.remove(item_id)
        {
            tracing::warn!(item_id, error = %e, "Failed to remove progress record");
        }
        slot.clear();
    }

    /// Put an InProgress item back in the claimable pool.
    pub async fn revert_claim(&self, item_id: &str) -> anyhow::Result<bool> {
        self.tracker
            .compare_and_set_state(item_id, PrimaryState::InProgress, PrimaryState::Ready)
            .await
    }
}
