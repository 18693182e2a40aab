//! Per-item phase machine and the single-item driver.
//!
//! ```text
//! None -> Enriching -> AwaitingApproval -> Implementing -> Reviewing
//!   Reviewing -> AwaitingMerge -> Done
//!   Reviewing -> AddressingFeedback -> Reviewing   (at most max_fix_iterations times)
//! ```
//!
//! [`advance`] is the pure transition: given an item, the outcome of its last
//! worker and the policy, it mutates the item's phase, counters and checkpoint
//! and returns the next [`Step`]. [`apply`] carries a step out against the
//! tracker and the pool. The control loop and [`ItemDriver`] share both.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::Instrument;

use crate::errors::{PhaseError, SpawnError};
use crate::foreman_config::Mode;
use crate::orchestrator::shutdown::Shutdown;
use crate::orchestrator::state::{OrchestratorState, WarningKind};
use crate::pool::{Assignment, CompletionEvent, PoolManager};
use crate::tracker::models::advance_checkpoint;
use crate::tracker::{
    CheckpointRecord, CheckpointStage, LABEL_ABORT, MergeOutcome, Phase, PrimaryState,
    ReviewState, WorkItem,
};
use crate::worker::WorkerOutcome;

/// Policy inputs to a transition.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub mode: Mode,
    pub max_fix_iterations: u32,
    pub merge_conflict_retries: u32,
    /// Review state of the item's latest artifact, if any.
    pub artifact_state: Option<ReviewState>,
    pub artifact_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum PhaseEvent {
    WorkerFinished {
        phase: Phase,
        succeeded: bool,
        outcome: Option<WorkerOutcome>,
        stage: Option<CheckpointStage>,
        artifact_id: Option<String>,
        message: String,
    },
    MergeAttempted(MergeOutcome),
    ApprovalGranted,
}

impl PhaseEvent {
    pub fn from_completion(event: &CompletionEvent) -> Self {
        let record = event.record.as_ref();
        Self::WorkerFinished {
            phase: event.phase,
            succeeded: event.succeeded(),
            outcome: event.outcome(),
            stage: record.and_then(|r| r.stage),
            artifact_id: record.and_then(|r| r.artifact_id.clone()),
            message: event.failure_message(),
        }
    }
}

#[derive(Debug)]
pub enum Step {
    /// Launch the worker for this phase.
    Run(Phase),
    ParkForApproval,
    ParkForMerge,
    AttemptMerge,
    Finish,
    Block(PhaseError),
}

/// Phase a freshly claimed item starts (or resumes) in. Always one that runs a worker.
///
/// A Ready item parked at the approval gate got there by being approved, so
/// it resumes at implementation.
pub fn claim_phase(item: &WorkItem) -> Phase {
    match item.phase {
        Phase::None | Phase::Enriching | Phase::Done => Phase::Enriching,
        Phase::AwaitingApproval => Phase::Implementing,
        Phase::Implementing => {
            if item
                .checkpoint
                .as_ref()
                .is_some_and(|cp| cp.stage == CheckpointStage::ArtifactCreated)
            {
                Phase::Reviewing
            } else {
                Phase::Implementing
            }
        }
        Phase::Reviewing | Phase::AwaitingMerge => Phase::Reviewing,
        Phase::AddressingFeedback => Phase::AddressingFeedback,
    }
}

fn gate_open(item: &WorkItem, ctx: &PhaseContext) -> bool {
    ctx.mode == Mode::Aggressive || item.is_approved()
}

fn after_approval(item: &mut WorkItem) -> Step {
    item.fix_iterations = 0;
    item.merge_retries = 0;
    item.phase = Phase::Implementing;
    Step::Run(Phase::Implementing)
}

fn to_merge_gate(item: &mut WorkItem, ctx: &PhaseContext) -> Step {
    item.phase = Phase::AwaitingMerge;
    match ctx.mode {
        Mode::Aggressive => Step::AttemptMerge,
        Mode::Normal => Step::ParkForMerge,
    }
}

/// Pure transition. Mutates `item` (phase, counters, checkpoint) and returns
/// the next step.
pub fn advance(item: &mut WorkItem, ctx: &PhaseContext, event: PhaseEvent) -> Step {
    match event {
        PhaseEvent::ApprovalGranted => {
            if item.phase != Phase::AwaitingApproval {
                return Step::Block(PhaseError::InvalidTransition {
                    phase: item.phase,
                    event: "approval_granted".into(),
                });
            }
            after_approval(item)
        }

        PhaseEvent::MergeAttempted(outcome) => match outcome {
            MergeOutcome::Merged => {
                item.phase = Phase::Done;
                Step::Finish
            }
            MergeOutcome::Conflict(reason) => {
                if item.merge_retries < ctx.merge_conflict_retries {
                    item.merge_retries += 1;
                    item.phase = Phase::AwaitingMerge;
                    Step::Run(Phase::AwaitingMerge)
                } else {
                    Step::Block(PhaseError::WorkerFailure {
                        item: item.id.clone(),
                        phase: Phase::AwaitingMerge,
                        message: format!("merge conflict persists: {}", reason),
                    })
                }
            }
        },

        PhaseEvent::WorkerFinished {
            phase,
            succeeded,
            outcome,
            stage,
            artifact_id,
            message,
        } => {
            if phase != item.phase {
                return Step::Block(PhaseError::InvalidTransition {
                    phase: item.phase,
                    event: format!("{} worker finished", phase),
                });
            }

            if let Some(stage) = stage {
                let mut record = CheckpointRecord::new(stage);
                if let Some(id) = &artifact_id {
                    record = record.with_metadata("artifact_id", id.clone());
                }
                advance_checkpoint(&mut item.checkpoint, record);
            }

            if !succeeded {
                return Step::Block(PhaseError::WorkerFailure {
                    item: item.id.clone(),
                    phase,
                    message,
                });
            }
            if outcome == Some(WorkerOutcome::NoOp) {
                item.phase = Phase::Done;
                return Step::Finish;
            }

            match phase {
                Phase::Enriching => {
                    if gate_open(item, ctx) {
                        after_approval(item)
                    } else {
                        item.phase = Phase::AwaitingApproval;
                        Step::ParkForApproval
                    }
                }
                Phase::Implementing => {
                    let Some(id) = artifact_id.or_else(|| ctx.artifact_id.clone()) else {
                        return Step::Block(PhaseError::WorkerFailure {
                            item: item.id.clone(),
                            phase,
                            message: "implementation finished without a change artifact".into(),
                        });
                    };
                    advance_checkpoint(
                        &mut item.checkpoint,
                        CheckpointRecord::new(CheckpointStage::ArtifactCreated)
                            .with_metadata("artifact_id", id),
                    );
                    item.phase = Phase::Reviewing;
                    Step::Run(Phase::Reviewing)
                }
                Phase::Reviewing => {
                    let verdict = match outcome {
                        Some(WorkerOutcome::Approved) => Some(ReviewState::Approved),
                        Some(WorkerOutcome::ChangesRequested) => Some(ReviewState::ChangesRequested),
                        _ => ctx.artifact_state,
                    };
                    match verdict {
                        Some(ReviewState::Approved) => to_merge_gate(item, ctx),
                        Some(ReviewState::Merged) => {
                            item.phase = Phase::Done;
                            Step::Finish
                        }
                        Some(ReviewState::ChangesRequested) => {
                            if item.fix_iterations >= ctx.max_fix_iterations {
                                Step::Block(PhaseError::CycleExhausted {
                                    item: item.id.clone(),
                                    iterations: item.fix_iterations,
                                })
                            } else {
                                item.fix_iterations += 1;
                                item.phase = Phase::AddressingFeedback;
                                Step::Run(Phase::AddressingFeedback)
                            }
                        }
                        Some(ReviewState::Closed) => Step::Block(PhaseError::WorkerFailure {
                            item: item.id.clone(),
                            phase,
                            message: "change artifact was closed during review".into(),
                        }),
                        Some(ReviewState::AwaitingReview) | None => {
                            Step::Block(PhaseError::WorkerFailure {
                                item: item.id.clone(),
                                phase,
                                message: "review finished without a verdict".into(),
                            })
                        }
                    }
                }
                Phase::AddressingFeedback => {
                    item.phase = Phase::Reviewing;
                    Step::Run(Phase::Reviewing)
                }
                // The conflict-resolution worker finished; try the merge again.
                Phase::AwaitingMerge => Step::AttemptMerge,
                Phase::None | Phase::AwaitingApproval | Phase::Done => {
                    Step::Block(PhaseError::InvalidTransition {
                        phase,
                        event: "worker_finished".into(),
                    })
                }
            }
        }
    }
}

/// Where an item came to rest after [`apply`].
#[derive(Debug)]
pub enum Settled {
    Launched(Assignment),
    AwaitingApproval,
    AwaitingMerge,
    Closed,
    Blocked(String),
    /// The next worker could not start. The pool already reverted or blocked the item.
    LaunchFailed(SpawnError),
}

pub async fn build_context(
    pool: &PoolManager,
    item: &WorkItem,
    mode: Mode,
) -> Result<PhaseContext> {
    let artifact = pool.tracker().artifact_for_item(&item.id).await?;
    Ok(PhaseContext {
        mode,
        max_fix_iterations: pool.limits().max_fix_iterations,
        merge_conflict_retries: pool.limits().merge_conflict_retries,
        artifact_state: artifact.as_ref().map(|a| a.review_state),
        artifact_id: artifact.map(|a| a.id),
    })
}

/// Carry out `step` for an item the caller holds InProgress.
pub async fn apply(
    pool: &PoolManager,
    state: &mut OrchestratorState,
    item: &mut WorkItem,
    mut step: Step,
    ctx: &PhaseContext,
    now: DateTime<Utc>,
) -> Result<Settled> {
    let tracker = pool.tracker().clone();
    loop {
        tracing::debug!(item_id = %item.id, phase = %item.phase, step = ?step, "Applying step");
        match step {
            Step::Run(phase) => {
                return match pool.launch(state, item, phase, now).await {
                    Ok(assignment) => Ok(Settled::Launched(assignment)),
                    Err(e @ SpawnError::Launch { .. }) => Ok(Settled::LaunchFailed(e)),
                    Err(SpawnError::Tracker(e)) => Err(e),
                    Err(e) => Ok(Settled::LaunchFailed(e)),
                };
            }
            Step::ParkForApproval => {
                tracker.save_progress(item).await?;
                tracker
                    .compare_and_set_state(&item.id, PrimaryState::InProgress, PrimaryState::Curated)
                    .await?;
                tracker
                    .add_comment(
                        &item.id,
                        "foreman: enrichment done; waiting for approval (add the `approved` label)",
                    )
                    .await?;
                tracing::info!(item_id = %item.id, "Parked awaiting approval");
                return Ok(Settled::AwaitingApproval);
            }
            Step::ParkForMerge => {
                tracker.save_progress(item).await?;
                tracker
                    .add_comment(&item.id, "foreman: review approved; ready to merge")
                    .await?;
                tracing::info!(item_id = %item.id, "Ready to merge; waiting for a human");
                return Ok(Settled::AwaitingMerge);
            }
            Step::AttemptMerge => {
                tracker.save_progress(item).await?;
                let artifact = tracker.artifact_for_item(&item.id).await?;
                let outcome = match artifact {
                    Some(a) => match tracker.merge_artifact(&a.id).await {
                        Ok(outcome) => outcome,
                        Err(e) => MergeOutcome::Conflict(format!("{:#}", e)),
                    },
                    None => MergeOutcome::Conflict("no change artifact to merge".into()),
                };
                tracing::info!(item_id = %item.id, outcome = ?outcome, "Merge attempted");
                step = advance(item, ctx, PhaseEvent::MergeAttempted(outcome));
            }
            Step::Finish => {
                item.phase = Phase::Done;
                tracker.save_progress(item).await?;
                tracker
                    .compare_and_set_state(&item.id, PrimaryState::InProgress, PrimaryState::Closed)
                    .await?;
                tracker.add_comment(&item.id, "foreman: done").await?;
                state.retry_queue.remove(&item.id);
                tracing::info!(item_id = %item.id, "Item closed");
                return Ok(Settled::Closed);
            }
            Step::Block(err) => {
                let note = format!("foreman: blocked: {}", err);
                tracker.save_progress(item).await?;
                tracker
                    .compare_and_set_state(&item.id, PrimaryState::InProgress, PrimaryState::Blocked)
                    .await?;
                tracker.add_comment(&item.id, &note).await?;
                match &err {
                    PhaseError::CycleExhausted { .. } => {
                        state.warn(WarningKind::CycleExhausted, Some(&item.id), note.clone(), now)
                    }
                    PhaseError::WorkerFailure { message, .. } => {
                        state.record_failure(&item.id, message, now)
                    }
                    PhaseError::InvalidTransition { .. } => {}
                }
                tracing::warn!(item_id = %item.id, error = %err, "Item blocked");
                return Ok(Settled::Blocked(err.to_string()));
            }
        }
    }
}

/// What a finished worker leads to once its slot is released.
#[derive(Debug)]
pub enum Resolution {
    Advance(WorkItem, Step),
    /// Abort requested; the item went back to Ready.
    Aborted,
    /// Someone else moved the item while its worker ran.
    Moved(PrimaryState),
    /// The worker died without a report. The failure was counted and the item
    /// went back to Ready, or to Blocked once the limit was reached.
    Crashed { blocked: bool, message: String },
    Missing,
}

/// Release the completed slot, re-verify the item and compute its next step.
pub async fn resolve_completion(
    pool: &PoolManager,
    state: &mut OrchestratorState,
    event: &CompletionEvent,
    mode: Mode,
) -> Result<(Resolution, PhaseContext)> {
    let cancel_requested = state
        .worker_slots
        .get(event.slot_id)
        .is_some_and(|s| s.cancel_requested);
    pool.release(state, event.slot_id).await;

    let tracker = pool.tracker().clone();
    let Some(mut item) = tracker.get_item(&event.item_id).await? else {
        tracing::warn!(item_id = %event.item_id, "Item vanished while its worker ran");
        let ctx = PhaseContext {
            mode,
            max_fix_iterations: pool.limits().max_fix_iterations,
            merge_conflict_retries: pool.limits().merge_conflict_retries,
            artifact_state: None,
            artifact_id: None,
        };
        return Ok((Resolution::Missing, ctx));
    };
    let ctx = build_context(pool, &item, mode).await?;

    if item.primary_state != PrimaryState::InProgress {
        tracing::warn!(item_id = %item.id, state = %item.primary_state, "Item moved externally; dropping worker result");
        return Ok((Resolution::Moved(item.primary_state), ctx));
    }

    let event_phase = PhaseEvent::from_completion(event);
    if cancel_requested || item.abort_requested() {
        // Keep what the worker reached so the next claim resumes from it.
        if let PhaseEvent::WorkerFinished {
            stage: Some(stage), ..
        } = &event_phase
        {
            advance_checkpoint(&mut item.checkpoint, CheckpointRecord::new(*stage));
            tracker.save_progress(&item).await?;
        }
        abort_item(pool, &item.id, "abort requested").await?;
        return Ok((Resolution::Aborted, ctx));
    }

    // The checkpoint in the tracker is untouched, so the next claim resumes from it.
    if event.crashed() {
        let message = event.failure_message();
        let error = anyhow::anyhow!(message.clone());
        let blocked = pool
            .record_failure(state, &item.id, &error, Utc::now())
            .await?;
        if !blocked {
            tracker
                .add_comment(
                    &item.id,
                    &format!("foreman: returned to ready ({} during {})", message, event.phase),
                )
                .await?;
        }
        return Ok((Resolution::Crashed { blocked, message }, ctx));
    }
    if event.reported() && event.succeeded() {
        state.retry_queue.remove(&item.id);
    }

    let step = advance(&mut item, &ctx, event_phase);
    Ok((Resolution::Advance(item, step), ctx))
}

/// Return an InProgress item to Ready and clear its abort label.
pub async fn abort_item(pool: &PoolManager, item_id: &str, reason: &str) -> Result<bool> {
    let tracker = pool.tracker();
    let reverted = pool.revert_claim(item_id).await?;
    tracker.remove_label(item_id, LABEL_ABORT).await?;
    if reverted {
        tracker
            .add_comment(item_id, &format!("foreman: returned to ready ({})", reason))
            .await?;
        tracing::info!(item_id, reason, "Item returned to Ready");
    }
    Ok(reverted)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    Closed,
    Blocked(String),
    ParkedForApproval,
    ParkedForMerge,
    Aborted,
    /// Shutdown requested; the item went back to Ready.
    Interrupted,
    /// The worker died without reporting; the item went back to Ready.
    Requeued(String),
    NotStarted(String),
    Moved(PrimaryState),
}

/// How the driver's approval wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApprovalWait {
    Approved,
    TimedOut,
    Aborted,
    Interrupted,
    Missing,
}

/// Drives a single item through its phases synchronously, with bounded
/// poll-and-sleep waits that watch the STOP marker and the abort label.
pub struct ItemDriver<'a> {
    pool: &'a PoolManager,
    shutdown: &'a Shutdown,
    mode: Mode,
    poll_interval: Duration,
    approval_wait: Duration,
    grace: Duration,
    /// Emit a heartbeat log every this many polls.
    heartbeat_every: u32,
}

impl<'a> ItemDriver<'a> {
    pub fn new(pool: &'a PoolManager, shutdown: &'a Shutdown, mode: Mode) -> Self {
        Self {
            pool,
            shutdown,
            mode,
            poll_interval: Duration::from_secs(5),
            approval_wait: Duration::from_secs(300),
            grace: Duration::from_secs(60),
            heartbeat_every: 6,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_approval_wait(mut self, wait: Duration) -> Self {
        self.approval_wait = wait;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub async fn drive(&self, item_id: &str) -> Result<DriveOutcome> {
        let mut state = OrchestratorState::new(
            format!("drive-{}", uuid::Uuid::new_v4()),
            self.mode,
            1,
        );

        let mut assignment = match self
            .pool
            .claim_and_spawn(&mut state, item_id, Utc::now())
            .await
        {
            Ok(a) => a,
            Err(SpawnError::Tracker(e)) => return Err(e),
            Err(e) => return Ok(DriveOutcome::NotStarted(e.to_string())),
        };

        loop {
            let span = crate::logging::item_span(item_id, assignment.phase.as_str());
            let Some(event) = self
                .wait_for_completion(&mut state, &assignment)
                .instrument(span)
                .await?
            else {
                return Ok(DriveOutcome::Interrupted);
            };

            let (resolution, ctx) =
                resolve_completion(self.pool, &mut state, &event, self.mode).await?;
            let (mut item, mut step) = match resolution {
                Resolution::Advance(item, step) => (item, step),
                Resolution::Aborted => return Ok(DriveOutcome::Aborted),
                Resolution::Moved(s) => return Ok(DriveOutcome::Moved(s)),
                Resolution::Crashed { blocked: true, message } => {
                    return Ok(DriveOutcome::Blocked(message));
                }
                Resolution::Crashed { message, .. } => return Ok(DriveOutcome::Requeued(message)),
                Resolution::Missing => {
                    return Ok(DriveOutcome::NotStarted("item disappeared".into()));
                }
            };

            if matches!(step, Step::ParkForApproval) {
                match self.wait_for_approval(&item.id).await? {
                    ApprovalWait::Approved => {
                        step = advance(&mut item, &ctx, PhaseEvent::ApprovalGranted);
                    }
                    ApprovalWait::TimedOut => {}
                    ApprovalWait::Aborted => {
                        abort_item(self.pool, &item.id, "abort requested").await?;
                        return Ok(DriveOutcome::Aborted);
                    }
                    ApprovalWait::Interrupted => {
                        abort_item(self.pool, &item.id, "interrupted").await?;
                        return Ok(DriveOutcome::Interrupted);
                    }
                    ApprovalWait::Missing => {
                        return Ok(DriveOutcome::NotStarted("item disappeared".into()));
                    }
                }
            }

            match apply(self.pool, &mut state, &mut item, step, &ctx, Utc::now()).await? {
                Settled::Launched(next) => assignment = next,
                Settled::AwaitingApproval => return Ok(DriveOutcome::ParkedForApproval),
                Settled::AwaitingMerge => return Ok(DriveOutcome::ParkedForMerge),
                Settled::Closed => return Ok(DriveOutcome::Closed),
                Settled::Blocked(reason) => return Ok(DriveOutcome::Blocked(reason)),
                Settled::LaunchFailed(e) => return Ok(DriveOutcome::NotStarted(e.to_string())),
            }
        }
    }

    /// Poll until the worker finishes. On shutdown or abort, give the worker
    /// the grace period to reach its boundary, then stop it and return `None`.
    async fn wait_for_completion(
        &self,
        state: &mut OrchestratorState,
        assignment: &Assignment,
    ) -> Result<Option<CompletionEvent>> {
        let started = tokio::time::Instant::now();
        let mut polls: u32 = 0;
        let mut cancel_deadline: Option<tokio::time::Instant> = None;

        loop {
            let mut events = self.pool.poll_completions(state).await;
            if let Some(pos) = events.iter().position(|e| e.slot_id == assignment.slot_id) {
                return Ok(Some(events.swap_remove(pos)));
            }

            polls += 1;
            if self.heartbeat_every > 0 && polls % self.heartbeat_every == 0 {
                tracing::info!(
                    item_id = %assignment.item_id,
                    phase = %assignment.phase,
                    elapsed_secs = started.elapsed().as_secs(),
                    "Still waiting on worker"
                );
            }

            if cancel_deadline.is_none() {
                let aborted = self
                    .pool
                    .tracker()
                    .get_item(&assignment.item_id)
                    .await?
                    .is_some_and(|i| i.abort_requested());
                if self.shutdown.is_requested() || aborted {
                    tracing::warn!(item_id = %assignment.item_id, "Cancellation requested; waiting for worker to reach a boundary");
                    if let Some(slot) = state.worker_slots.get_mut(assignment.slot_id) {
                        slot.cancel_requested = true;
                    }
                    cancel_deadline = Some(tokio::time::Instant::now() + self.grace);
                }
            }

            if let Some(deadline) = cancel_deadline
                && tokio::time::Instant::now() >= deadline
            {
                tracing::warn!(item_id = %assignment.item_id, "Grace period over; stopping worker");
                self.pool.release(state, assignment.slot_id).await;
                abort_item(self.pool, &assignment.item_id, "interrupted").await?;
                return Ok(None);
            }

            // While cancelling, poll without treating shutdown as a wake-up.
            if cancel_deadline.is_some() {
                tokio::time::sleep(self.poll_interval).await;
            } else {
                self.shutdown.sleep(self.poll_interval).await;
            }
        }
    }

    /// Bounded wait for the `approved` label.
    async fn wait_for_approval(&self, item_id: &str) -> Result<ApprovalWait> {
        if self.approval_wait.is_zero() {
            return Ok(ApprovalWait::TimedOut);
        }
        tracing::info!(item_id, wait_secs = self.approval_wait.as_secs(), "Waiting for approval");
        let deadline = tokio::time::Instant::now() + self.approval_wait;
        loop {
            match self.pool.tracker().get_item(item_id).await? {
                Some(item) if item.is_approved() => return Ok(ApprovalWait::Approved),
                Some(item) if item.abort_requested() => return Ok(ApprovalWait::Aborted),
                None => return Ok(ApprovalWait::Missing),
                Some(_) => {}
            }
            if self.shutdown.is_requested() {
                return Ok(ApprovalWait::Interrupted);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(ApprovalWait::TimedOut);
            }
            self.shutdown.sleep(self.poll_interval).await;
        }
    }
}
