//! The control loop.
//!
//! One iteration: snapshot, drain signals, settle finished workers, act on
//! the snapshot's recommendations, tick support roles, sweep for orphans
//! when due, then commit state through the split-brain guard. The loop never
//! waits on a worker; it polls and sleeps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::Instrument;

use crate::config::Config;
use crate::errors::{OrchestratorError, SpawnError};
use crate::foreman_config::HealthSection;
use crate::orchestrator::guard::StateStore;
use crate::orchestrator::shutdown::Shutdown;
use crate::orchestrator::state::{OrchestratorState, WarningKind, WorkerSlot};
use crate::phase::{self, Resolution, Settled, Step};
use crate::pool::{CompletionEvent, PoolManager};
use crate::recovery;
use crate::roles::RoleScheduler;
use crate::signals::{self, Mailbox};
use crate::snapshot::{self, Action, Policy};
use crate::tracker::{Phase, PrimaryState, Tracker};
use crate::worker::{ProgressStore, WorkerHost};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// STOP marker, Ctrl-C or a shutdown signal.
    Shutdown,
    /// `max_iterations` reached. Workers keep running and are adopted by the next run.
    IterationCap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub reason: StopReason,
    /// Slots still working when the shutdown grace period ran out.
    pub unresolved: Vec<String>,
}

pub struct Orchestrator {
    pool: PoolManager,
    roles: RoleScheduler,
    mailbox: Mailbox,
    shutdown: Shutdown,
    store: StateStore,
    state: OrchestratorState,
    /// Working slots that no longer fit under `max_workers`; stopped at startup.
    surplus: Vec<WorkerSlot>,
    policy: Policy,
    health: HealthSection,
    poll_interval: Duration,
    grace: Duration,
    max_iterations: Option<u64>,
}

impl Orchestrator {
    /// Take ownership of the state file and wire the components together.
    pub fn new(
        config: &Config,
        tracker: Arc<dyn Tracker>,
        host: Arc<dyn WorkerHost>,
        shutdown: Shutdown,
    ) -> Result<Self, OrchestratorError> {
        let settings = config.settings();
        let (store, state, surplus) =
            StateStore::acquire(&config.state_file, config.mode, config.max_workers)?;
        tracing::info!(
            session = %store.token(),
            max_workers = config.max_workers,
            mode = ?config.mode,
            "Orchestrator session started"
        );

        let pool = PoolManager::new(
            tracker,
            host.clone(),
            ProgressStore::new(config.progress_dir.clone()),
            settings.limits.clone(),
            config.worker_workdir(),
        );
        let roles = RoleScheduler::new(host, settings.roles.clone(), config.worker_workdir());

        Ok(Self {
            pool,
            roles,
            mailbox: Mailbox::new(config.signals_dir.clone()),
            shutdown,
            store,
            state,
            surplus,
            policy: Policy::from_settings(settings),
            health: settings.health.clone(),
            poll_interval: Duration::from_secs(settings.orchestrator.poll_interval_secs),
            grace: Duration::from_secs(settings.orchestrator.shutdown_grace_secs),
            max_iterations: config.max_iterations,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub fn session_token(&self) -> &str {
        self.store.token()
    }

    /// Run until shutdown or the iteration cap. Only a lost state file
    /// (`StaleOwnership`) ends the loop with an error.
    pub async fn run(&mut self) -> Result<RunSummary, OrchestratorError> {
        self.startup_recovery().await;
        self.commit()?;

        let mut iterations = 0u64;
        let reason = loop {
            if self.shutdown.is_requested() {
                break StopReason::Shutdown;
            }
            if self.max_iterations.is_some_and(|max| iterations >= max) {
                break StopReason::IterationCap;
            }

            iterations += 1;
            let span = crate::logging::iteration_span(self.state.iteration_count + 1);
            self.iteration().instrument(span).await?;

            if self.max_iterations.is_some_and(|max| iterations >= max) {
                continue;
            }
            self.shutdown.sleep(self.poll_interval).await;
        };

        let unresolved = match reason {
            StopReason::Shutdown => self.drain_for_shutdown().await?,
            StopReason::IterationCap => {
                tracing::info!(iterations, working = self.state.working_count(), "Iteration cap reached");
                Vec::new()
            }
        };
        Ok(RunSummary {
            iterations,
            reason,
            unresolved,
        })
    }

    /// One pass of the loop.
    pub async fn iteration(&mut self) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        self.state.iteration_count += 1;

        let snapshot = match snapshot::assemble(self.pool.tracker().as_ref(), &self.state, now).await {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "Snapshot failed; settling workers only");
                None
            }
        };

        let messages = match self.mailbox.drain() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "Failed to read signal directory");
                Vec::new()
            }
        };
        let effects =
            signals::dispatch(&self.pool, &mut self.state, &self.shutdown, messages).await;

        for event in self.pool.poll_completions(&mut self.state).await {
            self.settle(event, now).await;
        }

        if !self.shutdown.is_requested() {
            for item_id in &effects.claims {
                if !self.claim(item_id, now).await {
                    break;
                }
            }
        }

        let mut demands = effects.role_demands.clone();
        let mut run_recovery = false;
        let actions = snapshot
            .as_ref()
            .map(|s| snapshot::recommend(s, &self.policy))
            .unwrap_or_default();
        for action in actions {
            match action {
                Action::SpawnWorkers { item_ids } => {
                    if self.shutdown.is_requested() {
                        continue;
                    }
                    for item_id in item_ids {
                        if !self.claim(&item_id, now).await {
                            break;
                        }
                    }
                }
                Action::TriggerRole { role } => {
                    if !demands.contains(&role) {
                        demands.push(role);
                    }
                }
                Action::PromoteApproved { item_id } => self.promote_approved(&item_id).await,
                Action::FinalizeMerged { item_id } => {
                    self.settle_parked(&item_id, Step::Finish, now).await
                }
                Action::AttemptMerge { item_id } => {
                    self.settle_parked(&item_id, Step::AttemptMerge, now).await
                }
                Action::RunRecovery => run_recovery = true,
            }
        }
        for item_id in &effects.merges {
            self.settle_parked(item_id, Step::AttemptMerge, now).await;
        }

        if !self.shutdown.is_requested() {
            self.roles.poll(&mut self.state, now).await;
            self.roles.tick(&mut self.state, &demands, now).await;
        }

        if run_recovery {
            self.sweep(now).await;
        }

        tracing::debug!(
            working = self.state.working_count(),
            idle = self.state.idle_count(),
            retrying = self.state.retry_queue.len(),
            warnings = self.state.warnings.len(),
            "Iteration complete"
        );
        self.commit()
    }

    /// Claim one item. False when no slot is left this iteration.
    async fn claim(&mut self, item_id: &str, now: DateTime<Utc>) -> bool {
        match self.pool.claim_and_spawn(&mut self.state, item_id, now).await {
            Ok(assignment) => {
                tracing::debug!(item_id, slot = assignment.slot_id, "Claim succeeded");
                true
            }
            Err(SpawnError::PoolFull) => false,
            Err(e @ (SpawnError::ClaimLost { .. } | SpawnError::NotClaimable { .. })) => {
                tracing::debug!(item_id, reason = %e, "Skipping claim");
                true
            }
            Err(e @ SpawnError::Launch { .. }) => {
                tracing::debug!(item_id, error = %e, "Launch failure recorded");
                true
            }
            Err(SpawnError::Tracker(e)) => {
                tracing::warn!(item_id, error = %format!("{:#}", e), "Tracker error during claim");
                true
            }
        }
    }

    /// Resolve a finished worker and carry its item to the next resting point.
    async fn settle(&mut self, event: CompletionEvent, now: DateTime<Utc>) {
        let span = crate::logging::item_span(&event.item_id, event.phase.as_str());
        let result = async {
            let mode = self.state.mode;
            let (resolution, ctx) =
                phase::resolve_completion(&self.pool, &mut self.state, &event, mode).await?;
            match resolution {
                Resolution::Advance(mut item, step) => {
                    let settled =
                        phase::apply(&self.pool, &mut self.state, &mut item, step, &ctx, now)
                            .await?;
                    log_settled(&item.id, &settled);
                }
                Resolution::Aborted => tracing::info!("Item aborted at phase boundary"),
                Resolution::Moved(state) => tracing::info!(state = %state, "Result dropped"),
                Resolution::Crashed { blocked, message } => {
                    tracing::warn!(blocked, error = %message, "Worker exited without reporting")
                }
                Resolution::Missing => {}
            }
            anyhow::Ok(())
        }
        .instrument(span)
        .await;
        if let Err(e) = result {
            tracing::warn!(item_id = %event.item_id, error = %format!("{:#}", e), "Failed to settle worker result");
        }
    }

    /// Apply `step` to an item parked InProgress at the merge gate.
    async fn settle_parked(&mut self, item_id: &str, step: Step, now: DateTime<Utc>) {
        let result = async {
            let Some(mut item) = self.pool.tracker().get_item(item_id).await? else {
                return anyhow::Ok(());
            };
            if item.primary_state != PrimaryState::InProgress
                || item.phase != Phase::AwaitingMerge
                || self.state.slot_for_item(item_id).is_some()
            {
                tracing::debug!(item_id, state = %item.primary_state, phase = %item.phase, "Not parked at merge gate; skipping");
                return Ok(());
            }
            let ctx = phase::build_context(&self.pool, &item, self.state.mode).await?;
            let settled =
                phase::apply(&self.pool, &mut self.state, &mut item, step, &ctx, now).await?;
            log_settled(item_id, &settled);
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(item_id, error = %format!("{:#}", e), "Failed to act on parked item");
        }
    }

    async fn promote_approved(&self, item_id: &str) {
        let tracker = self.pool.tracker();
        match tracker
            .compare_and_set_state(item_id, PrimaryState::Curated, PrimaryState::Ready)
            .await
        {
            Ok(true) => {
                tracing::info!(item_id, "Approved item returned to Ready");
                if let Err(e) = tracker
                    .add_comment(item_id, "foreman: approval seen; queued for implementation")
                    .await
                {
                    tracing::warn!(item_id, error = %e, "Failed to comment");
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(item_id, error = %format!("{:#}", e), "Failed to promote approved item"),
        }
    }

    async fn sweep(&mut self, now: DateTime<Utc>) {
        if let Err(e) = recovery::sweep(&self.pool, &self.health, &mut self.state, now).await {
            tracing::warn!(error = %format!("{:#}", e), "Recovery sweep failed");
        }
    }

    /// Reconcile state inherited from a previous session before acting on it.
    async fn startup_recovery(&mut self) {
        self.evict_surplus().await;
        let inherited = self.state.working_count();
        if inherited > 0 {
            tracing::info!(slots = inherited, "Adopting worker slots from previous session");
        }
        self.sweep(Utc::now()).await;
    }

    /// Stop the workers of slots dropped for a lowered `max_workers` and put
    /// their items back in the pool.
    async fn evict_surplus(&mut self) {
        for slot in std::mem::take(&mut self.surplus) {
            let Some(item_id) = slot.assigned_item_id else {
                continue;
            };
            if let Some(handle) = slot.session_handle.filter(|h| h.is_well_formed())
                && self.pool.host().is_alive(&handle).await
                && let Err(e) = self.pool.host().destroy(&handle).await
            {
                tracing::warn!(item_id = %item_id, handle = %handle, error = %e, "Failed to stop surplus worker");
            }
            if let Err(e) = self.pool.progress().remove(&item_id) {
                tracing::warn!(item_id = %item_id, error = %e, "Failed to remove progress record");
            }
            match phase::abort_item(&self.pool, &item_id, "worker limit lowered").await {
                Ok(_) => tracing::info!(item_id = %item_id, "Released slot over the worker limit"),
                Err(e) => {
                    tracing::warn!(item_id = %item_id, error = %format!("{:#}", e), "Failed to revert claim")
                }
            }
        }
    }

    fn commit(&mut self) -> Result<(), OrchestratorError> {
        match self.store.commit(&mut self.state) {
            Ok(()) => Ok(()),
            Err(e) if e.is_stale_ownership() => Err(e),
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist orchestrator state");
                Ok(())
            }
        }
    }

    /// Let running workers reach a phase boundary within the grace period;
    /// whatever they finish goes back to Ready. Anything still running after
    /// that is stopped and logged.
    async fn drain_for_shutdown(&mut self) -> Result<Vec<String>, OrchestratorError> {
        tracing::info!(
            working = self.state.working_count(),
            grace_secs = self.grace.as_secs(),
            "Shutting down"
        );
        for slot in self.state.worker_slots.iter_mut().filter(|s| s.is_working()) {
            slot.cancel_requested = true;
        }

        let deadline = tokio::time::Instant::now() + self.grace;
        while self.state.working_count() > 0 && tokio::time::Instant::now() < deadline {
            for event in self.pool.poll_completions(&mut self.state).await {
                self.settle(event, Utc::now()).await;
            }
            if self.state.working_count() == 0 {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(Duration::from_secs(1))).await;
        }

        let now = Utc::now();
        let mut unresolved = Vec::new();
        let leftover: Vec<(usize, String)> = self
            .state
            .worker_slots
            .iter()
            .filter(|s| s.is_working())
            .filter_map(|s| s.assigned_item_id.clone().map(|id| (s.slot_id, id)))
            .collect();
        for (slot_id, item_id) in leftover {
            tracing::warn!(slot = slot_id, item_id = %item_id, "Worker still running after grace period; stopping it");
            self.state.warn(
                WarningKind::UnresolvedSlot,
                Some(&item_id),
                format!("slot {} did not finish within the shutdown grace period", slot_id),
                now,
            );
            self.pool.release(&mut self.state, slot_id).await;
            if let Err(e) = phase::abort_item(&self.pool, &item_id, "shutdown").await {
                tracing::warn!(item_id = %item_id, error = %format!("{:#}", e), "Failed to revert claim");
            }
            unresolved.push(item_id);
        }

        self.roles.stop_all(&mut self.state).await;
        self.commit()?;
        tracing::info!(unresolved = unresolved.len(), "Shutdown complete");
        Ok(unresolved)
    }
}

fn log_settled(item_id: &str, settled: &Settled) {
    match settled {
        Settled::Launched(a) => {
            tracing::info!(item_id, phase = %a.phase, slot = a.slot_id, "Next phase started")
        }
        Settled::AwaitingApproval => tracing::info!(item_id, "Waiting for approval"),
        Settled::AwaitingMerge => tracing::info!(item_id, "Waiting at merge gate"),
        Settled::Closed => tracing::info!(item_id, "Closed"),
        Settled::Blocked(reason) => tracing::warn!(item_id, reason = %reason, "Blocked"),
        Settled::LaunchFailed(e) => tracing::warn!(item_id, error = %e, "Next phase failed to start"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{SignalAction, SignalMessage};
    use crate::tracker::{DbHandle, LABEL_APPROVED, TrackerDb};
    use crate::worker::fake::FakeHost;
    use crate::worker::{ProgressRecord, ProgressStatus, WorkerHandle, WorkerOutcome};
    use std::collections::BTreeSet;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        config: Config,
        db: DbHandle,
        host: Arc<FakeHost>,
    }

    fn fixture(toml: &str) -> Fixture {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".foreman")).unwrap();
        std::fs::write(dir.path().join(".foreman/foreman.toml"), toml).unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        config.ensure_directories().unwrap();
        Fixture {
            _dir: dir,
            config,
            db: DbHandle::new(TrackerDb::new_in_memory().unwrap()),
            host: Arc::new(FakeHost::new()),
        }
    }

    const QUIET: &str = r#"
[orchestrator]
max_workers = 2
poll_interval_secs = 0
shutdown_grace_secs = 0

[roles.proposer]
enabled = false

[roles.triage]
enabled = false

[roles.auditor]
enabled = false
"#;

    fn orchestrator(f: &Fixture) -> Orchestrator {
        Orchestrator::new(
            &f.config,
            Arc::new(f.db.clone()),
            f.host.clone(),
            Shutdown::new(f.config.stop_file.clone()),
        )
        .unwrap()
        .with_poll_interval(Duration::from_millis(5))
        .with_grace(Duration::from_millis(20))
    }

    fn add_ready(db: &DbHandle) -> String {
        db.lock_sync()
            .unwrap()
            .create_item("x", "", PrimaryState::Ready, 0, &BTreeSet::new())
            .unwrap()
            .id
    }

    fn complete(f: &Fixture, item_id: &str, phase: Phase, outcome: WorkerOutcome) {
        let store = ProgressStore::new(f.config.progress_dir.clone());
        let mut record = ProgressRecord::running(item_id, phase);
        record.status = ProgressStatus::Completed;
        record.outcome = Some(outcome);
        store.write(&record).unwrap();
    }

    fn working_handle(orch: &Orchestrator) -> WorkerHandle {
        orch.state()
            .worker_slots
            .iter()
            .find_map(|s| s.session_handle.clone())
            .unwrap()
    }

    fn no_backoff() -> String {
        format!("{}\n[limits]\nretry_backoff_secs = 0\n", QUIET)
    }

    #[tokio::test]
    async fn test_iteration_fills_free_slots_only() {
        let f = fixture(QUIET);
        let ids: Vec<String> = (0..3).map(|_| add_ready(&f.db)).collect();
        let mut orch = orchestrator(&f);

        orch.iteration().await.unwrap();
        assert_eq!(orch.state().working_count(), 2);
        assert_eq!(f.host.spawned().len(), 2);
        let third = f.db.get_item(&ids[2]).await.unwrap().unwrap();
        assert_eq!(third.primary_state, PrimaryState::Ready);

        let persisted = StateStore::load(&f.config.state_file).unwrap().unwrap();
        assert_eq!(persisted.session_token, orch.session_token());
        assert_eq!(persisted.working_count(), 2);
    }

    #[tokio::test]
    async fn test_enrichment_parks_item_for_approval() {
        let f = fixture(QUIET);
        let id = add_ready(&f.db);
        let mut orch = orchestrator(&f);
        orch.iteration().await.unwrap();

        complete(&f, &id, Phase::Enriching, WorkerOutcome::Success);
        orch.iteration().await.unwrap();
        let item = f.db.get_item(&id).await.unwrap().unwrap();
        assert_eq!(item.primary_state, PrimaryState::Curated);
        assert_eq!(item.phase, Phase::AwaitingApproval);
        assert_eq!(orch.state().working_count(), 0);

        // The approved label is noticed on the next snapshot.
        f.db.add_label(&id, LABEL_APPROVED).await.unwrap();
        orch.iteration().await.unwrap();
        orch.iteration().await.unwrap();
        let item = f.db.get_item(&id).await.unwrap().unwrap();
        assert_eq!(item.primary_state, PrimaryState::InProgress);
        assert_eq!(item.phase, Phase::Implementing);
        let roles: Vec<String> = f.host.spawned().into_iter().map(|r| r.role).collect();
        assert_eq!(roles, vec!["enrich", "implement"]);
    }

    #[tokio::test]
    async fn test_stale_writer_is_rejected_and_stops() {
        let f = fixture(QUIET);
        let mut orch = orchestrator(&f);
        orch.iteration().await.unwrap();

        // A second instance takes over the state file.
        let (newer, _, _) = StateStore::acquire(&f.config.state_file, f.config.mode, 2).unwrap();
        let err = orch.iteration().await.unwrap_err();
        assert!(err.is_stale_ownership());

        let persisted = StateStore::load(&f.config.state_file).unwrap().unwrap();
        assert_eq!(persisted.session_token, newer.token());
    }

    #[tokio::test]
    async fn test_shutdown_reverts_in_flight_claims() {
        let f = fixture(QUIET);
        let id = add_ready(&f.db);
        let mut orch = orchestrator(&f);
        orch.iteration().await.unwrap();
        assert_eq!(orch.state().working_count(), 1);

        crate::orchestrator::shutdown::request_stop(&f.config.stop_file, "test").unwrap();
        let summary = orch.run().await.unwrap();
        assert_eq!(summary.reason, StopReason::Shutdown);
        assert_eq!(summary.iterations, 0);
        assert_eq!(summary.unresolved, vec![id.clone()]);

        let item = f.db.get_item(&id).await.unwrap().unwrap();
        assert_eq!(item.primary_state, PrimaryState::Ready);
        assert_eq!(orch.state().working_count(), 0);
        assert!(
            orch.state()
                .warnings
                .iter()
                .any(|w| w.kind == WarningKind::UnresolvedSlot)
        );
    }

    #[tokio::test]
    async fn test_iteration_cap_leaves_workers_running() {
        let mut toml = QUIET.to_string();
        toml = toml.replace("shutdown_grace_secs = 0", "shutdown_grace_secs = 0\nmax_iterations = 2");
        let f = fixture(&toml);
        add_ready(&f.db);
        let mut orch = orchestrator(&f);

        let summary = orch.run().await.unwrap();
        assert_eq!(summary.reason, StopReason::IterationCap);
        assert_eq!(summary.iterations, 2);
        assert_eq!(orch.state().working_count(), 1);
        assert!(f.host.destroyed().is_empty());
    }

    #[tokio::test]
    async fn test_signals_are_consumed_once() {
        let f = fixture(QUIET);
        let id = add_ready(&f.db);
        let mailbox = Mailbox::new(f.config.signals_dir.clone());
        mailbox
            .send(SignalMessage::new(SignalAction::SetMode).with_mode(crate::foreman_config::Mode::Aggressive))
            .unwrap();
        mailbox.send(SignalMessage::for_item(SignalAction::Claim, &id)).unwrap();

        let mut orch = orchestrator(&f);
        orch.iteration().await.unwrap();
        assert_eq!(orch.state().mode, crate::foreman_config::Mode::Aggressive);
        assert!(mailbox.pending().unwrap().is_empty());
        assert_eq!(f.host.spawned().len(), 1);

        orch.iteration().await.unwrap();
        assert_eq!(f.host.spawned().len(), 1);
    }

    #[tokio::test]
    async fn test_aggressive_mode_runs_to_closed() {
        let f = fixture(&QUIET.replace("max_workers = 2", "max_workers = 2\nmode = \"aggressive\""));
        let id = add_ready(&f.db);
        let mut orch = orchestrator(&f);

        orch.iteration().await.unwrap();
        complete(&f, &id, Phase::Enriching, WorkerOutcome::Success);
        orch.iteration().await.unwrap();

        let artifact = f.db.lock_sync().unwrap().create_artifact(&id, 10).unwrap();
        complete(&f, &id, Phase::Implementing, WorkerOutcome::Success);
        orch.iteration().await.unwrap();

        f.db.lock_sync()
            .unwrap()
            .set_artifact_state(&artifact.id, crate::tracker::ReviewState::Approved)
            .unwrap();
        complete(&f, &id, Phase::Reviewing, WorkerOutcome::Approved);
        orch.iteration().await.unwrap();

        let item = f.db.get_item(&id).await.unwrap().unwrap();
        assert_eq!(item.primary_state, PrimaryState::Closed);
        assert_eq!(item.phase, Phase::Done);
        assert_eq!(orch.state().working_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_killed_without_report_returns_to_ready() {
        let f = fixture(&no_backoff());
        let id = add_ready(&f.db);
        let mut orch = orchestrator(&f);
        orch.iteration().await.unwrap();
        f.host.finish(&working_handle(&orch), 137);

        orch.iteration().await.unwrap();
        let item = f.db.get_item(&id).await.unwrap().unwrap();
        assert_eq!(item.primary_state, PrimaryState::Ready);
        assert_eq!(item.phase, Phase::Enriching);
        assert_eq!(orch.state().working_count(), 0);
        assert_eq!(orch.state().retry_queue[&id].failure_count, 1);
        let comments = f.db.list_comments(&id).await.unwrap();
        assert!(comments.iter().any(|c| c.body.contains("code 137")));

        // Claimed again; a reported success clears the failure count.
        orch.iteration().await.unwrap();
        assert_eq!(orch.state().working_count(), 1);
        complete(&f, &id, Phase::Enriching, WorkerOutcome::Success);
        orch.iteration().await.unwrap();
        let item = f.db.get_item(&id).await.unwrap().unwrap();
        assert_eq!(item.primary_state, PrimaryState::Curated);
        assert!(!orch.state().retry_queue.contains_key(&id));
    }

    #[tokio::test]
    async fn test_crash_loop_blocks_after_max_failures() {
        let f = fixture(&no_backoff());
        let id = add_ready(&f.db);
        let mut orch = orchestrator(&f);

        for _ in 0..3 {
            orch.iteration().await.unwrap();
            assert_eq!(orch.state().working_count(), 1);
            f.host.finish(&working_handle(&orch), 137);
            orch.iteration().await.unwrap();
        }

        let item = f.db.get_item(&id).await.unwrap().unwrap();
        assert_eq!(item.primary_state, PrimaryState::Blocked);
        assert!(orch.state().retry_queue[&id].exhausted);
        assert_eq!(f.host.spawned().len(), 3);

        orch.iteration().await.unwrap();
        assert_eq!(f.host.spawned().len(), 3);
    }

    #[tokio::test]
    async fn test_restart_with_lower_max_workers_stops_excess() {
        let f = fixture(&QUIET.replace("max_workers = 2", "max_workers = 3"));
        let ids: Vec<String> = (0..3).map(|_| add_ready(&f.db)).collect();
        let mut first = orchestrator(&f);
        first.iteration().await.unwrap();
        assert_eq!(first.state().working_count(), 3);
        drop(first);

        std::fs::write(
            f.config.project_dir.join(".foreman/foreman.toml"),
            QUIET.replace("max_workers = 2", "max_workers = 1"),
        )
        .unwrap();
        let config = Config::new(f.config.project_dir.clone(), false).unwrap();
        let mut second = Orchestrator::new(
            &config,
            Arc::new(f.db.clone()),
            f.host.clone(),
            Shutdown::new(config.stop_file.clone()),
        )
        .unwrap();
        let persisted = StateStore::load(&config.state_file).unwrap().unwrap();
        assert_eq!(persisted.working_count(), 1);

        second.startup_recovery().await;
        assert_eq!(second.state().working_count(), 1);
        assert_eq!(second.state().worker_slots.len(), 1);
        assert_eq!(f.host.destroyed().len(), 2);

        let mut ready = 0;
        for id in &ids {
            if f.db.get_item(id).await.unwrap().unwrap().primary_state == PrimaryState::Ready {
                ready += 1;
            }
        }
        assert_eq!(ready, 2);
    }
}
