//! Translate signal messages into actions.
//!
//! Tracker-side effects (labels, unblocking) happen here. Effects that need
//! a free slot or the merge path are handed back to the control loop in
//! [`SignalEffects`].

use anyhow::Result;
use tracing::Instrument;

use super::types::{SignalAction, SignalMessage};
use crate::foreman_config::Mode;
use crate::orchestrator::shutdown::Shutdown;
use crate::orchestrator::state::OrchestratorState;
use crate::phase::abort_item;
use crate::pool::PoolManager;
use crate::roles::RoleKind;
use crate::tracker::{LABEL_ABORT, LABEL_APPROVED, Phase, PrimaryState};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SignalEffects {
    /// Items to claim this iteration ahead of the snapshot's picks.
    pub claims: Vec<String>,
    /// Items whose merge should be attempted regardless of mode.
    pub merges: Vec<String>,
    pub role_demands: Vec<RoleKind>,
    pub mode: Option<Mode>,
    pub shutdown: bool,
}

/// Apply each message in order. A message that fails is logged and skipped.
pub async fn dispatch(
    pool: &PoolManager,
    state: &mut OrchestratorState,
    shutdown: &Shutdown,
    messages: Vec<SignalMessage>,
) -> SignalEffects {
    let mut effects = SignalEffects::default();
    for message in messages {
        let span = tracing::info_span!("signal", id = %message.id, action = %message.action);
        let result = apply_one(pool, state, shutdown, &message, &mut effects)
            .instrument(span)
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %format!("{:#}", e), "Signal failed");
        }
    }
    effects
}

async fn apply_one(
    pool: &PoolManager,
    state: &mut OrchestratorState,
    shutdown: &Shutdown,
    message: &SignalMessage,
    effects: &mut SignalEffects,
) -> Result<()> {
    let tracker = pool.tracker().clone();
    let target = message.target_item.clone().unwrap_or_default();

    match message.action {
        SignalAction::Claim => {
            if !effects.claims.contains(&target) {
                effects.claims.push(target);
            }
        }

        SignalAction::Abort => {
            let Some(item) = tracker.get_item(&target).await? else {
                tracing::warn!(item_id = %target, "Abort for unknown item");
                return Ok(());
            };
            if item.primary_state != PrimaryState::InProgress {
                tracing::info!(item_id = %target, state = %item.primary_state, "Abort ignored; item is not in progress");
                return Ok(());
            }
            match state.slot_for_item(&target) {
                Some(slot) => {
                    // Honored when the worker reaches its phase boundary.
                    state.worker_slots[slot].cancel_requested = true;
                    tracker.add_label(&target, LABEL_ABORT).await?;
                    tracing::info!(item_id = %target, slot, "Abort requested; waiting for phase boundary");
                }
                None => {
                    abort_item(pool, &target, "abort signal").await?;
                }
            }
        }

        SignalAction::Approve => {
            tracker.add_label(&target, LABEL_APPROVED).await?;
            if tracker
                .compare_and_set_state(&target, PrimaryState::Curated, PrimaryState::Ready)
                .await?
            {
                tracker
                    .add_comment(&target, "foreman: approved; queued for implementation")
                    .await?;
                tracing::info!(item_id = %target, "Item approved");
            }
        }

        SignalAction::Retry => {
            let Some(mut item) = tracker.get_item(&target).await? else {
                tracing::warn!(item_id = %target, "Retry for unknown item");
                return Ok(());
            };
            if item.primary_state != PrimaryState::Blocked {
                tracing::info!(item_id = %target, state = %item.primary_state, "Retry ignored; item is not blocked");
                return Ok(());
            }
            state.retry_queue.remove(&target);
            item.fix_iterations = 0;
            item.merge_retries = 0;
            if item.phase == Phase::AwaitingMerge {
                item.phase = Phase::Reviewing;
            }
            tracker.save_progress(&item).await?;
            if tracker
                .compare_and_set_state(&target, PrimaryState::Blocked, PrimaryState::Ready)
                .await?
            {
                tracker
                    .add_comment(&target, "foreman: unblocked by retry signal")
                    .await?;
                state
                    .warnings
                    .retain(|w| w.item_id.as_deref() != Some(target.as_str()));
                tracing::info!(item_id = %target, "Item unblocked");
            }
        }

        SignalAction::Merge => {
            if !effects.merges.contains(&target) {
                effects.merges.push(target);
            }
        }

        SignalAction::SetMode => {
            if let Some(mode) = message.mode {
                if state.mode != mode {
                    tracing::info!(from = ?state.mode, to = ?mode, "Mode changed");
                }
                state.mode = mode;
                effects.mode = Some(mode);
            }
        }

        SignalAction::TriggerRole => {
            if let Some(role) = message.role()
                && !effects.role_demands.contains(&role)
            {
                effects.role_demands.push(role);
            }
        }

        SignalAction::Shutdown => {
            tracing::info!("Shutdown requested by signal");
            shutdown.trigger();
            effects.shutdown = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreman_config::LimitsSection;
    use crate::orchestrator::state::{RetryInfo, WarningKind};
    use crate::tracker::{DbHandle, Tracker, TrackerDb};
    use crate::worker::ProgressStore;
    use crate::worker::fake::FakeHost;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        db: DbHandle,
        pool: PoolManager,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let db = DbHandle::new(TrackerDb::new_in_memory().unwrap());
        let pool = PoolManager::new(
            Arc::new(db.clone()),
            Arc::new(FakeHost::new()),
            ProgressStore::new(dir.path().join("progress")),
            LimitsSection::default(),
            dir.path().to_path_buf(),
        );
        Fixture { dir, db, pool }
    }

    fn add_item(db: &DbHandle, state: PrimaryState) -> String {
        db.lock_sync()
            .unwrap()
            .create_item("x", "", state, 0, &BTreeSet::new())
            .unwrap()
            .id
    }

    async fn run(f: &Fixture, state: &mut OrchestratorState, msgs: Vec<SignalMessage>) -> SignalEffects {
        let shutdown = Shutdown::new(f.dir.path().join("STOP"));
        dispatch(&f.pool, state, &shutdown, msgs).await
    }

    #[tokio::test]
    async fn test_approve_is_idempotent() {
        let f = fixture();
        let id = add_item(&f.db, PrimaryState::Curated);
        let mut state = OrchestratorState::new("t", Mode::Normal, 1);
        let approve = SignalMessage::for_item(SignalAction::Approve, &id);

        run(&f, &mut state, vec![approve.clone(), approve]).await;
        let item = f.db.get_item(&id).await.unwrap().unwrap();
        assert_eq!(item.primary_state, PrimaryState::Ready);
        assert!(item.is_approved());
        let comments = f.db.list_comments(&id).await.unwrap();
        assert_eq!(comments.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_unblocks_and_clears_counters() {
        let f = fixture();
        let id = add_item(&f.db, PrimaryState::Blocked);
        let mut item = f.db.get_item(&id).await.unwrap().unwrap();
        item.fix_iterations = 3;
        f.db.save_progress(&item).await.unwrap();

        let mut state = OrchestratorState::new("t", Mode::Normal, 1);
        let now = Utc::now();
        state.retry_queue.insert(
            id.clone(),
            RetryInfo {
                item_id: id.clone(),
                failure_count: 3,
                last_error: "boom".into(),
                last_attempt: now,
                exhausted: true,
            },
        );
        state.warn(WarningKind::RetryExhausted, Some(&id), "blocked", now);

        run(&f, &mut state, vec![SignalMessage::for_item(SignalAction::Retry, &id)]).await;
        let item = f.db.get_item(&id).await.unwrap().unwrap();
        assert_eq!(item.primary_state, PrimaryState::Ready);
        assert_eq!(item.fix_iterations, 0);
        assert!(state.retry_queue.is_empty());
        assert!(state.warnings.is_empty());

        // Not blocked any more: a second retry changes nothing.
        run(&f, &mut state, vec![SignalMessage::for_item(SignalAction::Retry, &id)]).await;
        assert_eq!(f.db.list_comments(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_running_item_marks_slot() {
        let f = fixture();
        let id = add_item(&f.db, PrimaryState::Ready);
        let mut state = OrchestratorState::new("t", Mode::Normal, 1);
        f.pool.claim_and_spawn(&mut state, &id, Utc::now()).await.unwrap();

        run(&f, &mut state, vec![SignalMessage::for_item(SignalAction::Abort, &id)]).await;
        assert!(state.worker_slots[0].cancel_requested);
        let item = f.db.get_item(&id).await.unwrap().unwrap();
        assert_eq!(item.primary_state, PrimaryState::InProgress);
        assert!(item.abort_requested());
    }

    #[tokio::test]
    async fn test_abort_parked_item_reverts_immediately() {
        let f = fixture();
        let id = add_item(&f.db, PrimaryState::InProgress);
        let mut state = OrchestratorState::new("t", Mode::Normal, 1);

        run(&f, &mut state, vec![SignalMessage::for_item(SignalAction::Abort, &id)]).await;
        let item = f.db.get_item(&id).await.unwrap().unwrap();
        assert_eq!(item.primary_state, PrimaryState::Ready);
        assert!(!item.abort_requested());
    }

    #[tokio::test]
    async fn test_loop_effects_are_collected() {
        let f = fixture();
        let mut state = OrchestratorState::new("t", Mode::Normal, 1);
        let effects = run(
            &f,
            &mut state,
            vec![
                SignalMessage::for_item(SignalAction::Claim, "fm-1"),
                SignalMessage::for_item(SignalAction::Claim, "fm-1"),
                SignalMessage::for_item(SignalAction::Merge, "fm-2"),
                SignalMessage::new(SignalAction::SetMode).with_mode(Mode::Aggressive),
                SignalMessage::new(SignalAction::TriggerRole).with_flag("auditor"),
                SignalMessage::new(SignalAction::Shutdown),
            ],
        )
        .await;
        assert_eq!(effects.claims, vec!["fm-1".to_string()]);
        assert_eq!(effects.merges, vec!["fm-2".to_string()]);
        assert_eq!(effects.role_demands, vec![RoleKind::Auditor]);
        assert_eq!(effects.mode, Some(Mode::Aggressive));
        assert_eq!(state.mode, Mode::Aggressive);
        assert!(effects.shutdown);
    }

    #[tokio::test]
    async fn test_unknown_item_is_skipped() {
        let f = fixture();
        let mut state = OrchestratorState::new("t", Mode::Normal, 1);
        let effects = run(
            &f,
            &mut state,
            vec![SignalMessage::for_item(SignalAction::Abort, "fm-404")],
        )
        .await;
        assert_eq!(effects, SignalEffects::default());
    }
}
