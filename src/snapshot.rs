//! Point-in-time view of the tracker and pool, and the actions it implies.
//!
//! `assemble` runs every tracker query concurrently and freezes the results.
//! `recommend` is a pure function of the snapshot and policy: the same inputs
//! always give the same actions in the same order.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;

use crate::foreman_config::{ForemanToml, Mode};
use crate::orchestrator::state::{OrchestratorState, RetryInfo, RoleState};
use crate::roles::RoleKind;
use crate::tracker::{ChangeArtifact, Phase, PrimaryState, ReviewState, Tracker, WorkItem};

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub iteration: u64,
    pub mode: Mode,
    pub items: BTreeMap<PrimaryState, Vec<WorkItem>>,
    pub artifacts: BTreeMap<ReviewState, Vec<ChangeArtifact>>,
    pub idle_slots: usize,
    pub working_slots: usize,
    pub busy_items: BTreeSet<String>,
    pub retry_queue: BTreeMap<String, RetryInfo>,
    pub roles: BTreeMap<RoleKind, RoleState>,
}

impl Snapshot {
    pub fn items_in(&self, state: PrimaryState) -> &[WorkItem] {
        self.items.get(&state).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count(&self, state: PrimaryState) -> usize {
        self.items_in(state).len()
    }

    pub fn is_closed(&self, id: &str) -> bool {
        self.items_in(PrimaryState::Closed).iter().any(|i| i.id == id)
    }

    /// Latest artifact for an item across all review states.
    pub fn artifact_for(&self, item_id: &str) -> Option<&ChangeArtifact> {
        self.artifacts
            .values()
            .flatten()
            .filter(|a| a.parent_item_id == item_id)
            .max_by(|a, b| a.last_updated.cmp(&b.last_updated).then(a.id.cmp(&b.id)))
    }
}

pub async fn assemble(
    tracker: &dyn Tracker,
    state: &OrchestratorState,
    now: DateTime<Utc>,
) -> Result<Snapshot> {
    let item_queries = try_join_all(PrimaryState::ALL.iter().map(|s| tracker.list_items(*s)));
    let artifact_queries =
        try_join_all(ReviewState::ALL.iter().map(|s| tracker.list_artifacts(*s)));
    let (item_lists, artifact_lists) = tokio::try_join!(item_queries, artifact_queries)?;

    let items = PrimaryState::ALL.into_iter().zip(item_lists).collect();
    let artifacts = ReviewState::ALL.into_iter().zip(artifact_lists).collect();
    let busy_items = state
        .worker_slots
        .iter()
        .filter(|s| s.is_working())
        .filter_map(|s| s.assigned_item_id.clone())
        .collect();

    Ok(Snapshot {
        taken_at: now,
        iteration: state.iteration_count,
        mode: state.mode,
        items,
        artifacts,
        idle_slots: state.idle_count(),
        working_slots: state.working_count(),
        busy_items,
        retry_queue: state.retry_queue.clone(),
        roles: state.support_roles.clone(),
    })
}

/// Knobs `recommend` reads; copied out of configuration once.
#[derive(Debug, Clone)]
pub struct Policy {
    pub max_failures: u32,
    pub retry_backoff_secs: u64,
    pub proposer_enabled: bool,
    pub ready_threshold: usize,
    pub max_outstanding_proposals: usize,
    pub proposer_cooldown_secs: u64,
    pub recovery_every: u64,
}

impl Policy {
    pub fn from_settings(settings: &ForemanToml) -> Self {
        Self {
            max_failures: settings.limits.max_failures,
            retry_backoff_secs: settings.limits.retry_backoff_secs,
            proposer_enabled: settings.roles.proposer.enabled,
            ready_threshold: settings.roles.proposer.ready_threshold,
            max_outstanding_proposals: settings.roles.proposer.max_outstanding_proposals,
            proposer_cooldown_secs: settings.roles.proposer.cooldown_secs,
            recovery_every: settings.orchestrator.recovery_every,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::from_settings(&ForemanToml::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Claim these Ready items, in order, one per idle slot.
    SpawnWorkers { item_ids: Vec<String> },
    TriggerRole { role: RoleKind },
    /// Approved while parked at the approval gate: back to Ready.
    PromoteApproved { item_id: String },
    /// Artifact merged while parked at the merge gate: close the item.
    FinalizeMerged { item_id: String },
    /// Parked at the merge gate in aggressive mode: try the merge.
    AttemptMerge { item_id: String },
    RunRecovery,
}

/// Whether an item can be claimed right now, as of the snapshot.
pub fn is_claimable(snapshot: &Snapshot, policy: &Policy, item: &WorkItem) -> bool {
    if item.primary_state != PrimaryState::Ready || snapshot.busy_items.contains(&item.id) {
        return false;
    }
    if !item.dependency_refs.iter().all(|dep| snapshot.is_closed(dep)) {
        return false;
    }
    match snapshot.retry_queue.get(&item.id) {
        Some(retry) if retry.exhausted || retry.failure_count >= policy.max_failures => false,
        Some(retry) => retry.next_eligible(policy.retry_backoff_secs) <= snapshot.taken_at,
        None => true,
    }
}

pub fn recommend(snapshot: &Snapshot, policy: &Policy) -> Vec<Action> {
    let mut actions = Vec::new();

    let item_ids: Vec<String> = snapshot
        .items_in(PrimaryState::Ready)
        .iter()
        .filter(|item| is_claimable(snapshot, policy, item))
        .take(snapshot.idle_slots)
        .map(|item| item.id.clone())
        .collect();
    if !item_ids.is_empty() {
        actions.push(Action::SpawnWorkers { item_ids });
    }

    for item in snapshot.items_in(PrimaryState::Curated) {
        if item.phase == Phase::AwaitingApproval && item.is_approved() {
            actions.push(Action::PromoteApproved {
                item_id: item.id.clone(),
            });
        }
    }

    for item in snapshot.items_in(PrimaryState::InProgress) {
        if item.phase != Phase::AwaitingMerge || snapshot.busy_items.contains(&item.id) {
            continue;
        }
        match snapshot.artifact_for(&item.id).map(|a| a.review_state) {
            Some(ReviewState::Merged) => actions.push(Action::FinalizeMerged {
                item_id: item.id.clone(),
            }),
            Some(ReviewState::Approved) if snapshot.mode == Mode::Aggressive => {
                actions.push(Action::AttemptMerge {
                    item_id: item.id.clone(),
                })
            }
            _ => {}
        }
    }

    if proposer_wanted(snapshot, policy) {
        actions.push(Action::TriggerRole {
            role: RoleKind::Proposer,
        });
    }

    if policy.recovery_every > 0 && snapshot.iteration % policy.recovery_every == 0 {
        actions.push(Action::RunRecovery);
    }

    actions
}

fn proposer_wanted(snapshot: &Snapshot, policy: &Policy) -> bool {
    if !policy.proposer_enabled {
        return false;
    }
    if snapshot.count(PrimaryState::Ready) >= policy.ready_threshold {
        return false;
    }
    if snapshot.count(PrimaryState::Proposed) >= policy.max_outstanding_proposals {
        return false;
    }
    match snapshot.roles.get(&RoleKind::Proposer) {
        Some(rs) if rs.running => false,
        Some(rs) => rs.last_completed.is_none_or(|done| {
            snapshot.taken_at.signed_duration_since(done).num_seconds()
                >= policy.proposer_cooldown_secs as i64
        }),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{DbHandle, TrackerDb};
    use crate::worker::WorkerHandle;

    fn empty_snapshot(now: DateTime<Utc>) -> Snapshot {
        Snapshot {
            taken_at: now,
            iteration: 1,
            mode: Mode::Normal,
            items: PrimaryState::ALL.into_iter().map(|s| (s, Vec::new())).collect(),
            artifacts: ReviewState::ALL.into_iter().map(|s| (s, Vec::new())).collect(),
            idle_slots: 3,
            working_slots: 0,
            busy_items: BTreeSet::new(),
            retry_queue: BTreeMap::new(),
            roles: BTreeMap::new(),
        }
    }

    fn push(snapshot: &mut Snapshot, item: WorkItem) {
        snapshot
            .items
            .entry(item.primary_state)
            .or_default()
            .push(item);
    }

    fn quiet_policy() -> Policy {
        Policy {
            proposer_enabled: false,
            ..Policy::default()
        }
    }

    #[test]
    fn test_spawn_limited_by_idle_slots() {
        let now = Utc::now();
        let mut snap = empty_snapshot(now);
        snap.idle_slots = 2;
        for i in 1..=3 {
            push(&mut snap, WorkItem::new(format!("fm-{}", i), "t", PrimaryState::Ready));
        }
        let actions = recommend(&snap, &quiet_policy());
        assert_eq!(
            actions[0],
            Action::SpawnWorkers {
                item_ids: vec!["fm-1".into(), "fm-2".into()]
            }
        );
    }

    #[test]
    fn test_no_spawn_without_free_slots() {
        let now = Utc::now();
        let mut snap = empty_snapshot(now);
        snap.idle_slots = 0;
        push(&mut snap, WorkItem::new("fm-1", "t", PrimaryState::Ready));
        assert!(
            !recommend(&snap, &quiet_policy())
                .iter()
                .any(|a| matches!(a, Action::SpawnWorkers { .. }))
        );
    }

    #[test]
    fn test_open_dependency_blocks_claim() {
        let now = Utc::now();
        let mut snap = empty_snapshot(now);
        let mut item = WorkItem::new("fm-2", "t", PrimaryState::Ready);
        item.dependency_refs.insert("fm-1".into());
        push(&mut snap, item.clone());
        push(&mut snap, WorkItem::new("fm-1", "dep", PrimaryState::InProgress));
        assert!(!is_claimable(&snap, &quiet_policy(), &item));

        snap.items.insert(PrimaryState::InProgress, Vec::new());
        push(&mut snap, WorkItem::new("fm-1", "dep", PrimaryState::Closed));
        assert!(is_claimable(&snap, &quiet_policy(), &item));
    }

    #[test]
    fn test_backoff_and_exhaustion_block_claim() {
        let now = Utc::now();
        let mut snap = empty_snapshot(now);
        let item = WorkItem::new("fm-1", "t", PrimaryState::Ready);
        push(&mut snap, item.clone());
        let policy = quiet_policy();

        snap.retry_queue.insert(
            "fm-1".into(),
            RetryInfo {
                item_id: "fm-1".into(),
                failure_count: 1,
                last_error: "boom".into(),
                last_attempt: now - chrono::Duration::seconds(10),
                exhausted: false,
            },
        );
        assert!(!is_claimable(&snap, &policy, &item));

        snap.retry_queue.get_mut("fm-1").unwrap().last_attempt =
            now - chrono::Duration::seconds(31);
        assert!(is_claimable(&snap, &policy, &item));

        snap.retry_queue.get_mut("fm-1").unwrap().exhausted = true;
        assert!(!is_claimable(&snap, &policy, &item));
    }

    #[test]
    fn test_recommend_is_deterministic() {
        let now = Utc::now();
        let mut snap = empty_snapshot(now);
        snap.iteration = 5;
        for i in 1..=4 {
            push(&mut snap, WorkItem::new(format!("fm-{}", i), "t", PrimaryState::Ready));
        }
        let policy = Policy::default();
        assert_eq!(recommend(&snap, &policy), recommend(&snap, &policy));
        assert!(recommend(&snap, &policy).contains(&Action::RunRecovery));
    }

    #[test]
    fn test_proposer_triggered_when_backlog_low() {
        let now = Utc::now();
        let mut snap = empty_snapshot(now);
        let policy = Policy::default();
        assert!(recommend(&snap, &policy).contains(&Action::TriggerRole {
            role: RoleKind::Proposer
        }));

        snap.roles.insert(
            RoleKind::Proposer,
            RoleState {
                last_completed: Some(now - chrono::Duration::seconds(30)),
                ..Default::default()
            },
        );
        assert!(!recommend(&snap, &policy).contains(&Action::TriggerRole {
            role: RoleKind::Proposer
        }));

        snap.roles.clear();
        for i in 0..5 {
            push(&mut snap, WorkItem::new(format!("p-{}", i), "p", PrimaryState::Proposed));
        }
        assert!(!recommend(&snap, &policy).contains(&Action::TriggerRole {
            role: RoleKind::Proposer
        }));
    }

    #[test]
    fn test_parked_merge_actions() {
        let now = Utc::now();
        let mut snap = empty_snapshot(now);
        let mut item = WorkItem::new("fm-1", "t", PrimaryState::InProgress);
        item.phase = Phase::AwaitingMerge;
        push(&mut snap, item);
        snap.artifacts.insert(
            ReviewState::Approved,
            vec![ChangeArtifact {
                id: "cr-1".into(),
                parent_item_id: "fm-1".into(),
                review_state: ReviewState::Approved,
                size_metric: 10,
                mergeable: true,
                last_updated: now,
            }],
        );
        let policy = quiet_policy();
        assert!(
            !recommend(&snap, &policy)
                .iter()
                .any(|a| matches!(a, Action::AttemptMerge { .. }))
        );

        snap.mode = Mode::Aggressive;
        assert!(recommend(&snap, &policy).contains(&Action::AttemptMerge {
            item_id: "fm-1".into()
        }));
    }

    #[tokio::test]
    async fn test_assemble_collects_all_states() {
        let db = TrackerDb::new_in_memory().unwrap();
        db.create_item("a", "", PrimaryState::Ready, 0, &BTreeSet::new())
            .unwrap();
        db.create_item("b", "", PrimaryState::Proposed, 0, &BTreeSet::new())
            .unwrap();
        let tracker = DbHandle::new(db);
        let mut state = OrchestratorState::new("t", Mode::Normal, 2);
        state.worker_slots[0].assign("fm-9", WorkerHandle::from_pid(1), Phase::Enriching, Utc::now());

        let snap = assemble(&tracker, &state, Utc::now()).await.unwrap();
        assert_eq!(snap.count(PrimaryState::Ready), 1);
        assert_eq!(snap.count(PrimaryState::Proposed), 1);
        assert_eq!(snap.idle_slots, 1);
        assert!(snap.busy_items.contains("fm-9"));
    }
}
