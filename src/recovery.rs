//! Crash and orphan recovery sweep.
//!
//! Runs every `recovery_every` iterations and once at startup. It repairs
//! what it can (orphaned claims, dead or bogus slots) and only warns about
//! the rest (stale heartbeats, systematic failures).

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::foreman_config::HealthSection;
use crate::orchestrator::state::{OrchestratorState, WarningKind};
use crate::phase::abort_item;
use crate::pool::PoolManager;
use crate::tracker::{Phase, PrimaryState};
use crate::util::error_signature;

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryReport {
    /// InProgress items with no live slot, returned to Ready.
    pub reclaimed: Vec<String>,
    pub released_slots: Vec<usize>,
    pub stale: Vec<String>,
    pub stuck: Vec<String>,
    /// Parked items whose abort label was honored.
    pub aborted: Vec<String>,
    /// Leading error text shared by most recent failures.
    pub systematic: Option<String>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.reclaimed.is_empty()
            && self.released_slots.is_empty()
            && self.stale.is_empty()
            && self.stuck.is_empty()
            && self.aborted.is_empty()
            && self.systematic.is_none()
    }
}

pub async fn sweep(
    pool: &PoolManager,
    health: &HealthSection,
    state: &mut OrchestratorState,
    now: DateTime<Utc>,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let tracker = pool.tracker().clone();

    release_dead_slots(pool, state, &mut report).await?;

    let in_progress = tracker.list_items(PrimaryState::InProgress).await?;
    for item in &in_progress {
        if state.slot_for_item(&item.id).is_some() {
            continue;
        }
        if item.phase == Phase::AwaitingMerge {
            // Parked at the merge gate; not an orphan unless aborted.
            if item.abort_requested() && abort_item(pool, &item.id, "abort requested").await? {
                report.aborted.push(item.id.clone());
            }
            continue;
        }
        if pool.revert_claim(&item.id).await? {
            tracker
                .add_comment(
                    &item.id,
                    "foreman: no live worker held this claim; returned to ready",
                )
                .await?;
            tracing::warn!(item_id = %item.id, phase = %item.phase, "Reclaimed orphaned item");
            report.reclaimed.push(item.id.clone());
        }
    }

    check_heartbeats(pool, health, state, now, &mut report).await?;
    report.systematic = check_systematic_failure(health, state, now);

    // Exhaustion warnings go away once someone unblocks the item.
    let blocked: BTreeSet<String> = tracker
        .list_items(PrimaryState::Blocked)
        .await?
        .into_iter()
        .map(|i| i.id)
        .collect();
    state.warnings.retain(|w| match w.kind {
        WarningKind::RetryExhausted | WarningKind::CycleExhausted => w
            .item_id
            .as_ref()
            .is_some_and(|id| blocked.contains(id)),
        _ => true,
    });

    if !report.is_clean() {
        tracing::info!(
            reclaimed = report.reclaimed.len(),
            released = report.released_slots.len(),
            stale = report.stale.len(),
            stuck = report.stuck.len(),
            aborted = report.aborted.len(),
            "Recovery sweep finished"
        );
    }
    Ok(report)
}

/// Release slots whose handle is malformed, whose process is gone without a
/// finished progress record, or whose item is no longer InProgress. Their
/// items go back to Ready; checkpoints make the next claim resume.
async fn release_dead_slots(
    pool: &PoolManager,
    state: &mut OrchestratorState,
    report: &mut RecoveryReport,
) -> Result<()> {
    let tracker = pool.tracker().clone();
    let working: Vec<(usize, String, Option<crate::worker::WorkerHandle>)> = state
        .worker_slots
        .iter()
        .filter(|s| s.is_working())
        .filter_map(|s| {
            s.assigned_item_id
                .clone()
                .map(|id| (s.slot_id, id, s.session_handle.clone()))
        })
        .collect();

    for (slot_id, item_id, handle) in working {
        let item_state = tracker.get_item(&item_id).await?.map(|i| i.primary_state);
        let reason = match &handle {
            Some(h) if !h.is_well_formed() => Some("malformed worker handle"),
            None => Some("missing worker handle"),
            Some(_) if item_state != Some(PrimaryState::InProgress) => {
                Some("item left InProgress")
            }
            Some(h) => {
                let reported = pool
                    .progress()
                    .read(&item_id)
                    .ok()
                    .flatten()
                    .is_some_and(|r| r.status.is_finished());
                if !reported && !pool.host().is_alive(h).await {
                    Some("worker process is gone")
                } else {
                    None
                }
            }
        };
        let Some(reason) = reason else {
            continue;
        };

        tracing::warn!(slot = slot_id, item_id = %item_id, reason, "Releasing dead slot");
        pool.release(state, slot_id).await;
        report.released_slots.push(slot_id);
        if item_state == Some(PrimaryState::InProgress) && pool.revert_claim(&item_id).await? {
            tracker
                .add_comment(
                    &item_id,
                    &format!("foreman: worker slot released ({}); returned to ready", reason),
                )
                .await?;
            report.reclaimed.push(item_id);
        }
    }
    Ok(())
}

async fn check_heartbeats(
    pool: &PoolManager,
    health: &HealthSection,
    state: &mut OrchestratorState,
    now: DateTime<Utc>,
    report: &mut RecoveryReport,
) -> Result<()> {
    let already_stuck: BTreeSet<String> = state
        .warnings
        .iter()
        .filter(|w| w.kind == WarningKind::Stuck)
        .filter_map(|w| w.item_id.clone())
        .collect();
    state.clear_warnings(WarningKind::StaleHeartbeat);
    state.clear_warnings(WarningKind::Stuck);

    let ages: Vec<(String, i64)> = state
        .worker_slots
        .iter()
        .filter(|s| s.is_working())
        .filter_map(|s| {
            let item_id = s.assigned_item_id.clone()?;
            let beat = s.last_heartbeat.or(s.started_at)?;
            Some((item_id, now.signed_duration_since(beat).num_seconds()))
        })
        .collect();

    for (item_id, age) in ages {
        if age >= health.stuck_heartbeat_secs as i64 {
            let message = format!("no heartbeat for {}s; worker looks stuck", age);
            state.warn(WarningKind::Stuck, Some(&item_id), message.clone(), now);
            if !already_stuck.contains(&item_id) {
                pool.tracker()
                    .add_comment(&item_id, &format!("foreman: {}", message))
                    .await?;
                tracing::error!(item_id = %item_id, age_secs = age, "Worker looks stuck");
            }
            report.stuck.push(item_id);
        } else if age >= health.stale_heartbeat_secs as i64 {
            tracing::warn!(item_id = %item_id, age_secs = age, "Stale worker heartbeat");
            state.warn(
                WarningKind::StaleHeartbeat,
                Some(&item_id),
                format!("no heartbeat for {}s", age),
                now,
            );
            report.stale.push(item_id);
        }
    }
    Ok(())
}

/// Flag a shared failure signature across recent failures. Detection only.
pub fn check_systematic_failure(
    health: &HealthSection,
    state: &mut OrchestratorState,
    now: DateTime<Utc>,
) -> Option<String> {
    state.clear_warnings(WarningKind::SystematicFailure);

    let window = chrono::Duration::seconds(health.failure_window_secs as i64);
    let recent: Vec<&str> = state
        .recent_failures
        .iter()
        .filter(|f| now.signed_duration_since(f.at) <= window)
        .map(|f| f.message.as_str())
        .collect();
    if recent.is_empty() || recent.len() < health.systematic_failure_min_samples {
        return None;
    }

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for message in &recent {
        *counts.entry(error_signature(message)).or_default() += 1;
    }
    let (signature, count) = counts.into_iter().max_by_key(|(_, n)| *n)?;
    let share = count as f64 / recent.len() as f64;
    if share < health.systematic_failure_ratio {
        return None;
    }

    let message = format!(
        "{} of {} recent failures share the signature \"{}\"",
        count,
        recent.len(),
        signature
    );
    tracing::error!(signature = %signature, count, total = recent.len(), "Systematic failure detected");
    state.warn(WarningKind::SystematicFailure, None, message, now);
    Some(signature)
}
