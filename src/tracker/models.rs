use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label that satisfies the approval gate.
pub const LABEL_APPROVED: &str = "approved";
/// Label that requests a single-item abort.
pub const LABEL_ABORT: &str = "abort";

/// Mutually exclusive tracker state of a work item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryState {
    Proposed,
    Curated,
    Ready,
    InProgress,
    Blocked,
    Closed,
}

impl PrimaryState {
    pub const ALL: [PrimaryState; 6] = [
        Self::Proposed,
        Self::Curated,
        Self::Ready,
        Self::InProgress,
        Self::Blocked,
        Self::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Curated => "curated",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for PrimaryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrimaryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(Self::Proposed),
            "curated" => Ok(Self::Curated),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid item state: {}", s)),
        }
    }
}

/// Pipeline phase of a work item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    None,
    Enriching,
    AwaitingApproval,
    Implementing,
    Reviewing,
    AddressingFeedback,
    AwaitingMerge,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Enriching => "enriching",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Implementing => "implementing",
            Self::Reviewing => "reviewing",
            Self::AddressingFeedback => "addressing_feedback",
            Self::AwaitingMerge => "awaiting_merge",
            Self::Done => "done",
        }
    }

    /// Worker role that executes this phase, if the phase runs a worker at all.
    pub fn worker_role(&self) -> Option<&'static str> {
        match self {
            Self::Enriching => Some("enrich"),
            Self::Implementing => Some("implement"),
            Self::Reviewing => Some("review"),
            Self::AddressingFeedback => Some("address-feedback"),
            Self::AwaitingMerge => Some("resolve-conflicts"),
            Self::None | Self::AwaitingApproval | Self::Done => None,
        }
    }

    /// Gate phases wait on something outside the orchestrator and hold no worker.
    pub fn is_gate(&self) -> bool {
        matches!(self, Self::AwaitingApproval | Self::AwaitingMerge)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "enriching" => Ok(Self::Enriching),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "implementing" => Ok(Self::Implementing),
            "reviewing" => Ok(Self::Reviewing),
            "addressing_feedback" => Ok(Self::AddressingFeedback),
            "awaiting_merge" => Ok(Self::AwaitingMerge),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Implementation sub-stage recorded in a checkpoint. Ordered: later stages
/// compare greater.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStage {
    Planning,
    Implementing,
    Tested,
    Committed,
    Pushed,
    ArtifactCreated,
}

impl CheckpointStage {
    pub const ALL: [CheckpointStage; 6] = [
        Self::Planning,
        Self::Implementing,
        Self::Tested,
        Self::Committed,
        Self::Pushed,
        Self::ArtifactCreated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Implementing => "implementing",
            Self::Tested => "tested",
            Self::Committed => "committed",
            Self::Pushed => "pushed",
            Self::ArtifactCreated => "artifact_created",
        }
    }

    /// The stage after this one, `None` once the artifact exists.
    pub fn next(&self) -> Option<CheckpointStage> {
        Self::ALL.iter().copied().find(|s| s > self)
    }

    /// Stages still to execute when resuming from this checkpoint.
    pub fn remaining(&self) -> Vec<CheckpointStage> {
        Self::ALL.iter().copied().filter(|s| s > self).collect()
    }
}

impl std::fmt::Display for CheckpointStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "implementing" => Ok(Self::Implementing),
            "tested" => Ok(Self::Tested),
            "committed" => Ok(Self::Committed),
            "pushed" => Ok(Self::Pushed),
            "artifact_created" => Ok(Self::ArtifactCreated),
            _ => Err(format!("Invalid checkpoint stage: {}", s)),
        }
    }
}

/// Durable marker of the last completed implementation stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointRecord {
    pub stage: CheckpointStage,
    pub timestamp: DateTime<Utc>,
    /// Free-form details: commit id, artifact id, test result.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CheckpointRecord {
    pub fn new(stage: CheckpointStage) -> Self {
        Self {
            stage,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Move `current` forward to `next`. Returns false (and leaves `current`
/// untouched) when `next` would move the checkpoint backwards.
pub fn advance_checkpoint(current: &mut Option<CheckpointRecord>, next: CheckpointRecord) -> bool {
    match current {
        Some(existing) if next.stage < existing.stage => false,
        Some(existing) => {
            let mut merged = next;
            for (k, v) in &existing.metadata {
                merged.metadata.entry(k.clone()).or_insert_with(|| v.clone());
            }
            *existing = merged;
            true
        }
        None => {
            *current = Some(next);
            true
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub primary_state: PrimaryState,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub dependency_refs: BTreeSet<String>,
    #[serde(default)]
    pub checkpoint: Option<CheckpointRecord>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Lower sorts first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub fix_iterations: u32,
    #[serde(default)]
    pub merge_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, state: PrimaryState) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            primary_state: state,
            phase: Phase::None,
            dependency_refs: BTreeSet::new(),
            checkpoint: None,
            labels: BTreeSet::new(),
            priority: 0,
            fix_iterations: 0,
            merge_retries: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn is_approved(&self) -> bool {
        self.has_label(LABEL_APPROVED)
    }

    pub fn abort_requested(&self) -> bool {
        self.has_label(LABEL_ABORT)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    AwaitingReview,
    ChangesRequested,
    Approved,
    Merged,
    Closed,
}

impl ReviewState {
    pub const ALL: [ReviewState; 5] = [
        Self::AwaitingReview,
        Self::ChangesRequested,
        Self::Approved,
        Self::Merged,
        Self::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingReview => "awaiting_review",
            Self::ChangesRequested => "changes_requested",
            Self::Approved => "approved",
            Self::Merged => "merged",
            Self::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Closed)
    }
}

impl std::fmt::Display for ReviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_review" => Ok(Self::AwaitingReview),
            "changes_requested" => Ok(Self::ChangesRequested),
            "approved" => Ok(Self::Approved),
            "merged" => Ok(Self::Merged),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid review state: {}", s)),
        }
    }
}

/// Reviewable output of the implementation phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeArtifact {
    pub id: String,
    pub parent_item_id: String,
    pub review_state: ReviewState,
    /// Lines changed, or whatever size unit the tracker reports.
    pub size_metric: u64,
    /// False when the artifact cannot be merged cleanly.
    #[serde(default = "default_mergeable")]
    pub mergeable: bool,
    pub last_updated: DateTime<Utc>,
}

fn default_mergeable() -> bool {
    true
}

/// Audit-trail entry attached to an item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    pub item_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_state_round_trips_through_str() {
        for state in PrimaryState::ALL {
            assert_eq!(state.as_str().parse::<PrimaryState>().unwrap(), state);
        }
        assert!("done".parse::<PrimaryState>().is_err());
    }

    #[test]
    fn test_checkpoint_remaining_after_committed() {
        let remaining = CheckpointStage::Committed.remaining();
        assert_eq!(
            remaining,
            vec![CheckpointStage::Pushed, CheckpointStage::ArtifactCreated]
        );
        assert!(!remaining.contains(&CheckpointStage::Planning));
        assert!(!remaining.contains(&CheckpointStage::Implementing));
    }

    #[test]
    fn test_checkpoint_next_stops_at_artifact() {
        assert_eq!(
            CheckpointStage::Planning.next(),
            Some(CheckpointStage::Implementing)
        );
        assert_eq!(CheckpointStage::ArtifactCreated.next(), None);
    }

    #[test]
    fn test_advance_checkpoint_is_monotonic() {
        let mut cp = None;
        assert!(advance_checkpoint(
            &mut cp,
            CheckpointRecord::new(CheckpointStage::Committed).with_metadata("commit", "abc123")
        ));
        assert!(!advance_checkpoint(
            &mut cp,
            CheckpointRecord::new(CheckpointStage::Planning)
        ));
        assert_eq!(cp.as_ref().unwrap().stage, CheckpointStage::Committed);

        assert!(advance_checkpoint(
            &mut cp,
            CheckpointRecord::new(CheckpointStage::Pushed)
        ));
        let cp = cp.unwrap();
        assert_eq!(cp.stage, CheckpointStage::Pushed);
        // Earlier metadata survives the forward move.
        assert_eq!(cp.metadata.get("commit").map(String::as_str), Some("abc123"));
    }

    #[test]
    fn test_phase_worker_roles() {
        assert_eq!(Phase::Enriching.worker_role(), Some("enrich"));
        assert_eq!(Phase::AwaitingApproval.worker_role(), None);
        assert!(Phase::AwaitingMerge.is_gate());
        assert!(!Phase::Reviewing.is_gate());
    }

    #[test]
    fn test_work_item_labels() {
        let mut item = WorkItem::new("fm-1", "Add login", PrimaryState::Ready);
        assert!(!item.is_approved());
        item.labels.insert(LABEL_APPROVED.to_string());
        assert!(item.is_approved());
        assert!(!item.abort_requested());
    }
}
