//! Ticket-tracker interface.
//!
//! The orchestrator treats the tracker as a remote state/query service. The
//! only way to change an item's [`PrimaryState`] is
//! [`Tracker::compare_and_set_state`], which must be atomic: two claimants
//! racing on the same item see exactly one `true`.

pub mod db;
pub mod models;

use anyhow::Result;
use async_trait::async_trait;

pub use db::{DbHandle, TrackerDb};
pub use models::{
    ChangeArtifact, CheckpointRecord, CheckpointStage, Comment, LABEL_ABORT, LABEL_APPROVED,
    MergeOutcome, Phase, PrimaryState, ReviewState, WorkItem,
};

#[async_trait]
pub trait Tracker: Send + Sync {
    /// Items currently in `state`, ordered by priority then id.
    async fn list_items(&self, state: PrimaryState) -> Result<Vec<WorkItem>>;

    async fn get_item(&self, id: &str) -> Result<Option<WorkItem>>;

    /// Test-and-set on the item's state. Returns `false` without touching the
    /// item when its current state is not `expected`.
    async fn compare_and_set_state(
        &self,
        id: &str,
        expected: PrimaryState,
        next: PrimaryState,
    ) -> Result<bool>;

    /// Persist phase, checkpoint and loop counters. Never touches `primary_state`.
    async fn save_progress(&self, item: &WorkItem) -> Result<()>;

    async fn add_label(&self, id: &str, label: &str) -> Result<()>;

    async fn remove_label(&self, id: &str, label: &str) -> Result<()>;

    async fn add_comment(&self, id: &str, body: &str) -> Result<()>;

    async fn list_comments(&self, id: &str) -> Result<Vec<Comment>>;

    async fn list_artifacts(&self, state: ReviewState) -> Result<Vec<ChangeArtifact>>;

    /// Most recent artifact produced for an item.
    async fn artifact_for_item(&self, item_id: &str) -> Result<Option<ChangeArtifact>>;

    async fn merge_artifact(&self, artifact_id: &str) -> Result<MergeOutcome>;
}
