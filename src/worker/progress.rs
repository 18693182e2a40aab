//! Out-of-band progress records written by workers.
//!
//! One JSON file per item under `.foreman/progress/`. A record that says
//! `completed` or `failed` ends the worker's phase even if its process is
//! still alive.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tracker::{CheckpointStage, Phase};
use crate::util::{file_safe, write_atomic};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
}

impl ProgressStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// What a finished worker concluded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOutcome {
    Success,
    /// Review approved the artifact.
    Approved,
    /// Review asked for changes.
    ChangesRequested,
    /// Nothing to do; the item can close without an artifact.
    NoOp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecord {
    pub item_id: String,
    pub phase: Phase,
    pub status: ProgressStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WorkerOutcome>,
    /// Last implementation sub-stage the worker finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<CheckpointStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    pub heartbeat: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn running(item_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            item_id: item_id.into(),
            phase,
            status: ProgressStatus::Running,
            outcome: None,
            stage: None,
            message: None,
            artifact_id: None,
            heartbeat: Utc::now(),
        }
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.heartbeat)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressStore {
    dir: PathBuf,
}

impl ProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, item_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_safe(item_id)))
    }

    pub fn read(&self, item_id: &str) -> Result<Option<ProgressRecord>> {
        let path = self.path_for(item_id);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let record = serde_json::from_str(&content).with_context(|| {
                    format!("Failed to parse progress record {}", path.display())
                })?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read progress record {}", path.display())),
        }
    }

    pub fn write(&self, record: &ProgressRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record).context("Failed to encode progress record")?;
        write_atomic(&self.path_for(&record.item_id), &json)
    }

    pub fn remove(&self, item_id: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(item_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove progress record"),
        }
    }

    /// All readable records. Unparseable files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<ProgressRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let pattern = self.dir.join("*.json").to_string_lossy().to_string();
        let mut paths: Vec<PathBuf> = glob::glob(&pattern)
            .context("Failed to read glob pattern")?
            .filter_map(|entry| entry.ok())
            .collect();
        paths.sort();

        let mut records = Vec::new();
        for path in paths {
            let parsed = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_json::from_str::<ProgressRecord>(&c).map_err(Into::into));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable progress record")
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_missing_record_is_none() {
        let dir = tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        assert!(store.read("fm-1").unwrap().is_none());
        store.remove("fm-1").unwrap();
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        let mut record = ProgressRecord::running("fm-2", Phase::Implementing);
        record.stage = Some(CheckpointStage::Tested);
        store.write(&record).unwrap();

        let back = store.read("fm-2").unwrap().unwrap();
        assert_eq!(back.status, ProgressStatus::Running);
        assert_eq!(back.stage, Some(CheckpointStage::Tested));
    }

    #[test]
    fn test_parses_worker_written_json() {
        let dir = tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        std::fs::write(
            store.path_for("fm-3"),
            r#"{"item_id":"fm-3","phase":"reviewing","status":"completed",
                "outcome":"changes_requested","heartbeat":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let record = store.read("fm-3").unwrap().unwrap();
        assert!(record.status.is_finished());
        assert_eq!(record.outcome, Some(WorkerOutcome::ChangesRequested));
    }

    #[test]
    fn test_list_skips_malformed_files() {
        let dir = tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        store
            .write(&ProgressRecord::running("fm-1", Phase::Enriching))
            .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        let records = store.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item_id, "fm-1");
    }
}
