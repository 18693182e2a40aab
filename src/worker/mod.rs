//! Worker spawn/observe interface.
//!
//! The orchestrator knows a worker only through this narrow contract:
//! start it, ask whether it is alive, read its exit code, destroy it.
//! Everything else a worker says arrives out-of-band through its
//! [`progress::ProgressRecord`].

pub mod process;
pub mod progress;

#[cfg(test)]
pub mod fake;

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use process::ProcessHost;
pub use progress::{ProgressRecord, ProgressStatus, ProgressStore, WorkerOutcome};

/// Opaque reference to a running worker, rendered as `pid:<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerHandle(String);

impl WorkerHandle {
    pub fn from_pid(pid: u32) -> Self {
        Self(format!("pid:{}", pid))
    }

    /// Wrap a raw string without validation, e.g. one read back from disk.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn pid(&self) -> Option<u32> {
        self.0
            .strip_prefix("pid:")
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|pid| *pid > 0)
    }

    /// A handle that fails this check was never backed by a real process.
    pub fn is_well_formed(&self) -> bool {
        self.pid().is_some()
    }
}

impl std::fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to start one worker.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    /// Worker role, passed as the first argument (`implement`, `review`, `proposer`, ...).
    pub role: String,
    pub item_id: Option<String>,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl SpawnRequest {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            ..Default::default()
        }
    }

    /// Request bound to an item: adds `--item <id>` and `FOREMAN_ITEM_ID`.
    pub fn for_item(role: impl Into<String>, item_id: &str) -> Self {
        let mut req = Self::new(role);
        req.item_id = Some(item_id.to_string());
        req.args.extend(["--item".to_string(), item_id.to_string()]);
        req.env
            .push(("FOREMAN_ITEM_ID".to_string(), item_id.to_string()));
        req
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_workdir(mut self, workdir: PathBuf) -> Self {
        self.workdir = Some(workdir);
        self
    }

    /// Full argument vector: role first, then request args.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.role.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

#[async_trait]
pub trait WorkerHost: Send + Sync {
    async fn spawn(&self, request: &SpawnRequest) -> Result<WorkerHandle>;

    async fn is_alive(&self, handle: &WorkerHandle) -> bool;

    /// Exit code once the worker has exited and the host observed it.
    async fn exit_code(&self, handle: &WorkerHandle) -> Option<i32>;

    async fn destroy(&self, handle: &WorkerHandle) -> Result<()>;
}
