//! Single-writer ownership of the state file.
//!
//! Each orchestrator start installs a fresh session token. Every later write
//! re-reads the persisted token under an exclusive file lock and refuses to
//! write when it is not ours. A refused write revokes this store for good.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;

use super::state::{OrchestratorState, WorkerSlot};
use crate::errors::OrchestratorError;
use crate::foreman_config::Mode;
use crate::util::write_atomic;

pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
    token: String,
    revoked: bool,
}

/// Exclusive advisory lock on the sidecar lock file, released on drop.
struct LockGuard(File);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

impl StateStore {
    /// Take ownership of the state file with a new session token.
    ///
    /// Slots, retry bookkeeping and role state from a previous run are kept
    /// so recovery can reconcile them. Working slots beyond `max_workers`
    /// are left out of the written document and returned last; their
    /// workers still run and their items are still InProgress.
    pub fn acquire(
        path: &Path,
        mode: Mode,
        max_workers: usize,
    ) -> Result<(Self, OrchestratorState, Vec<WorkerSlot>), OrchestratorError> {
        let token = uuid::Uuid::new_v4().to_string();
        let store = Self {
            path: path.to_path_buf(),
            lock_path: lock_path_for(path),
            token: token.clone(),
            revoked: false,
        };

        let _lock = store.lock()?;
        let mut state = match read_state(path)? {
            Some(previous) => {
                tracing::info!(
                    previous_session = %previous.session_token,
                    session = %token,
                    "Taking over orchestrator state"
                );
                previous
            }
            None => OrchestratorState::new(String::new(), mode, max_workers),
        };
        state.session_token = token;
        state.mode = mode;
        let surplus = state.resize_slots(max_workers);
        if !surplus.is_empty() {
            tracing::warn!(surplus = surplus.len(), max_workers, "More working slots than max_workers; dropping the excess");
        }
        state.updated_at = Utc::now();
        store.write(&state)?;
        Ok((store, state, surplus))
    }

    /// Read the state file without taking ownership.
    pub fn load(path: &Path) -> Result<Option<OrchestratorState>, OrchestratorError> {
        read_state(path)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked
    }

    /// Write `state` if we still own the file.
    pub fn commit(&mut self, state: &mut OrchestratorState) -> Result<(), OrchestratorError> {
        if self.revoked {
            return Err(OrchestratorError::StaleOwnership {
                ours: self.token.clone(),
                persisted: "<revoked>".to_string(),
            });
        }

        let _lock = self.lock()?;
        if let Some(persisted) = read_token(&self.path)?
            && persisted != self.token
        {
            self.revoked = true;
            tracing::error!(ours = %self.token, persisted = %persisted, "State file owned by another session; refusing to write");
            return Err(OrchestratorError::StaleOwnership {
                ours: self.token.clone(),
                persisted,
            });
        }

        state.session_token = self.token.clone();
        state.updated_at = Utc::now();
        self.write(state)
    }

    fn lock(&self) -> Result<LockGuard, OrchestratorError> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| OrchestratorError::StateWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|source| OrchestratorError::StateWrite {
                path: self.lock_path.clone(),
                source,
            })?;
        file.lock_exclusive()
            .map_err(|source| OrchestratorError::StateWrite {
                path: self.lock_path.clone(),
                source,
            })?;
        Ok(LockGuard(file))
    }

    fn write(&self, state: &OrchestratorState) -> Result<(), OrchestratorError> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| OrchestratorError::Other(anyhow::anyhow!("Failed to encode state: {}", e)))?;
        write_atomic(&self.path, &json).map_err(OrchestratorError::Other)
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

fn read_state(path: &Path) -> Result<Option<OrchestratorState>, OrchestratorError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(OrchestratorError::StateRead {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let state = serde_json::from_str(&content).map_err(|e| {
        OrchestratorError::Other(anyhow::anyhow!(
            "Failed to parse state file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(Some(state))
}

#[derive(serde::Deserialize)]
struct TokenOnly {
    session_token: String,
}

fn read_token(path: &Path) -> Result<Option<String>, OrchestratorError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(OrchestratorError::StateRead {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let parsed: TokenOnly = serde_json::from_str(&content).map_err(|e| {
        OrchestratorError::Other(anyhow::anyhow!("Unreadable session token: {}", e))
    })?;
    Ok(Some(parsed.session_token))
}
