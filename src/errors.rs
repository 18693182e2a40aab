//! Typed error hierarchy for the foreman orchestrator.
//!
//! Four enums cover the places where callers must branch on the failure kind:
//! - `SpawnError`: claiming an item and launching its worker
//! - `OrchestratorError`: control-loop and persisted-state failures
//! - `PhaseError`: per-item phase machine outcomes that end in `Blocked`
//! - `SignalParseError`: malformed mailbox messages

use std::path::PathBuf;

use thiserror::Error;

use crate::tracker::{Phase, PrimaryState};

/// Errors from `claim_and_spawn`.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Another actor moved the item first. Nothing was spawned and no retry is counted.
    #[error("Claim lost for item {item}: state changed before the claim")]
    ClaimLost { item: String },

    #[error("Item {item} is not claimable in state {state}")]
    NotClaimable { item: String, state: PrimaryState },

    #[error("No idle worker slot available")]
    PoolFull,

    /// The worker failed to start. Counts toward the failure limit.
    #[error("Failed to launch {role} worker: {source}")]
    Launch {
        role: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Tracker(#[from] anyhow::Error),
}

impl SpawnError {
    /// Whether this failure counts toward the item's retry budget.
    pub fn counts_as_failure(&self) -> bool {
        matches!(self, Self::Launch { .. })
    }
}

/// Errors from the control loop and the persisted state file.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Another instance owns the state file. Fatal to every further write.
    #[error("State file is owned by session {persisted}, not ours ({ours})")]
    StaleOwnership { ours: String, persisted: String },

    #[error("Failed to read state file at {path}: {source}")]
    StateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state file at {path}: {source}")]
    StateWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Tracker error: {0}")]
    Tracker(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn is_stale_ownership(&self) -> bool {
        matches!(self, Self::StaleOwnership { .. })
    }
}

/// Phase machine failures that force an item to `Blocked`.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Item {item} exhausted {iterations} fix iterations without approval")]
    CycleExhausted { item: String, iterations: u32 },

    #[error("Worker for item {item} failed during {phase}: {message}")]
    WorkerFailure {
        item: String,
        phase: Phase,
        message: String,
    },

    #[error("Invalid transition from {phase} on {event}")]
    InvalidTransition { phase: Phase, event: String },
}

/// A signal file that could not be turned into a message.
#[derive(Debug, Error)]
pub enum SignalParseError {
    #[error("Failed to read signal file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed signal file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Signal action '{action}' requires a target")]
    MissingTarget { action: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_error_only_launch_counts_as_failure() {
        let launch = SpawnError::Launch {
            role: "implement".into(),
            source: anyhow::anyhow!("no such file"),
        };
        assert!(launch.counts_as_failure());
        assert!(!SpawnError::ClaimLost { item: "fm-1".into() }.counts_as_failure());
        assert!(!SpawnError::PoolFull.counts_as_failure());
    }

    #[test]
    fn spawn_error_not_claimable_carries_state() {
        let err = SpawnError::NotClaimable {
            item: "fm-7".into(),
            state: PrimaryState::Blocked,
        };
        match &err {
            SpawnError::NotClaimable { item, state } => {
                assert_eq!(item, "fm-7");
                assert_eq!(*state, PrimaryState::Blocked);
            }
            _ => panic!("Expected NotClaimable"),
        }
        assert!(err.to_string().contains("blocked"));
    }

    #[test]
    fn orchestrator_error_stale_ownership_names_both_tokens() {
        let err = OrchestratorError::StaleOwnership {
            ours: "t2".into(),
            persisted: "t1".into(),
        };
        assert!(err.is_stale_ownership());
        let msg = err.to_string();
        assert!(msg.contains("t1"));
        assert!(msg.contains("t2"));
    }

    #[test]
    fn orchestrator_error_state_write_carries_path() {
        let path = PathBuf::from("/work/.foreman/state.json");
        let err = OrchestratorError::StateWrite {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        match &err {
            OrchestratorError::StateWrite { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected StateWrite"),
        }
        assert!(!err.is_stale_ownership());
    }

    #[test]
    fn phase_error_cycle_exhausted_carries_iterations() {
        let err = PhaseError::CycleExhausted {
            item: "fm-3".into(),
            iterations: 3,
        };
        assert!(err.to_string().contains("3 fix iterations"));
    }

    #[test]
    fn signal_parse_error_json_is_matchable() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = SignalParseError::Json {
            path: PathBuf::from("a.json"),
            source,
        };
        assert!(matches!(err, SignalParseError::Json { .. }));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&SpawnError::PoolFull);
        assert_std_error(&OrchestratorError::Other(anyhow::anyhow!("x")));
        assert_std_error(&PhaseError::InvalidTransition {
            phase: Phase::Done,
            event: "claim".into(),
        });
        assert_std_error(&SignalParseError::MissingTarget {
            action: "abort".into(),
        });
    }
}
