//! Graceful-stop control: the `.foreman/STOP` marker file plus an in-process
//! trigger for Ctrl-C and `shutdown` signals.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;

/// Longest single sleep between marker-file checks while waiting.
const MARKER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Write the STOP marker. Safe to call when one already exists.
pub fn request_stop(stop_file: &Path, reason: &str) -> Result<()> {
    if let Some(parent) = stop_file.parent() {
        std::fs::create_dir_all(parent).context("Failed to create .foreman directory")?;
    }
    std::fs::write(stop_file, reason).context("Failed to create stop marker")?;
    Ok(())
}

#[derive(Clone)]
pub struct Shutdown {
    stop_file: PathBuf,
    triggered: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new(stop_file: PathBuf) -> Self {
        Self {
            stop_file,
            triggered: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Request shutdown from inside the process.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.triggered.load(Ordering::SeqCst) || self.stop_file.exists()
    }

    /// Remove a stale marker, e.g. at startup after a previous stop.
    pub fn clear_marker(&self) -> Result<()> {
        match std::fs::remove_file(&self.stop_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove stop marker"),
        }
    }

    /// Sleep for `duration` unless shutdown is requested first.
    /// Returns true when woken by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.is_requested() {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let step = (deadline - now).min(MARKER_CHECK_INTERVAL);
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Install a Ctrl-C handler that triggers shutdown.
    pub fn listen_for_ctrl_c(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; shutting down after current iteration");
                this.trigger();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_marker_file_requests_shutdown() {
        let dir = tempdir().unwrap();
        let stop = dir.path().join(".foreman/STOP");
        let shutdown = Shutdown::new(stop.clone());
        assert!(!shutdown.is_requested());

        request_stop(&stop, "operator").unwrap();
        assert!(shutdown.is_requested());

        shutdown.clear_marker().unwrap();
        assert!(!shutdown.is_requested());
        shutdown.clear_marker().unwrap();
    }

    #[tokio::test]
    async fn test_sleep_is_interrupted_by_trigger() {
        let dir = tempdir().unwrap();
        let shutdown = Shutdown::new(dir.path().join("STOP"));
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        let woken = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(woken);
    }

    #[tokio::test]
    async fn test_sleep_runs_to_completion() {
        let dir = tempdir().unwrap();
        let shutdown = Shutdown::new(dir.path().join("STOP"));
        assert!(!shutdown.sleep(Duration::from_millis(20)).await);
    }
}
