//! OS-process worker host on `tokio::process`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Child;

use super::{SpawnRequest, WorkerHandle, WorkerHost};

/// Spawns the configured worker command as child processes.
///
/// Children started by this host are tracked by pid and reaped with
/// `try_wait`. Handles that outlive a restart ("adopted" pids) are probed
/// with a zero signal instead.
pub struct ProcessHost {
    command: String,
    base_args: Vec<String>,
    log_dir: PathBuf,
    children: Mutex<HashMap<u32, Child>>,
    exited: Mutex<HashMap<u32, i32>>,
}

impl ProcessHost {
    pub fn new(command: impl Into<String>, base_args: Vec<String>, log_dir: PathBuf) -> Self {
        Self {
            command: command.into(),
            base_args,
            log_dir,
            children: Mutex::new(HashMap::new()),
            exited: Mutex::new(HashMap::new()),
        }
    }

    fn log_file(&self, request: &SpawnRequest) -> Result<std::fs::File> {
        std::fs::create_dir_all(&self.log_dir).with_context(|| {
            format!("Failed to create worker log dir {}", self.log_dir.display())
        })?;
        let label = match &request.item_id {
            Some(id) => format!("{}-{}", crate::util::file_safe(id), request.role),
            None => request.role.clone(),
        };
        let path = self.log_dir.join(format!(
            "{}-{}.log",
            label,
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")
        ));
        std::fs::File::create(&path)
            .with_context(|| format!("Failed to create worker log {}", path.display()))
    }

    /// Reap a tracked child if it has exited. `None` while it still runs,
    /// or when the pid is not one of ours.
    fn poll_child(&self, pid: u32) -> Option<Option<i32>> {
        let mut children = self.children.lock().ok()?;
        let child = children.get_mut(&pid)?;
        match child.try_wait() {
            Ok(None) => Some(None),
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(-1);
                children.remove(&pid);
                if let Ok(mut exited) = self.exited.lock() {
                    exited.insert(pid, code);
                }
                Some(Some(code))
            }
            Err(e) => {
                tracing::warn!(pid, error = %e, "Failed to poll worker process");
                children.remove(&pid);
                Some(Some(-1))
            }
        }
    }

    fn recorded_exit(&self, pid: u32) -> Option<i32> {
        self.exited.lock().ok()?.get(&pid).copied()
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate_pid(pid: u32) -> Result<()> {
    let pid = i32::try_from(pid).context("pid out of range")?;
    // SAFETY: plain SIGTERM to a pid we recorded ourselves.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err).context("Failed to signal worker process");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate_pid(_pid: u32) -> Result<()> {
    anyhow::bail!("Cannot terminate adopted workers on this platform")
}

#[async_trait]
impl WorkerHost for ProcessHost {
    async fn spawn(&self, request: &SpawnRequest) -> Result<WorkerHandle> {
        let log = self.log_file(request)?;
        let log_err = log.try_clone().context("Failed to clone worker log handle")?;

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.base_args)
            .args(request.argv())
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(dir) = &request.workdir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to start worker command '{}'", self.command))?;
        let pid = child
            .id()
            .context("Worker exited before its pid could be read")?;

        self.children
            .lock()
            .map_err(|e| anyhow::anyhow!("Worker table lock poisoned: {}", e))?
            .insert(pid, child);

        tracing::debug!(pid, role = %request.role, item_id = ?request.item_id, "Spawned worker");
        Ok(WorkerHandle::from_pid(pid))
    }

    async fn is_alive(&self, handle: &WorkerHandle) -> bool {
        let Some(pid) = handle.pid() else {
            return false;
        };
        match self.poll_child(pid) {
            Some(None) => true,
            Some(Some(_)) => false,
            None if self.recorded_exit(pid).is_some() => false,
            None => pid_alive(pid),
        }
    }

    async fn exit_code(&self, handle: &WorkerHandle) -> Option<i32> {
        let pid = handle.pid()?;
        match self.poll_child(pid) {
            Some(code) => code,
            None => self.recorded_exit(pid),
        }
    }

    async fn destroy(&self, handle: &WorkerHandle) -> Result<()> {
        let Some(pid) = handle.pid() else {
            return Ok(());
        };
        let child = self
            .children
            .lock()
            .map_err(|e| anyhow::anyhow!("Worker table lock poisoned: {}", e))?
            .remove(&pid);
        match child {
            Some(mut child) => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(pid, error = %e, "Failed to kill worker process");
                }
                // Reap without blocking the loop on a slow exit.
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            None if self.recorded_exit(pid).is_none() && pid_alive(pid) => {
                terminate_pid(pid)?;
            }
            None => {}
        }
        // Destroyed workers read as exited from here on.
        if let Ok(mut exited) = self.exited.lock() {
            exited.entry(pid).or_insert(-1);
        }
        tracing::debug!(pid, "Destroyed worker");
        Ok(())
    }
}
