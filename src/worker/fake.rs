//! In-memory worker host for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use async_trait::async_trait;

use super::{SpawnRequest, WorkerHandle, WorkerHost};

#[derive(Default)]
struct FakeState {
    fail_remaining: u32,
    fail_always: bool,
    spawned: Vec<SpawnRequest>,
    handles: Vec<WorkerHandle>,
    attempts: u32,
    running: HashMap<u32, Option<i32>>,
    destroyed: Vec<WorkerHandle>,
}

/// Scripted host: spawns succeed unless told to fail, and workers stay
/// alive until a test calls [`FakeHost::finish`].
pub struct FakeHost {
    next_pid: AtomicU32,
    state: Mutex<FakeState>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn fail_next(&self, n: u32) {
        self.state.lock().unwrap().fail_remaining = n;
    }

    pub fn fail_always(&self) {
        self.state.lock().unwrap().fail_always = true;
    }

    /// Spawn calls made, including failed ones.
    pub fn attempts(&self) -> u32 {
        self.state.lock().unwrap().attempts
    }

    pub fn spawned(&self) -> Vec<SpawnRequest> {
        self.state.lock().unwrap().spawned.clone()
    }

    /// Handles of successful spawns, in spawn order.
    pub fn spawned_handles(&self) -> Vec<WorkerHandle> {
        self.state.lock().unwrap().handles.clone()
    }

    pub fn destroyed(&self) -> Vec<WorkerHandle> {
        self.state.lock().unwrap().destroyed.clone()
    }

    /// Mark the worker's process as exited with `code`.
    pub fn finish(&self, handle: &WorkerHandle, code: i32) {
        if let Some(pid) = handle.pid() {
            self.state.lock().unwrap().running.insert(pid, Some(code));
        }
    }
}

#[async_trait]
impl WorkerHost for FakeHost {
    async fn spawn(&self, request: &SpawnRequest) -> Result<WorkerHandle> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if state.fail_always {
            anyhow::bail!("worker command not found");
        }
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            anyhow::bail!("worker command not found");
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        state.running.insert(pid, None);
        state.spawned.push(request.clone());
        let handle = WorkerHandle::from_pid(pid);
        state.handles.push(handle.clone());
        Ok(handle)
    }

    async fn is_alive(&self, handle: &WorkerHandle) -> bool {
        let Some(pid) = handle.pid() else {
            return false;
        };
        matches!(self.state.lock().unwrap().running.get(&pid), Some(None))
    }

    async fn exit_code(&self, handle: &WorkerHandle) -> Option<i32> {
        let pid = handle.pid()?;
        self.state.lock().unwrap().running.get(&pid).copied().flatten()
    }

    async fn destroy(&self, handle: &WorkerHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(pid) = handle.pid() {
            state.running.insert(pid, Some(-1));
        }
        state.destroyed.push(handle.clone());
        Ok(())
    }
}
