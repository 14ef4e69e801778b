//! Deterministic fakes for `ProcessLauncher` and `WorktreeManager`, used by
//! unit and integration tests so nothing ever touches a real subprocess or
//! the filesystem.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::ports::{CreatedWorktree, LaunchOpts, LaunchedProcess, ProcessLauncher, SpawnerEvent, WorktreeManager};

/// A launcher that hands back a live channel pair and never spawns a real
/// process. Tests drive the event stream themselves via `push_event`, or
/// accept the default behavior of emitting a single clean `Exit` on drop of
/// the returned sender half, which this fake does not do automatically —
/// callers own the channel's lifetime.
pub struct FakeProcessLauncher {
    next_pid: AtomicU32,
    alive: Mutex<HashMap<u32, bool>>,
    /// When set, emitted as the very first event on every `launch()`, as a
    /// stand-in for a real provider's `system`/`init` line. Lets tests
    /// exercise the Spawner's provider-session-id capture without a real
    /// subprocess.
    initial_system_event: Option<serde_json::Value>,
}

impl FakeProcessLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            alive: Mutex::new(HashMap::new()),
            initial_system_event: None,
        }
    }

    /// Builder variant that emits `event` as the first `SpawnerEvent::System`
    /// on every launch.
    #[must_use]
    pub fn with_initial_system_event(event: serde_json::Value) -> Self {
        Self {
            initial_system_event: Some(event),
            ..Self::new()
        }
    }
}

impl Default for FakeProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLauncher for FakeProcessLauncher {
    async fn launch(&self, _opts: LaunchOpts) -> DispatchResult<LaunchedProcess> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.alive.lock().await.insert(pid, true);
        let (_stdin_tx, _stdin_rx) = mpsc::channel::<String>(16);
        let (events_tx, events_rx) = mpsc::channel::<SpawnerEvent>(16);
        // Nothing reads `_stdin_rx` in the fake; it is simply kept alive by
        // being moved into the returned struct's sender half on the other
        // end. The events channel starts empty save for an optional seeded
        // system event: tests push anything further themselves.
        if let Some(event) = self.initial_system_event.clone() {
            let _ = events_tx.send(SpawnerEvent::System(event)).await;
        }
        drop(events_tx);
        Ok(LaunchedProcess {
            pid: Some(pid),
            events: events_rx,
            stdin: _stdin_tx,
        })
    }

    async fn terminate(&self, pid: u32, _graceful: bool) -> DispatchResult<()> {
        self.alive.lock().await.insert(pid, false);
        Ok(())
    }

    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

/// A worktree manager that tracks paths in memory, for exercising the
/// Worktree Coordinator's lease and path-policy logic without git.
pub struct FakeWorktreeManager {
    existing: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl FakeWorktreeManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            existing: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for FakeWorktreeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorktreeManager for FakeWorktreeManager {
    async fn create_worktree(&self, path: &str, branch: &str, _base: &str) -> DispatchResult<CreatedWorktree> {
        self.existing
            .lock()
            .await
            .insert(path.to_string(), Some(branch.to_string()));
        Ok(CreatedWorktree {
            path: path.to_string(),
            branch: Some(branch.to_string()),
        })
    }

    async fn create_read_only_worktree(&self, path: &str, _base: &str) -> DispatchResult<CreatedWorktree> {
        let mut existing = self.existing.lock().await;
        if existing.contains_key(path) {
            return Err(DispatchError::InvalidArgument(format!("worktree already exists at {path}")));
        }
        existing.insert(path.to_string(), None);
        Ok(CreatedWorktree {
            path: path.to_string(),
            branch: None,
        })
    }

    async fn worktree_exists(&self, path: &str) -> DispatchResult<bool> {
        Ok(self.existing.lock().await.contains_key(path))
    }

    async fn remove_worktree(&self, path: &str, _force: bool) -> DispatchResult<()> {
        self.existing.lock().await.remove(path);
        Ok(())
    }

    async fn get_default_branch(&self) -> DispatchResult<String> {
        Ok("main".to_string())
    }

    fn get_workspace_root(&self) -> String {
        "/workspace".to_string()
    }
}
