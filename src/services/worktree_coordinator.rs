//! Worktree Coordinator: deterministic isolated working directories and
//! their reclamation (§4.6).
//!
//! A thin core layer over a `WorktreeManager` port (the opaque git service
//! from §1); path/branch derivation reuses the teacher's
//! `generate_branch_metadata`-style pure function, parameterized on
//! `(agentName, taskId)` or `(agentName, purpose)` per the two creation
//! operations.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::errors::DispatchResult;
use crate::domain::models::{Worktree, WorktreeKey};
use crate::domain::ports::WorktreeManager;

/// Deterministic path for a per-task worktree: `(agentName, taskId)`.
#[must_use]
pub fn task_worktree_path(workspace_root: &str, agent_name: &str, task_id: Uuid) -> String {
    format!("{workspace_root}/{agent_name}/{task_id}")
}

/// Deterministic branch name for a per-task worktree.
#[must_use]
pub fn task_branch_name(agent_name: &str, task_id: Uuid) -> String {
    format!("agent/{agent_name}/{task_id}")
}

/// Deterministic path for a read-only triage worktree: `(agentName, purpose)`.
#[must_use]
pub fn read_only_worktree_path(workspace_root: &str, agent_name: &str, purpose: &str) -> String {
    format!("{workspace_root}/{agent_name}/{purpose}")
}

pub struct WorktreeCoordinator {
    manager: Arc<dyn WorktreeManager>,
    leases: Arc<Mutex<HashMap<WorktreeKey, Worktree>>>,
}

impl WorktreeCoordinator {
    #[must_use]
    pub fn new(manager: Arc<dyn WorktreeManager>) -> Self {
        Self {
            manager,
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[tracing::instrument(skip(self), fields(agent_name, task_id = %task_id))]
    pub async fn create_worktree(&self, agent_name: &str, task_id: Uuid) -> DispatchResult<Worktree> {
        let root = self.manager.get_workspace_root();
        let path = task_worktree_path(&root, agent_name, task_id);
        let branch = task_branch_name(agent_name, task_id);
        let base = self.manager.get_default_branch().await?;
        let created = self.manager.create_worktree(&path, &branch, &base).await?;

        let key = WorktreeKey::Task {
            agent_name: agent_name.to_string(),
            task_id,
        };
        let worktree = Worktree::new_task(key.clone(), created.path, created.branch.unwrap_or(branch));
        self.leases.lock().await.insert(key, worktree.clone());
        Ok(worktree)
    }

    /// Creates a detached-HEAD triage worktree. If the deterministic path
    /// already exists from a previous crash, this fails with
    /// `DispatchError::InvalidArgument`; the caller is expected to
    /// force-remove and retry, per §4.6.
    #[tracing::instrument(skip(self), fields(agent_name, purpose))]
    pub async fn create_read_only_worktree(&self, agent_name: &str, purpose: &str) -> DispatchResult<Worktree> {
        let root = self.manager.get_workspace_root();
        let path = read_only_worktree_path(&root, agent_name, purpose);
        let base = self.manager.get_default_branch().await?;
        let created = self.manager.create_read_only_worktree(&path, &base).await?;

        let key = WorktreeKey::ReadOnly {
            agent_name: agent_name.to_string(),
            purpose: purpose.to_string(),
        };
        let worktree = Worktree::new_read_only(key.clone(), created.path);
        self.leases.lock().await.insert(key, worktree.clone());
        Ok(worktree)
    }

    pub async fn worktree_exists(&self, path: &str) -> DispatchResult<bool> {
        self.manager.worktree_exists(path).await
    }

    pub async fn remove_worktree(&self, key: &WorktreeKey, force: bool) -> DispatchResult<()> {
        let path = {
            let mut leases = self.leases.lock().await;
            let Some(worktree) = leases.remove(key) else {
                return Ok(());
            };
            worktree.path
        };
        self.manager.remove_worktree(&path, force).await
    }

    pub async fn get_default_branch(&self) -> DispatchResult<String> {
        self.manager.get_default_branch().await
    }

    #[must_use]
    pub fn get_workspace_root(&self) -> String {
        self.manager.get_workspace_root()
    }

    /// Grants the worktree identified by `key` to `session_id`. If the
    /// stored path has been garbage-collected since, the caller should
    /// recreate it and update the owning task's metadata — this method only
    /// reports that the worktree is missing via `Ok(None)`.
    pub async fn lease(&self, key: &WorktreeKey, session_id: Uuid) -> DispatchResult<Option<Result<(), Uuid>>> {
        let mut leases = self.leases.lock().await;
        let Some(worktree) = leases.get_mut(key) else {
            return Ok(None);
        };
        if !self.manager.worktree_exists(&worktree.path).await? {
            return Ok(None);
        }
        Ok(Some(worktree.lease_to(session_id)))
    }

    pub async fn release(&self, key: &WorktreeKey) {
        if let Some(worktree) = self.leases.lock().await.get_mut(key) {
            worktree.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fakes::FakeWorktreeManager;

    fn coordinator() -> WorktreeCoordinator {
        WorktreeCoordinator::new(Arc::new(FakeWorktreeManager::new()))
    }

    #[test]
    fn paths_are_deterministic_for_the_same_inputs() {
        let task_id = Uuid::new_v4();
        let a = task_worktree_path("/ws", "w1", task_id);
        let b = task_worktree_path("/ws", "w1", task_id);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn create_worktree_registers_an_unleased_lease() {
        let coord = coordinator();
        let task_id = Uuid::new_v4();
        let wt = coord.create_worktree("w1", task_id).await.unwrap();
        assert!(!wt.is_leased());
        let key = WorktreeKey::Task { agent_name: "w1".into(), task_id };
        let result = coord.lease(&key, Uuid::new_v4()).await.unwrap();
        assert!(matches!(result, Some(Ok(()))));
    }

    #[tokio::test]
    async fn creating_a_read_only_worktree_twice_fails_the_second_time() {
        let coord = coordinator();
        coord.create_read_only_worktree("w1", "triage").await.unwrap();
        let err = coord.create_read_only_worktree("w1", "triage").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn lease_on_missing_key_returns_none() {
        let coord = coordinator();
        let key = WorktreeKey::Task { agent_name: "w1".into(), task_id: Uuid::new_v4() };
        assert!(coord.lease(&key, Uuid::new_v4()).await.unwrap().is_none());
    }
}
