//! The git worktree manager contract (§1, §4.6): an opaque service that
//! creates/removes isolated checkout directories and reports whether a path
//! still exists.
//!
//! Grounded on `src/services/worktree_service.rs`'s git-shell-out operations
//! (`create_worktree`, `cleanup_task_worktree`, `is_valid_worktree`), pulled
//! down one layer so `services::worktree_coordinator` can own the lease
//! discipline and deterministic-path policy while this port owns only the
//! mechanical git calls.

use async_trait::async_trait;

use crate::domain::errors::DispatchResult;

/// Returned by `create_worktree`/`create_read_only_worktree`.
#[derive(Debug, Clone)]
pub struct CreatedWorktree {
    pub path: String,
    pub branch: Option<String>,
}

#[async_trait]
pub trait WorktreeManager: Send + Sync {
    /// Creates a branch-backed worktree at `path`, checked out from `base`.
    async fn create_worktree(&self, path: &str, branch: &str, base: &str) -> DispatchResult<CreatedWorktree>;

    /// Creates a detached-HEAD worktree at `path`, checked out from `base`.
    /// Fails with `DispatchError::InvalidArgument` (surfaced by the caller as
    /// `WORKTREE_EXISTS`) if `path` already exists.
    async fn create_read_only_worktree(&self, path: &str, base: &str) -> DispatchResult<CreatedWorktree>;

    async fn worktree_exists(&self, path: &str) -> DispatchResult<bool>;

    async fn remove_worktree(&self, path: &str, force: bool) -> DispatchResult<()>;

    async fn get_default_branch(&self) -> DispatchResult<String>;

    fn get_workspace_root(&self) -> String;
}
