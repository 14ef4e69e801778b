//! Real `WorktreeManager`, shelling out to `git worktree`.
//!
//! Grounded on `src/services/worktree_service.rs`'s `Command::new("git")`
//! call shape (`worktree add`, `worktree remove --force`, `rev-parse
//! --git-dir`), narrowed to the four git-facing operations the port needs;
//! the lease and deterministic-path policy stay up in
//! `services::worktree_coordinator`.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::ports::{CreatedWorktree, WorktreeManager};

pub struct GitWorktreeManager {
    repo_root: String,
    workspace_root: String,
}

impl GitWorktreeManager {
    #[must_use]
    pub fn new(repo_root: impl Into<String>, workspace_root: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            workspace_root: workspace_root.into(),
        }
    }

    async fn run_git(&self, args: &[&str]) -> DispatchResult<std::process::Output> {
        let output = Command::new("git")
            .current_dir(&self.repo_root)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(DispatchError::from)?;
        Ok(output)
    }
}

#[async_trait]
impl WorktreeManager for GitWorktreeManager {
    #[instrument(skip(self), fields(path, branch))]
    async fn create_worktree(&self, path: &str, branch: &str, base: &str) -> DispatchResult<CreatedWorktree> {
        let branch_exists = self
            .run_git(&["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .await?
            .status
            .success();

        let output = if branch_exists {
            self.run_git(&["worktree", "add", path, branch]).await?
        } else {
            self.run_git(&["worktree", "add", "-b", branch, path, base]).await?
        };
        if !output.status.success() {
            return Err(DispatchError::Filesystem(std::io::Error::other(
                String::from_utf8_lossy(&output.stderr).to_string(),
            )));
        }
        debug!(path, branch, "worktree created");
        Ok(CreatedWorktree {
            path: path.to_string(),
            branch: Some(branch.to_string()),
        })
    }

    #[instrument(skip(self), fields(path))]
    async fn create_read_only_worktree(&self, path: &str, base: &str) -> DispatchResult<CreatedWorktree> {
        if Path::new(path).exists() {
            return Err(DispatchError::InvalidArgument(format!("worktree already exists at {path}")));
        }
        let output = self.run_git(&["worktree", "add", "--detach", path, base]).await?;
        if !output.status.success() {
            return Err(DispatchError::Filesystem(std::io::Error::other(
                String::from_utf8_lossy(&output.stderr).to_string(),
            )));
        }
        Ok(CreatedWorktree {
            path: path.to_string(),
            branch: None,
        })
    }

    async fn worktree_exists(&self, path: &str) -> DispatchResult<bool> {
        Ok(Path::new(path).exists())
    }

    #[instrument(skip(self), fields(path, force))]
    async fn remove_worktree(&self, path: &str, force: bool) -> DispatchResult<()> {
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path);
        let output = self.run_git(&args).await?;
        if !output.status.success() {
            if force {
                return Err(DispatchError::Filesystem(std::io::Error::other(
                    String::from_utf8_lossy(&output.stderr).to_string(),
                )));
            }
            warn!(path, "worktree remove failed, retrying with --force");
            let output = self.run_git(&["worktree", "remove", "--force", path]).await?;
            if !output.status.success() {
                return Err(DispatchError::Filesystem(std::io::Error::other(
                    String::from_utf8_lossy(&output.stderr).to_string(),
                )));
            }
        }
        Ok(())
    }

    async fn get_default_branch(&self) -> DispatchResult<String> {
        let output = self
            .run_git(&["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
            .await?;
        if output.status.success() {
            let full = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if let Some(name) = full.strip_prefix("origin/") {
                return Ok(name.to_string());
            }
            return Ok(full);
        }
        Ok("main".to_string())
    }

    fn get_workspace_root(&self) -> String {
        self.workspace_root.clone()
    }
}
