//! Worktree: an isolated filesystem checkout, leased to at most one session.
//!
//! Grounded on the teacher's `Worktree`/`WorktreeStatus` lifecycle-method shape
//! (`activate`/`complete`/`fail`/`remove`) but reduced to the fields §3 names:
//! `path`, `branch?`, `readOnly`, plus the lease that the Worktree Coordinator
//! (not this model) is responsible for granting and reclaiming.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The key a reusable worktree is addressed by. Deterministic so crash
/// recovery can re-resolve the same path without consulting any stored state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorktreeKey {
    /// A per-task worktree, keyed by `(agentName, taskId)`.
    Task { agent_name: String, task_id: Uuid },
    /// A read-only triage worktree, keyed by `(agentName, purpose)`.
    ReadOnly { agent_name: String, purpose: String },
}

/// An isolated filesystem checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worktree {
    pub key: WorktreeKey,
    pub path: String,
    pub branch: Option<String>,
    /// Derived from creation mode: `true` only for worktrees created via
    /// `createReadOnlyWorktree` (detached HEAD).
    pub read_only: bool,
    /// The session currently holding the lease, if any. A worktree with
    /// `lease = None` is a reusable resource.
    pub lease: Option<Uuid>,
}

impl Worktree {
    #[must_use]
    pub const fn new_task(key: WorktreeKey, path: String, branch: String) -> Self {
        Self {
            key,
            path,
            branch: Some(branch),
            read_only: false,
            lease: None,
        }
    }

    #[must_use]
    pub const fn new_read_only(key: WorktreeKey, path: String) -> Self {
        Self {
            key,
            path,
            branch: None,
            read_only: true,
            lease: None,
        }
    }

    #[must_use]
    pub const fn is_leased(&self) -> bool {
        self.lease.is_some()
    }

    /// Grants the lease to `session_id`.
    ///
    /// # Errors
    /// Returns the id of the current holder if the worktree is already leased
    /// — the coordinator must never hand out a worktree in use.
    pub fn lease_to(&mut self, session_id: Uuid) -> Result<(), Uuid> {
        if let Some(holder) = self.lease {
            if holder != session_id {
                return Err(holder);
            }
        }
        self.lease = Some(session_id);
        Ok(())
    }

    /// Releases the lease. Called when the leasing session ends.
    pub fn release(&mut self) {
        self.lease = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> WorktreeKey {
        WorktreeKey::Task {
            agent_name: "w1".into(),
            task_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn new_task_worktree_is_not_read_only_and_unleased() {
        let wt = Worktree::new_task(key(), "/wt/w1/t1".into(), "agent/w1/t1".into());
        assert!(!wt.read_only);
        assert!(!wt.is_leased());
    }

    #[test]
    fn new_read_only_worktree_has_no_branch() {
        let k = WorktreeKey::ReadOnly {
            agent_name: "w1".into(),
            purpose: "triage".into(),
        };
        let wt = Worktree::new_read_only(k, "/wt/w1/triage".into());
        assert!(wt.read_only);
        assert!(wt.branch.is_none());
    }

    #[test]
    fn lease_refuses_a_second_holder() {
        let mut wt = Worktree::new_task(key(), "/wt".into(), "b".into());
        let holder = Uuid::new_v4();
        wt.lease_to(holder).unwrap();
        let other = Uuid::new_v4();
        let err = wt.lease_to(other).unwrap_err();
        assert_eq!(err, holder);
    }

    #[test]
    fn release_then_release_allows_new_holder() {
        let mut wt = Worktree::new_task(key(), "/wt".into(), "b".into());
        let first = Uuid::new_v4();
        wt.lease_to(first).unwrap();
        wt.release();
        let second = Uuid::new_v4();
        wt.lease_to(second).unwrap();
        assert_eq!(wt.lease, Some(second));
    }
}
