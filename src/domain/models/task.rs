//! Task: the unit of dispatchable work, and the orchestrator metadata nested
//! under it.
//!
//! Grounded on the teacher's `Task`/`TaskStatus` shape (state machine with
//! `transition_to`/`force_status`, bounded rolling history) but re-scoped to the
//! fields the dispatcher actually reads and writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of entries kept in a task's `sessionHistory`. Oldest entries
/// are evicted first once the cap is reached.
pub const MAX_SESSION_HISTORY: usize = 20;

/// The subset of task lifecycle the dispatcher touches.
///
/// ```text
/// OPEN → IN_PROGRESS → REVIEW → CLOSED
/// ```
/// plus the reconciliation path that can push a `CLOSED` task with an
/// unsatisfied merge back to `REVIEW` (see `services::merge_pipeline`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Open,
    InProgress,
    Review,
    Closed,
}

impl TaskStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::InProgress => "IN_PROGRESS",
            Self::Review => "REVIEW",
            Self::Closed => "CLOSED",
        }
    }

    /// The set of statuses this status may transition to under the checked
    /// state machine. Reconciliation (`CLOSED -> REVIEW`) is deliberately not
    /// in this table — it is only ever applied via `force_status`, since it
    /// bypasses the normal forward-only flow.
    #[must_use]
    pub const fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Open => &[Self::InProgress],
            Self::InProgress => &[Self::Review],
            Self::Review => &[Self::Closed],
            Self::Closed => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Outcome of the merge pipeline's pre-steward sync step (`git fetch` +
/// `git merge origin/<default>`), persisted on `orchestrator.lastSyncResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SyncResult {
    Success,
    Conflicts { files: Vec<String> },
    Error { message: String },
}

/// The merge pipeline's own state machine, independent of `TaskStatus`.
///
/// ```text
/// pending → testing → merging → merged
///    ^         |          |
///    |         v          v
///    +-- test_failed   conflict
///                         |
///                         v
///                      failed (terminal unless reconciled)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Pending,
    Testing,
    Merging,
    Conflict,
    TestFailed,
    Failed,
    Merged,
}

impl Default for MergeStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl MergeStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Failed)
    }
}

/// One entry in a task's `sessionHistory`: every session ever spawned against
/// it, named exactly as §6's persisted-state-layout requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHistoryEntry {
    pub session_id: Uuid,
    pub provider_session_id: Option<String>,
    pub agent_id: Uuid,
    pub agent_name: String,
    pub agent_role: String,
    pub started_at: DateTime<Utc>,
}

/// Orchestrator-owned metadata nested under a task. Kept as a distinct struct
/// (rather than flattened onto `Task`) so `listAssignments` can expose it
/// alongside the task as the spec requires, and so ordinary task queries never
/// need to know this subtree exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorMeta {
    pub worktree: Option<String>,
    pub branch: Option<String>,
    pub handoff_worktree: Option<String>,
    pub handoff_branch: Option<String>,
    /// Provider-owned session id for the session currently (or most recently)
    /// assigned against this task.
    pub session_id: Option<String>,
    pub assigned_agent: Option<Uuid>,
    pub merge_status: MergeStatus,
    pub last_sync_result: Option<SyncResult>,
    pub reconciliation_count: u32,
    pub stuck_merge_recovery_count: u32,
    pub session_history: Vec<SessionHistoryEntry>,
}

impl OrchestratorMeta {
    /// Appends a session-history entry, evicting the oldest entries once
    /// `MAX_SESSION_HISTORY` is exceeded.
    pub fn push_session_history(&mut self, entry: SessionHistoryEntry) {
        self.session_history.push(entry);
        if self.session_history.len() > MAX_SESSION_HISTORY {
            let excess = self.session_history.len() - MAX_SESSION_HISTORY;
            self.session_history.drain(..excess);
        }
    }
}

/// The unit of dispatchable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    // immutable
    pub id: Uuid,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub description_ref: String,

    // mutable
    pub assignee: Option<Uuid>,
    pub status: TaskStatus,
    pub priority: i32,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,

    pub orchestrator: OrchestratorMeta,
}

impl Task {
    #[must_use]
    pub fn new(created_by: Uuid, description_ref: impl Into<String>, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_by,
            created_at: now,
            description_ref: description_ref.into(),
            assignee: None,
            status: TaskStatus::Open,
            priority,
            updated_at: now,
            closed_at: None,
            close_reason: None,
            orchestrator: OrchestratorMeta::default(),
        }
    }

    /// Checked transition: fails if `next` is not reachable from the current
    /// status under `TaskStatus::valid_transitions`.
    ///
    /// # Errors
    /// Returns the attempted `(from, to)` pair as `Err` when the transition is
    /// not allowed.
    pub fn transition_to(&mut self, next: TaskStatus) -> Result<(), (TaskStatus, TaskStatus)> {
        if !self.status.can_transition_to(next) {
            return Err((self.status, next));
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next == TaskStatus::Closed {
            self.closed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Unchecked transition used only by reconciliation and orphan-recovery
    /// code paths. Bypasses the state machine entirely.
    pub fn force_status(&mut self, next: TaskStatus, reason: &str) {
        tracing::warn!(task_id = %self.id, from = self.status.as_str(), to = next.as_str(), reason, "forcing task status outside state machine");
        self.status = next;
        self.updated_at = Utc::now();
        if next != TaskStatus::Closed {
            self.closed_at = None;
            self.close_reason = None;
        }
    }

    /// True once a session is expected to exist against this task: the
    /// `assignee`/`assignedAgent` invariant only applies while this holds.
    #[must_use]
    pub const fn has_live_assignment(&self) -> bool {
        matches!(self.status, TaskStatus::InProgress | TaskStatus::Review)
            && self.assignee.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(Uuid::new_v4(), "doc:1", 1)
    }

    #[test]
    fn new_task_starts_open() {
        let t = task();
        assert_eq!(t.status, TaskStatus::Open);
        assert!(t.assignee.is_none());
        assert_eq!(t.orchestrator.merge_status, MergeStatus::Pending);
    }

    #[test]
    fn forward_transitions_allowed() {
        let mut t = task();
        t.transition_to(TaskStatus::InProgress).unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
        t.transition_to(TaskStatus::Review).unwrap();
        assert_eq!(t.status, TaskStatus::Review);
        t.transition_to(TaskStatus::Closed).unwrap();
        assert_eq!(t.status, TaskStatus::Closed);
        assert!(t.closed_at.is_some());
    }

    #[test]
    fn skipping_a_state_is_rejected() {
        let mut t = task();
        let err = t.transition_to(TaskStatus::Review).unwrap_err();
        assert_eq!(err, (TaskStatus::Open, TaskStatus::Review));
        assert_eq!(t.status, TaskStatus::Open);
    }

    #[test]
    fn closed_is_terminal_under_the_checked_machine() {
        let mut t = task();
        t.transition_to(TaskStatus::InProgress).unwrap();
        t.transition_to(TaskStatus::Review).unwrap();
        t.transition_to(TaskStatus::Closed).unwrap();
        assert!(t.transition_to(TaskStatus::Open).is_err());
    }

    #[test]
    fn force_status_bypasses_machine_and_clears_close_fields() {
        let mut t = task();
        t.transition_to(TaskStatus::InProgress).unwrap();
        t.transition_to(TaskStatus::Review).unwrap();
        t.transition_to(TaskStatus::Closed).unwrap();
        t.close_reason = Some("merged".into());
        t.force_status(TaskStatus::Review, "closed-unmerged reconciliation");
        assert_eq!(t.status, TaskStatus::Review);
        assert!(t.closed_at.is_none());
        assert!(t.close_reason.is_none());
    }

    #[test]
    fn session_history_is_bounded() {
        let mut meta = OrchestratorMeta::default();
        for i in 0..(MAX_SESSION_HISTORY + 5) {
            meta.push_session_history(SessionHistoryEntry {
                session_id: Uuid::new_v4(),
                provider_session_id: None,
                agent_id: Uuid::new_v4(),
                agent_name: format!("agent-{i}"),
                agent_role: "worker".into(),
                started_at: Utc::now(),
            });
        }
        assert_eq!(meta.session_history.len(), MAX_SESSION_HISTORY);
        assert_eq!(meta.session_history[0].agent_name, "agent-5");
    }

    #[test]
    fn has_live_assignment_requires_status_and_assignee() {
        let mut t = task();
        assert!(!t.has_live_assignment());
        t.assignee = Some(Uuid::new_v4());
        assert!(!t.has_live_assignment());
        t.transition_to(TaskStatus::InProgress).unwrap();
        assert!(t.has_live_assignment());
    }
}
