//! Merge Pipeline: drives a task from `REVIEW` to `CLOSED` via a merge
//! steward (§4.7).
//!
//! Generalizes the teacher's `merge_queue.rs` (a validated request type, a
//! config struct with tunable timeouts, a small status machine) to the
//! dispatcher's merge-steward workflow: sync step, steward prompt assembly,
//! the `mergeStatus` state machine, stuck-merge recovery, and closed-unmerged
//! reconciliation.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::{timeout, Duration};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::domain::errors::DispatchResult;
use crate::domain::models::{Entity, EntityRole, MergeStatus, StewardFocus, SyncResult, Task, TaskStatus};
use crate::domain::ports::{EntityFilter, EntityStore, TaskFilter, TaskPatch, TaskStore};

/// Per-command timeouts for the sync step, per §5.
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const MERGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Retry caps shared by stuck-merge recovery and closed-unmerged
/// reconciliation (§4.7, Testable Property 4).
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct MergePipelineConfig {
    pub closed_unmerged_grace_period: ChronoDuration,
    pub stuck_merge_recovery_grace_period: ChronoDuration,
}

impl Default for MergePipelineConfig {
    fn default() -> Self {
        Self {
            closed_unmerged_grace_period: ChronoDuration::minutes(2),
            stuck_merge_recovery_grace_period: ChronoDuration::minutes(10),
        }
    }
}

/// A callback abstraction over the `git fetch`/`git merge` pair run inside a
/// task's worktree. Kept as an injected function rather than a concrete git
/// call here so the sync step can be exercised in tests without a real repo.
pub type SyncRunner = Arc<dyn Fn(&str) -> DispatchResult<SyncResult> + Send + Sync>;

pub struct MergePipeline {
    tasks: Arc<dyn TaskStore>,
    entities: Arc<dyn EntityStore>,
    config: MergePipelineConfig,
    sync_runner: SyncRunner,
}

impl MergePipeline {
    #[must_use]
    pub fn new(tasks: Arc<dyn TaskStore>, entities: Arc<dyn EntityStore>, config: MergePipelineConfig, sync_runner: SyncRunner) -> Self {
        Self { tasks, entities, config, sync_runner }
    }

    /// Tasks eligible for steward assignment: `REVIEW`, `mergeStatus=pending`,
    /// no current assignee.
    pub async fn eligible_tasks(&self) -> DispatchResult<Vec<Task>> {
        let tasks = self
            .tasks
            .list(TaskFilter {
                assignee: None,
                status: Some(TaskStatus::Review),
            })
            .await?;
        let mut eligible: Vec<Task> = tasks
            .into_iter()
            .filter(|t| t.orchestrator.merge_status == MergeStatus::Pending && t.assignee.is_none())
            .collect();
        eligible.sort_by(|a, b| a.priority.cmp(&b.priority));
        Ok(eligible)
    }

    /// Available merge stewards: role=steward, focus=merge, no active
    /// session. Liveness (whether a steward "has an active session") is the
    /// caller's responsibility to supply, since only the Session Manager can
    /// answer that authoritatively.
    pub async fn available_stewards(&self, has_active_session: impl Fn(Uuid) -> bool) -> DispatchResult<Vec<Entity>> {
        let stewards = self
            .entities
            .list(EntityFilter {
                role: Some(EntityRole::Steward),
                active_only: true,
            })
            .await?;
        Ok(stewards
            .into_iter()
            .filter(|e| matches!(e.subkind, crate::domain::models::EntitySubkind::Steward(StewardFocus::Merge)))
            .filter(|e| !has_active_session(e.id))
            .collect())
    }

    /// Runs the pre-steward sync step inside the task's worktree, persisting
    /// the outcome on `orchestrator.lastSyncResult`.
    #[instrument(skip(self), fields(task_id = %task.id))]
    pub async fn run_sync_step(&self, task: &Task) -> DispatchResult<SyncResult> {
        let worktree = task.orchestrator.worktree.clone().unwrap_or_default();
        let runner = Arc::clone(&self.sync_runner);
        let worktree_for_call = worktree.clone();
        let result = timeout(FETCH_TIMEOUT + MERGE_TIMEOUT, async move { runner(&worktree_for_call) })
            .await
            .unwrap_or_else(|_| Ok(SyncResult::Error { message: "sync step timed out".into() }))?;

        let mut orchestrator = task.orchestrator.clone();
        orchestrator.last_sync_result = Some(result.clone());
        self.tasks
            .update(
                task.id,
                TaskPatch {
                    orchestrator: Some(orchestrator),
                    ..Default::default()
                },
            )
            .await?;
        Ok(result)
    }

    /// Builds the steward prompt: role prompt + task metadata + sync-result
    /// section + description document content + acceptance criteria.
    #[must_use]
    pub fn build_steward_prompt(task: &Task, sync_result: &SyncResult, description: &str, acceptance_criteria: &str) -> String {
        let sync_section = match sync_result {
            SyncResult::Success => "Sync: clean, no conflicts.".to_string(),
            SyncResult::Conflicts { files } => format!(
                "Sync: conflicts in {} file(s): {}. Resolve these first before proceeding.",
                files.len(),
                files.join(", ")
            ),
            SyncResult::Error { message } => format!("Sync: failed ({message}). Investigate before proceeding."),
        };
        format!(
            "You are a merge steward. Task {}: {}\n\n{sync_section}\n\nDescription:\n{description}\n\nAcceptance criteria:\n{acceptance_criteria}",
            task.id, task.description_ref
        )
    }

    /// Begins a steward assignment: sets `assignee`, `mergeStatus=testing`,
    /// and persists the session id plus a history entry. The actual session
    /// spawn happens through `services::session_manager`; this only performs
    /// the storage-side half.
    pub async fn begin_steward_assignment(&self, task_id: Uuid, steward_id: Uuid, session_id: String) -> DispatchResult<Task> {
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| crate::domain::errors::DispatchError::NotFound(format!("task {task_id}")))?;
        let mut orchestrator = task.orchestrator.clone();
        orchestrator.merge_status = MergeStatus::Testing;
        orchestrator.session_id = Some(session_id);
        self.tasks
            .update(
                task_id,
                TaskPatch {
                    assignee: Some(Some(steward_id)),
                    orchestrator: Some(orchestrator),
                    ..Default::default()
                },
            )
            .await
    }

    /// If a task sits in `testing`/`merging` for longer than the configured
    /// grace period with no active steward session, reset it to `pending`,
    /// clear the assignee, and force-remove any temporary merge worktree.
    /// Retries are capped at 3 via `stuckMergeRecoveryCount`.
    #[instrument(skip(self, force_remove_worktree), fields(task_id = %task.id))]
    pub async fn recover_if_stuck<F>(&self, task: &Task, now: DateTime<Utc>, force_remove_worktree: F) -> DispatchResult<bool>
    where
        F: FnOnce(&str),
    {
        let stuck_status = matches!(task.orchestrator.merge_status, MergeStatus::Testing | MergeStatus::Merging);
        if !stuck_status {
            return Ok(false);
        }
        if now - task.updated_at < self.config.stuck_merge_recovery_grace_period {
            return Ok(false);
        }
        if task.orchestrator.stuck_merge_recovery_count >= MAX_RETRIES {
            warn!(task_id = %task.id, "stuck-merge recovery cap reached, leaving as-is");
            return Ok(false);
        }

        if let Some(worktree) = &task.orchestrator.handoff_worktree {
            force_remove_worktree(worktree);
        }

        let mut orchestrator = task.orchestrator.clone();
        orchestrator.merge_status = MergeStatus::Pending;
        orchestrator.stuck_merge_recovery_count += 1;
        self.tasks
            .update(
                task.id,
                TaskPatch {
                    assignee: Some(None),
                    orchestrator: Some(orchestrator),
                    ..Default::default()
                },
            )
            .await?;
        Ok(true)
    }

    /// If `status=CLOSED` but `mergeStatus != merged` and the grace period
    /// has elapsed since `closedAt`, pushes the task back to `REVIEW`,
    /// clearing `closedAt`/`closeReason`/`assignee` and resetting
    /// `mergeStatus=pending`. Retries capped at 3 via `reconciliationCount`.
    #[instrument(skip(self), fields(task_id = %task.id))]
    pub async fn reconcile_if_closed_unmerged(&self, task: &Task, now: DateTime<Utc>) -> DispatchResult<bool> {
        if task.status != TaskStatus::Closed || task.orchestrator.merge_status == MergeStatus::Merged {
            return Ok(false);
        }
        let Some(closed_at) = task.closed_at else {
            return Ok(false);
        };
        if now - closed_at < self.config.closed_unmerged_grace_period {
            return Ok(false);
        }
        if task.orchestrator.reconciliation_count >= MAX_RETRIES {
            warn!(task_id = %task.id, "reconciliation cap reached, leaving closed");
            return Ok(false);
        }

        let mut updated = task.clone();
        let mut orchestrator = updated.orchestrator.clone();
        orchestrator.merge_status = MergeStatus::Pending;
        orchestrator.reconciliation_count += 1;
        updated.orchestrator = orchestrator;
        updated.force_status(TaskStatus::Review, "closed-unmerged reconciliation");

        self.tasks
            .update(
                task.id,
                TaskPatch {
                    assignee: Some(None),
                    status: Some(TaskStatus::Review),
                    closed_at: Some(None),
                    close_reason: Some(None),
                    orchestrator: Some(updated.orchestrator),
                },
            )
            .await?;
        Ok(true)
    }
}
