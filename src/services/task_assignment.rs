//! Task Assignment: atomic binding of task ↔ entity plus task-status
//! transitions (§4.4).
//!
//! `dispatch` is one atomic method against the storage port — load, mutate,
//! persist, all within a single `update()` call's partial patch — so no
//! other cycle can observe a half-applied assignment (Law 5, idempotence of
//! dispatch).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::models::{Entity, MessageKind, Task, TaskStatus};
use crate::domain::ports::{EntityStore, MessageStore, NewMessage, TaskFilter, TaskPatch, TaskStore};

#[derive(Debug, Clone, Default)]
pub struct DispatchOpts {
    pub worktree: Option<String>,
    pub branch: Option<String>,
    pub session_id: Option<String>,
    /// When set, the task transitions `OPEN -> IN_PROGRESS` as part of this
    /// call. Decision D1 (§9): rejected as `IllegalTransition` against a task
    /// in `REVIEW` or `CLOSED`. Against a task already `IN_PROGRESS` this is
    /// a no-op reassignment, not an error — idempotent dispatch (Law 5)
    /// requires a replayed `markAsStarted=true` call to leave status alone.
    pub mark_as_started: bool,
}

pub struct DispatchResultInfo {
    pub task: Task,
    pub agent: Entity,
    pub notification: crate::domain::models::Message,
    pub channel_id: Uuid,
    pub is_new_assignment: bool,
    pub dispatched_at: DateTime<Utc>,
}

pub struct TaskAssignment {
    tasks: Arc<dyn TaskStore>,
    entities: Arc<dyn EntityStore>,
    messages: Arc<dyn MessageStore>,
}

impl TaskAssignment {
    #[must_use]
    pub fn new(tasks: Arc<dyn TaskStore>, entities: Arc<dyn EntityStore>, messages: Arc<dyn MessageStore>) -> Self {
        Self { tasks, entities, messages }
    }

    #[tracing::instrument(skip(self, opts), fields(task_id = %task_id, agent_id = %agent_id))]
    pub async fn dispatch(&self, task_id: Uuid, agent_id: Uuid, opts: DispatchOpts) -> DispatchResult<DispatchResultInfo> {
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("task {task_id}")))?;
        let agent = self
            .entities
            .get(agent_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("entity {agent_id}")))?;

        let is_new_assignment = task.assignee != Some(agent_id);

        if opts.mark_as_started && task.status != TaskStatus::Open && task.status != TaskStatus::InProgress {
            return Err(DispatchError::IllegalTransition {
                from: task.status.as_str().to_string(),
                to: TaskStatus::InProgress.as_str().to_string(),
            });
        }

        let mut orchestrator = task.orchestrator.clone();
        orchestrator.branch = Some(
            opts.branch
                .unwrap_or_else(|| format!("agent/{}/{task_id}", agent.name)),
        );
        if opts.worktree.is_some() {
            orchestrator.worktree = opts.worktree;
        }
        orchestrator.assigned_agent = Some(agent_id);
        if opts.session_id.is_some() {
            orchestrator.session_id = opts.session_id;
        }

        let new_status = if opts.mark_as_started && task.status == TaskStatus::Open {
            Some(TaskStatus::InProgress)
        } else {
            None
        };

        let updated = self
            .tasks
            .update(
                task_id,
                TaskPatch {
                    assignee: Some(Some(agent_id)),
                    status: new_status,
                    orchestrator: Some(orchestrator),
                    ..Default::default()
                },
            )
            .await?;

        let channel_id = self.messages.create_direct_channel(agent_id, task.created_by).await?;
        let kind = if is_new_assignment {
            MessageKind::TaskAssignment
        } else {
            MessageKind::TaskReassignment
        };
        let content = format!(
            "{{\"taskId\":\"{task_id}\",\"priority\":{},\"restart\":{}}}",
            updated.priority, !is_new_assignment
        );
        let notification = self
            .messages
            .post_message(
                channel_id,
                NewMessage {
                    sender_id: agent_id,
                    content,
                    kind,
                },
            )
            .await?;

        Ok(DispatchResultInfo {
            task: updated,
            agent,
            notification,
            channel_id,
            is_new_assignment,
            dispatched_at: Utc::now(),
        })
    }

    pub async fn get_agent_tasks(&self, entity_id: Uuid, statuses: &[TaskStatus]) -> DispatchResult<Vec<Task>> {
        let tasks = self
            .tasks
            .list(TaskFilter {
                assignee: Some(entity_id),
                status: None,
            })
            .await?;
        Ok(tasks
            .into_iter()
            .filter(|t| statuses.is_empty() || statuses.contains(&t.status))
            .collect())
    }

    pub async fn get_unassigned_tasks(&self, status: Option<TaskStatus>) -> DispatchResult<Vec<Task>> {
        let tasks = self.tasks.list(TaskFilter { assignee: None, status }).await?;
        Ok(tasks.into_iter().filter(|t| t.assignee.is_none()).collect())
    }

    /// The only query that exposes `orchestratorMeta` alongside the task —
    /// in this model that subtree is already nested on `Task` itself, so
    /// this is a thin passthrough over `list`.
    pub async fn list_assignments(&self, filter: TaskFilter) -> DispatchResult<Vec<Task>> {
        self.tasks.list(filter).await
    }

    /// Thin passthrough to the storage layer's authoritative ready queue —
    /// the dispatcher never re-derives readiness or effective priority.
    pub async fn ready(&self) -> DispatchResult<Vec<Task>> {
        self.tasks.ready().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_storage::MemoryStorage;
    use crate::domain::models::{EntitySubkind, WorkerKind};

    fn assignment() -> (TaskAssignment, Arc<MemoryStorage>) {
        let storage = MemoryStorage::shared();
        (
            TaskAssignment::new(storage.clone(), storage.clone(), storage.clone()),
            storage,
        )
    }

    #[tokio::test]
    async fn dispatch_is_idempotent_and_second_call_is_a_reassignment() {
        let (assignment, storage) = assignment();
        let creator = Uuid::new_v4();
        let task = Task::new(creator, "doc://1", 1);
        let task_id = task.id;
        TaskStore::create(storage.as_ref(), task).await.unwrap();
        let agent = Entity::new("w1", EntitySubkind::Worker(WorkerKind::Ephemeral));
        let agent_id = agent.id;
        EntityStore::create(storage.as_ref(), agent).await.unwrap();

        let first = assignment
            .dispatch(
                task_id,
                agent_id,
                DispatchOpts {
                    mark_as_started: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(first.is_new_assignment);
        assert_eq!(first.task.status, TaskStatus::InProgress);

        let second = assignment.dispatch(task_id, agent_id, DispatchOpts::default()).await.unwrap();
        assert!(!second.is_new_assignment);
        assert_eq!(second.task.status, first.task.status);
        assert_eq!(second.task.assignee, first.task.assignee);
    }

    #[tokio::test]
    async fn mark_as_started_against_review_task_is_rejected() {
        let (assignment, storage) = assignment();
        let creator = Uuid::new_v4();
        let mut task = Task::new(creator, "doc://1", 1);
        task.transition_to(TaskStatus::InProgress).unwrap();
        task.transition_to(TaskStatus::Review).unwrap();
        let task_id = task.id;
        TaskStore::create(storage.as_ref(), task).await.unwrap();
        let agent = Entity::new("w1", EntitySubkind::Worker(WorkerKind::Ephemeral));
        let agent_id = agent.id;
        EntityStore::create(storage.as_ref(), agent).await.unwrap();

        let err = assignment
            .dispatch(
                task_id,
                agent_id,
                DispatchOpts {
                    mark_as_started: true,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(err, Err(DispatchError::IllegalTransition { .. })));
    }

    /// Law 5: a replayed `markAsStarted=true` dispatch against a task already
    /// `IN_PROGRESS` is a no-op reassignment, not an error, and leaves status
    /// unchanged.
    #[tokio::test]
    async fn mark_as_started_against_in_progress_task_is_a_noop_reassignment() {
        let (assignment, storage) = assignment();
        let creator = Uuid::new_v4();
        let mut task = Task::new(creator, "doc://1", 1);
        task.transition_to(TaskStatus::InProgress).unwrap();
        let task_id = task.id;
        TaskStore::create(storage.as_ref(), task).await.unwrap();
        let agent = Entity::new("w1", EntitySubkind::Worker(WorkerKind::Ephemeral));
        let agent_id = agent.id;
        EntityStore::create(storage.as_ref(), agent).await.unwrap();

        let result = assignment
            .dispatch(
                task_id,
                agent_id,
                DispatchOpts {
                    mark_as_started: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(result.is_new_assignment);
        assert_eq!(result.task.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn unassigned_tasks_excludes_assigned_ones() {
        let (assignment, storage) = assignment();
        let creator = Uuid::new_v4();
        TaskStore::create(storage.as_ref(), Task::new(creator, "doc://1", 1))
            .await
            .unwrap();
        let mut assigned = Task::new(creator, "doc://2", 1);
        assigned.assignee = Some(Uuid::new_v4());
        TaskStore::create(storage.as_ref(), assigned).await.unwrap();

        let unassigned = assignment.get_unassigned_tasks(None).await.unwrap();
        assert_eq!(unassigned.len(), 1);
    }
}
