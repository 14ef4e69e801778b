//! The storage contract's task-facing slice: `get`, `create`, `update`,
//! `list`, and the authoritative `ready()` query.
//!
//! Grounded on `TaskRepository` in the teacher's `domain::ports::task_repository`
//! (the `#[async_trait]`, `DispatchResult<T>`-returning one-trait-per-entity-kind
//! convention) narrowed to the operations §6 actually names.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DispatchResult;
use crate::domain::models::Task;

/// Filter for `TaskStore::list`. `None` fields are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub assignee: Option<Uuid>,
    pub status: Option<crate::domain::models::TaskStatus>,
}

/// A partial update applied by `TaskStore::update`. Only `Some` fields are
/// written; this mirrors the storage layer's "opaque partial patch" framing
/// from §1 — the core never has to read-modify-write a whole row to change a
/// handful of fields, which is what makes `dispatch()` atomic (Law 5).
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub assignee: Option<Option<Uuid>>,
    pub status: Option<crate::domain::models::TaskStatus>,
    pub priority: Option<i32>,
    pub closed_at: Option<Option<chrono::DateTime<chrono::Utc>>>,
    pub close_reason: Option<Option<String>>,
    pub orchestrator: Option<crate::domain::models::OrchestratorMeta>,
}

/// Consumed methods: `get`, `create`, `update`, `list`, and `ready()`. The
/// dispatcher never re-derives effective priority or readiness — `ready()` is
/// the authoritative source (§4.4).
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, id: Uuid) -> DispatchResult<Option<Task>>;
    async fn create(&self, task: Task) -> DispatchResult<Task>;
    async fn update(&self, id: Uuid, patch: TaskPatch) -> DispatchResult<Task>;
    async fn list(&self, filter: TaskFilter) -> DispatchResult<Vec<Task>>;

    /// Tasks passing all readiness predicates (not blocked, not a draft, not
    /// future-scheduled, not already closed), sorted by effective priority.
    async fn ready(&self) -> DispatchResult<Vec<Task>>;
}
