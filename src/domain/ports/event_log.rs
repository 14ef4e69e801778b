//! The storage contract's append-only event log: `listEvents`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::errors::DispatchResult;

/// One append-only event, typically a task event (status change, session
/// started, message received) persisted for audit/history purposes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskEvent {
    pub id: Uuid,
    pub task_id: Uuid,
    pub kind: String,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Filter for `EventLog::list_events`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub task_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: TaskEvent) -> DispatchResult<()>;
    async fn list_events(&self, filter: EventFilter) -> DispatchResult<Vec<TaskEvent>>;
}
