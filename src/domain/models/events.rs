//! The observer-facing event stream and `PollResult` shape from §6.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which sub-poll a `PollResult` or `poll:start`/`poll:error` event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollKind {
    MaxSessionDurationReap,
    Inbox,
    WorkerAvailability,
    StewardTrigger,
    WorkflowTask,
    ClosedUnmergedReconciliation,
    StuckMergeRecovery,
}

/// Bit-exact shape for observers, per §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResult {
    pub poll_type: PollKind,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub processed: u64,
    pub errors: u64,
    pub error_messages: Option<Vec<String>>,
}

impl PollResult {
    #[must_use]
    pub const fn items_considered(&self) -> u64 {
        self.processed + self.errors
    }
}

/// Severity carried by a `daemon:notification` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// The event stream the core emits to observers, per §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum DaemonEvent {
    #[serde(rename = "poll:start")]
    PollStart { kind: PollKind },
    #[serde(rename = "poll:complete")]
    PollComplete { result: PollResult },
    #[serde(rename = "poll:error")]
    PollError { kind: PollKind, error: String },
    #[serde(rename = "task:dispatched")]
    TaskDispatched { task_id: Uuid, agent_id: Uuid },
    #[serde(rename = "message:forwarded")]
    MessageForwarded { message_id: Uuid, agent_id: Uuid },
    #[serde(rename = "agent:spawned")]
    AgentSpawned {
        agent_id: Uuid,
        worktree: Option<String>,
    },
    #[serde(rename = "agent:triage-spawned")]
    AgentTriageSpawned {
        agent_id: Uuid,
        channel_id: Uuid,
        worktree: String,
    },
    #[serde(rename = "daemon:notification")]
    DaemonNotification {
        level: NotificationLevel,
        title: String,
        message: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_considered_sums_processed_and_errors() {
        let r = PollResult {
            poll_type: PollKind::Inbox,
            started_at: Utc::now(),
            duration_ms: 10,
            processed: 3,
            errors: 2,
            error_messages: Some(vec!["boom".into()]),
        };
        assert_eq!(r.items_considered(), 5);
    }
}
