//! InboxItem and Message: the per-entity view over channel traffic that the
//! Inbox Router classifies and dispatches.
//!
//! No teacher file models messaging directly; grounded on the teacher's
//! tagged-variant style used throughout `domain::models` (e.g. `TaskSource`)
//! for `MessageKind`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The opaque `type` carried in a message's metadata. Known dispatch-related
/// kinds are named; anything else is a plain conversational message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    TaskDispatch,
    TaskAssignment,
    TaskReassignment,
    /// Any message type the router does not specifically recognize.
    #[serde(other)]
    Other,
}

impl MessageKind {
    /// Whether this message kind represents a dispatch notification — these
    /// are handled by the dispatch poll itself, not by the inbox router's
    /// forward/triage logic.
    #[must_use]
    pub const fn is_dispatch(&self) -> bool {
        matches!(
            self,
            Self::TaskDispatch | Self::TaskAssignment | Self::TaskReassignment
        )
    }
}

/// A message posted to a channel between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

/// Whether an inbox item has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    Unread,
    Read,
}

/// A per-entity view over a `Message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxItem {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub message_id: Uuid,
    pub channel_id: Uuid,
    pub status: InboxStatus,
}

impl InboxItem {
    #[must_use]
    pub const fn is_unread(&self) -> bool {
        matches!(self.status, InboxStatus::Unread)
    }

    pub fn mark_read(&mut self) {
        self.status = InboxStatus::Read;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_kinds_are_flagged() {
        assert!(MessageKind::TaskDispatch.is_dispatch());
        assert!(MessageKind::TaskAssignment.is_dispatch());
        assert!(MessageKind::TaskReassignment.is_dispatch());
        assert!(!MessageKind::Other.is_dispatch());
    }

    #[test]
    fn mark_read_transitions_status() {
        let mut item = InboxItem {
            id: Uuid::new_v4(),
            entity_id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            channel_id: Uuid::new_v4(),
            status: InboxStatus::Unread,
        };
        assert!(item.is_unread());
        item.mark_read();
        assert!(!item.is_unread());
    }
}
