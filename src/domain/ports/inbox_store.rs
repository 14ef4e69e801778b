//! The storage contract's inbox-facing slice: `getInbox`, `markAsRead`,
//! `markAsReadBatch`.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DispatchResult;
use crate::domain::models::{InboxItem, InboxStatus};

/// Filter for `InboxStore::get_inbox`.
#[derive(Debug, Clone, Default)]
pub struct InboxFilter {
    pub status: Option<InboxStatus>,
}

#[async_trait]
pub trait InboxStore: Send + Sync {
    async fn get_inbox(&self, entity_id: Uuid, filter: InboxFilter) -> DispatchResult<Vec<InboxItem>>;

    async fn mark_as_read(&self, inbox_item_id: Uuid) -> DispatchResult<()>;

    /// Marks a batch as read. Per the triage-atomicity law (§8 Law 7), this is
    /// only ever called after a triage session's normal exit, and it is
    /// expected to be applied as a single unit from the caller's perspective
    /// — a crash before this call leaves every item in the batch untouched.
    async fn mark_as_read_batch(&self, inbox_item_ids: &[Uuid]) -> DispatchResult<()>;
}
