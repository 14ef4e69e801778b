//! The storage contract's channel/message-facing slice:
//! `createDirectChannel`, `postMessage`.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DispatchResult;
use crate::domain::models::{Message, MessageKind};

/// Input to `MessageStore::post_message`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Returns the existing channel between `a` and `b` if one exists, else
    /// creates it. Channel identity is symmetric in `(a, b)`.
    async fn create_direct_channel(&self, a: Uuid, b: Uuid) -> DispatchResult<Uuid>;

    async fn post_message(&self, channel_id: Uuid, msg: NewMessage) -> DispatchResult<Message>;

    /// Looks up a single message by id, regardless of which channel it was
    /// posted to. Used by `services::inbox_router`'s `message_lookup`
    /// closure, which needs to resolve an `InboxItem`'s `message_id` before it
    /// can classify the item.
    async fn get_message(&self, message_id: Uuid) -> DispatchResult<Option<Message>>;
}
