//! In-memory reference adapters for the storage ports.
//!
//! Grounded on the teacher's repository-per-entity convention (each
//! `adapters/sqlite/*_repo.rs` implements exactly one port trait); these
//! swap the sqlite backing for a `Mutex<HashMap<..>>`, since the spec treats
//! the storage contract as opaque (§6) and an in-memory implementation is
//! sufficient for both the reference binary and the integration tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::models::{Entity, EntityRole, InboxItem, InboxStatus, Message, MessageKind, Task, TaskStatus};
use crate::domain::ports::{
    EntityFilter, EntityStore, EventFilter, EventLog, InboxFilter, InboxStore, MessageStore, NewMessage, TaskEvent,
    TaskFilter, TaskPatch, TaskStore,
};

/// A single in-process store backing all five storage ports. Real
/// deployments would split these across tables or services; nothing in the
/// port contracts requires that they share a backend, so the reference
/// adapter takes the simplest shape.
#[derive(Default)]
pub struct MemoryStorage {
    tasks: Mutex<HashMap<Uuid, Task>>,
    entities: Mutex<HashMap<Uuid, Entity>>,
    messages: Mutex<HashMap<Uuid, Vec<Message>>>,
    channels: Mutex<HashMap<(Uuid, Uuid), Uuid>>,
    inbox: Mutex<HashMap<Uuid, InboxItem>>,
    events: Mutex<Vec<TaskEvent>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl TaskStore for MemoryStorage {
    async fn get(&self, id: Uuid) -> DispatchResult<Option<Task>> {
        Ok(self.tasks.lock().await.get(&id).cloned())
    }

    async fn create(&self, task: Task) -> DispatchResult<Task> {
        let mut tasks = self.tasks.lock().await;
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn update(&self, id: Uuid, patch: TaskPatch) -> DispatchResult<Task> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| DispatchError::NotFound(format!("task {id}")))?;
        if let Some(assignee) = patch.assignee {
            task.assignee = assignee;
        }
        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(closed_at) = patch.closed_at {
            task.closed_at = closed_at;
        }
        if let Some(close_reason) = patch.close_reason {
            task.close_reason = close_reason;
        }
        if let Some(orchestrator) = patch.orchestrator {
            task.orchestrator = orchestrator;
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn list(&self, filter: TaskFilter) -> DispatchResult<Vec<Task>> {
        let tasks = self.tasks.lock().await;
        Ok(tasks
            .values()
            .filter(|t| filter.assignee.is_none_or(|a| t.assignee == Some(a)))
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect())
    }

    async fn ready(&self) -> DispatchResult<Vec<Task>> {
        let tasks = self.tasks.lock().await;
        Ok(tasks
            .values()
            .filter(|t| t.status == TaskStatus::Open && t.assignee.is_none())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EntityStore for MemoryStorage {
    async fn get(&self, id: Uuid) -> DispatchResult<Option<Entity>> {
        Ok(self.entities.lock().await.get(&id).cloned())
    }

    async fn create(&self, entity: Entity) -> DispatchResult<Entity> {
        self.entities.lock().await.insert(entity.id, entity.clone());
        Ok(entity)
    }

    async fn update(&self, entity: Entity) -> DispatchResult<Entity> {
        let mut entities = self.entities.lock().await;
        if !entities.contains_key(&entity.id) {
            return Err(DispatchError::NotFound(format!("entity {}", entity.id)));
        }
        entities.insert(entity.id, entity.clone());
        Ok(entity)
    }

    async fn list(&self, filter: EntityFilter) -> DispatchResult<Vec<Entity>> {
        let entities = self.entities.lock().await;
        Ok(entities
            .values()
            .filter(|e| !filter.active_only || e.active)
            .filter(|e| filter.role.is_none_or(|r| e.role() == r))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MessageStore for MemoryStorage {
    async fn create_direct_channel(&self, a: Uuid, b: Uuid) -> DispatchResult<Uuid> {
        let key = if a < b { (a, b) } else { (b, a) };
        let mut channels = self.channels.lock().await;
        if let Some(existing) = channels.get(&key) {
            return Ok(*existing);
        }
        let channel_id = Uuid::new_v4();
        channels.insert(key, channel_id);
        Ok(channel_id)
    }

    async fn post_message(&self, channel_id: Uuid, msg: NewMessage) -> DispatchResult<Message> {
        let message = Message {
            id: Uuid::new_v4(),
            channel_id,
            sender_id: msg.sender_id,
            content: msg.content,
            kind: msg.kind,
            created_at: Utc::now(),
        };
        self.messages
            .lock()
            .await
            .entry(channel_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn get_message(&self, message_id: Uuid) -> DispatchResult<Option<Message>> {
        let messages = self.messages.lock().await;
        Ok(messages
            .values()
            .flatten()
            .find(|m| m.id == message_id)
            .cloned())
    }
}

#[async_trait]
impl InboxStore for MemoryStorage {
    async fn get_inbox(&self, entity_id: Uuid, filter: InboxFilter) -> DispatchResult<Vec<InboxItem>> {
        let inbox = self.inbox.lock().await;
        Ok(inbox
            .values()
            .filter(|i| i.entity_id == entity_id)
            .filter(|i| filter.status.is_none_or(|s| i.status == s))
            .cloned()
            .collect())
    }

    async fn mark_as_read(&self, inbox_item_id: Uuid) -> DispatchResult<()> {
        let mut inbox = self.inbox.lock().await;
        let item = inbox
            .get_mut(&inbox_item_id)
            .ok_or_else(|| DispatchError::NotFound(format!("inbox item {inbox_item_id}")))?;
        item.mark_read();
        Ok(())
    }

    async fn mark_as_read_batch(&self, inbox_item_ids: &[Uuid]) -> DispatchResult<()> {
        let mut inbox = self.inbox.lock().await;
        for id in inbox_item_ids {
            if let Some(item) = inbox.get_mut(id) {
                item.mark_read();
            }
        }
        Ok(())
    }
}

impl MemoryStorage {
    /// Test/demo helper: seeds an unread inbox item for `entity_id` pointing
    /// at `message_id`, bypassing the dispatch flow that would normally
    /// create one.
    pub async fn seed_inbox_item(&self, entity_id: Uuid, channel_id: Uuid, message_id: Uuid) -> Uuid {
        let item = InboxItem {
            id: Uuid::new_v4(),
            entity_id,
            message_id,
            channel_id,
            status: InboxStatus::Unread,
        };
        let id = item.id;
        self.inbox.lock().await.insert(id, item);
        id
    }

    pub async fn messages_in(&self, channel_id: Uuid) -> Vec<Message> {
        self.messages.lock().await.get(&channel_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl EventLog for MemoryStorage {
    async fn append(&self, event: TaskEvent) -> DispatchResult<()> {
        self.events.lock().await.push(event);
        Ok(())
    }

    async fn list_events(&self, filter: EventFilter) -> DispatchResult<Vec<TaskEvent>> {
        let events = self.events.lock().await;
        Ok(events
            .iter()
            .filter(|e| filter.task_id.is_none_or(|t| e.task_id == t))
            .filter(|e| filter.since.is_none_or(|since| e.recorded_at >= since))
            .cloned()
            .collect())
    }
}

// `MessageKind` is re-exported through `domain::models` and used by callers
// constructing `NewMessage`; referenced here only to keep the import used by
// doctest-style examples in this module's own tests.
#[cfg(test)]
mod tests {
    use super::*;

    fn entity(role: EntityRole) -> Entity {
        use crate::domain::models::{EntitySubkind, StewardFocus, WorkerKind};
        let subkind = match role {
            EntityRole::Director => EntitySubkind::Director,
            EntityRole::Worker => EntitySubkind::Worker(WorkerKind::Ephemeral),
            EntityRole::Steward => EntitySubkind::Steward(StewardFocus::Merge),
        };
        Entity::new("agent".into(), subkind)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let storage = MemoryStorage::new();
        let task = Task::new(Uuid::new_v4(), "desc://1".into(), 5);
        TaskStore::create(&storage, task.clone()).await.unwrap();
        let fetched = TaskStore::get(&storage, task.id).await.unwrap();
        assert_eq!(fetched.unwrap().id, task.id);
    }

    #[tokio::test]
    async fn direct_channel_identity_is_symmetric() {
        let storage = MemoryStorage::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ab = storage.create_direct_channel(a, b).await.unwrap();
        let ba = storage.create_direct_channel(b, a).await.unwrap();
        assert_eq!(ab, ba);
    }

    #[tokio::test]
    async fn ready_excludes_assigned_tasks() {
        let storage = MemoryStorage::new();
        let mut assigned = Task::new(Uuid::new_v4(), "desc://2".into(), 1);
        assigned.assignee = Some(Uuid::new_v4());
        TaskStore::create(&storage, assigned).await.unwrap();
        TaskStore::create(&storage, Task::new(Uuid::new_v4(), "desc://3".into(), 1))
            .await
            .unwrap();
        assert_eq!(storage.ready().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn entity_list_filters_by_role() {
        let storage = MemoryStorage::new();
        EntityStore::create(&storage, entity(EntityRole::Worker)).await.unwrap();
        EntityStore::create(&storage, entity(EntityRole::Steward)).await.unwrap();
        let workers = storage
            .list(EntityFilter {
                role: Some(EntityRole::Worker),
                active_only: false,
            })
            .await
            .unwrap();
        assert_eq!(workers.len(), 1);
    }

    #[tokio::test]
    async fn mark_as_read_batch_updates_all() {
        let storage = MemoryStorage::new();
        let entity_id = Uuid::new_v4();
        let a = storage.seed_inbox_item(entity_id, Uuid::new_v4(), Uuid::new_v4()).await;
        let b = storage.seed_inbox_item(entity_id, Uuid::new_v4(), Uuid::new_v4()).await;
        storage.mark_as_read_batch(&[a, b]).await.unwrap();
        let inbox = storage
            .get_inbox(entity_id, InboxFilter { status: Some(InboxStatus::Unread) })
            .await
            .unwrap();
        assert!(inbox.is_empty());
    }
}
