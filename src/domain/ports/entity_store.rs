//! The storage contract's entity-facing slice.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DispatchResult;
use crate::domain::models::{Entity, EntityRole};

/// Filter for `EntityStore::list`.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub role: Option<EntityRole>,
    pub active_only: bool,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, id: Uuid) -> DispatchResult<Option<Entity>>;
    async fn create(&self, entity: Entity) -> DispatchResult<Entity>;
    async fn update(&self, entity: Entity) -> DispatchResult<Entity>;
    async fn list(&self, filter: EntityFilter) -> DispatchResult<Vec<Entity>>;
}
