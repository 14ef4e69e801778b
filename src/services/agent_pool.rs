//! Agent Pool: process-wide concurrency counters by `(role, subkind)`.
//!
//! The simplest component in the system (5% budget share). No persistent
//! state — counters live only as long as the daemon process does, matching
//! §3's "Agent Pool — process-wide counters... No persistent state."

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::models::EntitySubkind;

/// Key the concurrency caps and live counts are tracked by.
pub type PoolKey = EntitySubkind;

/// Arguments to `AgentPool::can_spawn`.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub subkind: EntitySubkind,
    pub agent_id: Uuid,
}

/// Enforces per-role concurrency caps before spawning.
pub struct AgentPool {
    caps: HashMap<PoolKey, usize>,
    live: Arc<Mutex<HashMap<PoolKey, usize>>>,
}

impl AgentPool {
    #[must_use]
    pub fn new(caps: HashMap<PoolKey, usize>) -> Self {
        Self {
            caps,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A negative answer means the caller should defer the dispatch to a
    /// future cycle with no state change — `can_spawn` itself never mutates.
    pub async fn can_spawn(&self, req: &SpawnRequest) -> bool {
        let Some(cap) = self.caps.get(&req.subkind) else {
            // No configured cap for this subkind means unbounded.
            return true;
        };
        let live = self.live.lock().await;
        live.get(&req.subkind).copied().unwrap_or(0) < *cap
    }

    /// Signalled after a successful spawn so the pool can decrement its
    /// budget.
    pub async fn on_agent_spawned(&self, subkind: EntitySubkind) {
        let mut live = self.live.lock().await;
        *live.entry(subkind).or_insert(0) += 1;
    }

    /// Signalled when a session for this subkind ends, returning the slot to
    /// the pool.
    pub async fn on_agent_ended(&self, subkind: EntitySubkind) {
        let mut live = self.live.lock().await;
        if let Some(count) = live.get_mut(&subkind) {
            *count = count.saturating_sub(1);
        }
    }

    #[cfg(test)]
    async fn live_count(&self, subkind: &PoolKey) -> usize {
        self.live.lock().await.get(subkind).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::WorkerKind;

    fn worker_subkind() -> EntitySubkind {
        EntitySubkind::Worker(WorkerKind::Ephemeral)
    }

    #[tokio::test]
    async fn unconfigured_subkind_is_unbounded() {
        let pool = AgentPool::new(HashMap::new());
        let req = SpawnRequest {
            subkind: worker_subkind(),
            agent_id: Uuid::new_v4(),
        };
        assert!(pool.can_spawn(&req).await);
    }

    #[tokio::test]
    async fn cap_is_enforced() {
        let mut caps = HashMap::new();
        caps.insert(worker_subkind(), 1);
        let pool = AgentPool::new(caps);
        let req = SpawnRequest {
            subkind: worker_subkind(),
            agent_id: Uuid::new_v4(),
        };

        assert!(pool.can_spawn(&req).await);
        pool.on_agent_spawned(worker_subkind()).await;
        assert!(!pool.can_spawn(&req).await);
    }

    #[tokio::test]
    async fn ending_an_agent_frees_a_slot() {
        let mut caps = HashMap::new();
        caps.insert(worker_subkind(), 1);
        let pool = AgentPool::new(caps);

        pool.on_agent_spawned(worker_subkind()).await;
        assert_eq!(pool.live_count(&worker_subkind()).await, 1);
        pool.on_agent_ended(worker_subkind()).await;
        assert_eq!(pool.live_count(&worker_subkind()).await, 0);
    }

    #[tokio::test]
    async fn ending_below_zero_saturates() {
        let pool = AgentPool::new(HashMap::new());
        pool.on_agent_ended(worker_subkind()).await;
        assert_eq!(pool.live_count(&worker_subkind()).await, 0);
    }
}
