//! Entity: an opaque identity with a role, owning at most one active session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::{SessionMode, SessionStatus};

/// How many entries `Entity::push_session_history` retains, mirroring
/// `task::MAX_SESSION_HISTORY` for the per-task equivalent.
pub const MAX_ENTITY_SESSION_HISTORY: usize = 20;

/// The three roles an entity can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRole {
    /// Single, interactive entity that a human drives directly.
    Director,
    /// One of many; does the actual task work.
    Worker,
    /// One of many; inspects and merges completed work or watches health.
    Steward,
}

/// Worker lifespan: ephemeral workers are spun up per-task, persistent workers
/// keep a running session across many tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Ephemeral,
    Persistent,
}

/// What a steward entity is watching for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StewardFocus {
    Merge,
    Health,
}

/// The subkind half of an entity's `(role, subkind)` identity, used by the
/// Agent Pool's concurrency counters and the Inbox Router's classification
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EntitySubkind {
    Director,
    Worker(WorkerKind),
    Steward(StewardFocus),
}

impl EntitySubkind {
    /// The `EntityRole` this subkind corresponds to.
    #[must_use]
    pub const fn role(&self) -> EntityRole {
        match self {
            Self::Director => EntityRole::Director,
            Self::Worker(_) => EntityRole::Worker,
            Self::Steward(_) => EntityRole::Steward,
        }
    }
}

/// An entity's name, e.g. `"claude-worker-3"`. Used to derive deterministic
/// worktree paths and branch names.
pub type EntityName = String;

/// One entry in an entity's persisted `sessionHistory` (§6): a summary of a
/// session that ran against this entity, independent of which task (if any)
/// it was spawned for. Leaner than `task::SessionHistoryEntry` since the
/// entity already knows its own id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySessionRecord {
    pub session_id: Uuid,
    pub provider_session_id: Option<String>,
    pub role: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<String>,
}

/// An opaque identity with a role. Created once, never destroyed — deactivation
/// is modeled as a flag, never a deletion, since historical sessions still
/// reference the entity by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub name: EntityName,
    pub subkind: EntitySubkind,
    pub active: bool,

    /// Mirrors the live session currently (or most recently) bound to this
    /// entity, per §6's persisted-state-layout (`{sessionId?, sessionStatus,
    /// sessionHistory[]}`). Kept in sync by `SessionManager::persist_session`
    /// on every status transition so `loadSessionState` can reconstruct a
    /// suspended session as resumable after a process restart.
    pub session_id: Option<Uuid>,
    pub session_status: Option<SessionStatus>,
    /// Mirrors the live session's `providerSessionId`, kept alongside
    /// `session_id`/`session_status` (rather than only inside
    /// `session_history`, which only gains an entry once a session reaches a
    /// terminal status) so a *suspended* session's provider id survives a
    /// restart too.
    pub provider_session_id: Option<String>,
    pub session_history: Vec<EntitySessionRecord>,
}

impl Entity {
    #[must_use]
    pub fn new(name: impl Into<String>, subkind: EntitySubkind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            subkind,
            active: true,
            session_id: None,
            session_status: None,
            provider_session_id: None,
            session_history: Vec::new(),
        }
    }

    #[must_use]
    pub const fn role(&self) -> EntityRole {
        self.subkind.role()
    }

    /// Soft-deactivate. The entity's id remains valid for historical lookups.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Appends a session-history entry, evicting the oldest once
    /// `MAX_ENTITY_SESSION_HISTORY` is exceeded.
    pub fn push_session_history(&mut self, entry: EntitySessionRecord) {
        self.session_history.push(entry);
        if self.session_history.len() > MAX_ENTITY_SESSION_HISTORY {
            let excess = self.session_history.len() - MAX_ENTITY_SESSION_HISTORY;
            self.session_history.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subkind_role_mapping() {
        assert_eq!(EntitySubkind::Director.role(), EntityRole::Director);
        assert_eq!(
            EntitySubkind::Worker(WorkerKind::Ephemeral).role(),
            EntityRole::Worker
        );
        assert_eq!(
            EntitySubkind::Steward(StewardFocus::Merge).role(),
            EntityRole::Steward
        );
    }

    #[test]
    fn deactivate_keeps_id() {
        let mut e = Entity::new("w1", EntitySubkind::Worker(WorkerKind::Ephemeral));
        let id = e.id;
        e.deactivate();
        assert_eq!(e.id, id);
        assert!(!e.active);
    }
}
