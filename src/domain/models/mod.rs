//! Domain models.
//!
//! Pure domain entities with business logic and validation rules. Framework
//! agnostic, no infrastructure concerns.

pub mod entity;
pub mod events;
pub mod inbox;
pub mod session;
pub mod task;
pub mod worktree;

pub use entity::{
    Entity, EntityName, EntityRole, EntitySessionRecord, EntitySubkind, StewardFocus, WorkerKind,
    MAX_ENTITY_SESSION_HISTORY,
};
pub use events::{DaemonEvent, NotificationLevel, PollKind, PollResult};
pub use inbox::{InboxItem, InboxStatus, Message, MessageKind};
pub use session::{Session, SessionMode, SessionStatus};
pub use task::{
    MergeStatus, OrchestratorMeta, SessionHistoryEntry, SyncResult, Task, TaskStatus,
    MAX_SESSION_HISTORY,
};
pub use worktree::{Worktree, WorktreeKey};
