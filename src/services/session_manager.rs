//! Session Manager: translates start/resume/suspend/stop calls into Spawner
//! calls while maintaining the single-active-session-per-entity invariant and
//! a durable history (§4.2).
//!
//! Grounded on the same `RwLock<HashMap<..>>`-plus-secondary-index shape the
//! teacher uses for its own in-memory session bookkeeping, generalized per
//! Design Note 1: one-way ownership (this owns sessions keyed by id; each
//! session carries its `entityId` as a value), with a secondary "active
//! session per entity" map rebuilt from persisted records at startup, never
//! trusted as primary state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::models::{
    EntitySessionRecord, Session, SessionHistoryEntry, SessionMode, SessionStatus,
};
use crate::domain::ports::{EntityFilter, EntityStore, SpawnerEvent, TaskEvent, TaskStore};
use crate::services::process_spawner::{ProcessSpawner, SpawnOpts, SpawnOutcome};

use tokio::sync::mpsc;

/// How long a terminated session stays queryable before being reaped, per
/// §4.2's terminated-session cleanup rule.
const TERMINATED_RETENTION: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct StartOpts {
    pub working_directory: String,
    pub worktree: Option<String>,
    pub initial_prompt: String,
    pub interactive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ResumeOpts {
    pub provider_session_id: String,
    pub working_directory: String,
    pub worktree: Option<String>,
    pub initial_prompt: String,
    pub interactive: bool,
}

/// The result of the optional Universal Work Principle check run during
/// `resume_session`: a higher-priority ready task the caller should consider
/// dispatching instead of a bare resume.
#[derive(Debug, Clone)]
pub struct UwpCheck {
    pub ready_task_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub entity_id: Option<Uuid>,
    pub role: Option<String>,
    pub statuses: Option<Vec<SessionStatus>>,
    pub resumable: Option<bool>,
}

struct Entry {
    session: Session,
    spawner_id: Uuid,
}

/// Owns the authoritative in-memory session map and the secondary
/// active-session-per-entity index.
pub struct SessionManager<L: crate::domain::ports::ProcessLauncher + 'static> {
    spawner: Arc<ProcessSpawner<L>>,
    entities: Arc<dyn EntityStore>,
    sessions: Arc<RwLock<HashMap<Uuid, Entry>>>,
    active_by_entity: Arc<RwLock<HashMap<Uuid, Uuid>>>,
}

impl<L: crate::domain::ports::ProcessLauncher + 'static> SessionManager<L> {
    #[must_use]
    pub fn new(spawner: Arc<ProcessSpawner<L>>, entities: Arc<dyn EntityStore>) -> Self {
        Self {
            spawner,
            entities,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            active_by_entity: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Writes a session's summary onto its owning entity's persisted
    /// metadata (§4.2's persistence rule: "on every status transition ...
    /// the session's summary and a rolling sessionHistory slice are written
    /// to the owning entity's metadata"). Best-effort: a storage hiccup here
    /// is logged, not propagated, since the in-memory session record remains
    /// authoritative for the running process.
    pub async fn persist_session(&self, session: &Session) {
        let Ok(Some(mut entity)) = self.entities.get(session.entity_id).await else {
            warn!(entity_id = %session.entity_id, "persist_session: owning entity not found");
            return;
        };
        entity.session_id = Some(session.id);
        entity.session_status = Some(session.status);
        entity.provider_session_id = session.provider_session_id.clone();
        if session.status.is_terminal() {
            entity.push_session_history(EntitySessionRecord {
                session_id: session.id,
                provider_session_id: session.provider_session_id.clone(),
                role: session.role.clone(),
                mode: session.mode,
                status: session.status,
                created_at: session.created_at,
                ended_at: session.ended_at,
                termination_reason: session.termination_reason.clone(),
            });
        }
        if let Err(e) = self.entities.update(entity).await {
            warn!(entity_id = %session.entity_id, error = %e, "failed to persist session state onto entity");
        }
    }

    /// Reconstructs a resumable session summary for `entity_id` from its
    /// persisted metadata, per §4.2: "after process restart
    /// `loadSessionState(entityId)` can reconstruct suspended sessions as
    /// resumable." Returns `None` if the entity has no persisted session or
    /// its last known status was already terminal.
    pub async fn load_session_state(&self, entity_id: Uuid) -> DispatchResult<Option<EntitySessionRecord>> {
        let Some(entity) = self.entities.get(entity_id).await? else {
            return Ok(None);
        };
        match (entity.session_status, entity.session_id) {
            (Some(status), Some(session_id)) if !status.is_terminal() => Ok(Some(
                entity
                    .session_history
                    .iter()
                    .rev()
                    .find(|r| r.session_id == session_id)
                    .cloned()
                    .unwrap_or(EntitySessionRecord {
                        session_id,
                        provider_session_id: entity.provider_session_id.clone(),
                        role: String::new(),
                        mode: SessionMode::Headless,
                        status,
                        created_at: chrono::Utc::now(),
                        ended_at: None,
                        termination_reason: None,
                    }),
            )),
            _ => Ok(None),
        }
    }

    /// Reads the `limit` most recent persisted session-history entries for
    /// one entity, newest first.
    pub async fn get_session_history(&self, entity_id: Uuid, limit: Option<usize>) -> DispatchResult<Vec<EntitySessionRecord>> {
        let Some(entity) = self.entities.get(entity_id).await? else {
            return Ok(Vec::new());
        };
        let mut history: Vec<_> = entity.session_history.into_iter().rev().collect();
        if let Some(limit) = limit {
            history.truncate(limit);
        }
        Ok(history)
    }

    /// Reads the `limit` most recent persisted session-history entries
    /// across all entities whose entries carry the given `role`, newest
    /// first.
    pub async fn get_session_history_by_role(&self, role: &str, limit: Option<usize>) -> DispatchResult<Vec<EntitySessionRecord>> {
        let entities = self.entities.list(EntityFilter::default()).await?;
        let mut history: Vec<EntitySessionRecord> = entities
            .into_iter()
            .flat_map(|e| e.session_history)
            .filter(|r| r.role == role)
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            history.truncate(limit);
        }
        Ok(history)
    }

    /// The single most recent completed session for `role` across all
    /// entities, or `None` if none has ever run.
    pub async fn get_previous_session(&self, role: &str) -> DispatchResult<Option<EntitySessionRecord>> {
        Ok(self.get_session_history_by_role(role, Some(1)).await?.into_iter().next())
    }

    /// Rebuilds the secondary active-session index from persisted session
    /// records, per Design Note 1. Never trusted as the only copy: a crash
    /// after this runs but before a later write is simply re-derived on the
    /// next startup.
    pub async fn reload_active_index(&self, persisted: &[Session]) {
        let mut index = self.active_by_entity.write().await;
        index.clear();
        for s in persisted {
            if s.is_active_for_invariant() {
                index.insert(s.entity_id, s.id);
            }
        }
    }

    #[instrument(skip(self, opts), fields(entity_id = %entity_id))]
    pub async fn start_session(
        &self,
        entity_id: Uuid,
        role: impl Into<String> + Send,
        opts: StartOpts,
    ) -> DispatchResult<(Session, mpsc::Receiver<SpawnerEvent>)> {
        {
            let index = self.active_by_entity.read().await;
            if index.contains_key(&entity_id) {
                return Err(DispatchError::AlreadyActive(entity_id));
            }
        }
        let role = role.into();
        let outcome = self
            .spawner
            .spawn(SpawnOpts {
                entity_id,
                role,
                working_directory: opts.working_directory,
                initial_prompt: opts.initial_prompt,
                interactive: opts.interactive,
                resume: None,
            })
            .await?;
        self.track_new_session(entity_id, outcome).await
    }

    #[instrument(skip(self, opts, get_ready_tasks), fields(entity_id = %entity_id))]
    pub async fn resume_session<F>(
        &self,
        entity_id: Uuid,
        role: impl Into<String> + Send,
        opts: ResumeOpts,
        get_ready_tasks: Option<F>,
    ) -> DispatchResult<(Session, mpsc::Receiver<SpawnerEvent>, Option<UwpCheck>)>
    where
        F: FnOnce(Uuid, usize) -> Vec<Uuid> + Send,
    {
        {
            let index = self.active_by_entity.read().await;
            if index.contains_key(&entity_id) {
                return Err(DispatchError::AlreadyActive(entity_id));
            }
        }
        let role = role.into();
        let outcome = self
            .spawner
            .spawn(SpawnOpts {
                entity_id,
                role,
                working_directory: opts.working_directory,
                initial_prompt: opts.initial_prompt,
                interactive: opts.interactive,
                resume: Some(opts.provider_session_id),
            })
            .await?;
        let uwp = get_ready_tasks.and_then(|f| {
            let ready = f(entity_id, 1);
            if ready.is_empty() {
                None
            } else {
                Some(UwpCheck { ready_task_ids: ready })
            }
        });
        let (session, events) = self.track_new_session(entity_id, outcome).await?;
        Ok((session, events, uwp))
    }

    async fn track_new_session(
        &self,
        entity_id: Uuid,
        outcome: SpawnOutcome,
    ) -> DispatchResult<(Session, mpsc::Receiver<SpawnerEvent>)> {
        let session = outcome.session;
        let spawner_id = session.id;
        self.active_by_entity.write().await.insert(entity_id, session.id);
        self.sessions.write().await.insert(
            session.id,
            Entry {
                session: session.clone(),
                spawner_id,
            },
        );
        self.persist_session(&session).await;
        Ok((session, outcome.events))
    }

    pub async fn suspend_session(&self, session_id: Uuid, reason: Option<String>) -> DispatchResult<Session> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(&session_id)
            .ok_or_else(|| DispatchError::NotFound(format!("session {session_id}")))?;
        entry
            .session
            .transition_to(SessionStatus::Suspended)
            .map_err(|(from, to)| DispatchError::IllegalTransition {
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            })?;
        self.spawner.suspend(entry.spawner_id).await?;
        if let Some(reason) = reason {
            entry.session.termination_reason = Some(reason);
        }
        let session = entry.session.clone();
        drop(sessions);
        self.persist_session(&session).await;
        Ok(session)
    }

    #[instrument(skip(self))]
    pub async fn stop_session(&self, session_id: Uuid, reason: Option<String>, graceful: bool) -> DispatchResult<Session> {
        let spawner_id = {
            let sessions = self.sessions.read().await;
            sessions
                .get(&session_id)
                .ok_or_else(|| DispatchError::NotFound(format!("session {session_id}")))?
                .spawner_id
        };
        self.spawner.terminate(spawner_id, graceful).await?;

        let session = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .get_mut(&session_id)
                .ok_or_else(|| DispatchError::NotFound(format!("session {session_id}")))?;
            entry.session.force_terminated(reason.unwrap_or_else(|| "stopped".into()));
            entry.session.clone()
        };
        self.active_by_entity.write().await.remove(&session.entity_id);
        self.persist_session(&session).await;
        self.schedule_cleanup(session_id);
        Ok(session)
    }

    fn schedule_cleanup(&self, session_id: Uuid) {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            sleep(TERMINATED_RETENTION).await;
            let keep = sessions
                .read()
                .await
                .get(&session_id)
                .is_some_and(|e| !e.session.persisted);
            if !keep {
                sessions.write().await.remove(&session_id);
            }
        });
    }

    /// Verifies liveness for every claimed-active session belonging to
    /// `entity_id`, self-healing any that are actually dead (§4.2, Testable
    /// Property 10), then returns the entity's sole active session if one
    /// remains.
    pub async fn get_active_session(&self, entity_id: Uuid) -> DispatchResult<Option<Session>> {
        let session_id = { self.active_by_entity.read().await.get(&entity_id).copied() };
        let Some(session_id) = session_id else {
            return Ok(None);
        };
        self.verify_liveness(session_id).await?;
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&session_id).map(|e| e.session.clone()))
    }

    async fn verify_liveness(&self, session_id: Uuid) -> DispatchResult<()> {
        let (entity_id, mode, pid, status) = {
            let sessions = self.sessions.read().await;
            let Some(entry) = sessions.get(&session_id) else {
                return Ok(());
            };
            (
                entry.session.entity_id,
                entry.session.mode,
                entry.session.pid,
                entry.session.status,
            )
        };
        if status.is_terminal() {
            return Ok(());
        }

        let dead = match mode {
            SessionMode::Interactive => pid.is_some_and(|pid| !self.spawner.is_alive(pid)),
            SessionMode::Headless => {
                let spawner_status = {
                    let sessions = self.sessions.read().await;
                    sessions.get(&session_id).map(|e| e.spawner_id)
                };
                match spawner_status {
                    Some(spawner_id) => !matches!(
                        self.spawner.session_status(spawner_id).await,
                        Some(SessionStatus::Starting | SessionStatus::Running | SessionStatus::Suspended)
                    ),
                    None => true,
                }
            }
        };

        if dead {
            warn!(session_id = %session_id, entity_id = %entity_id, "liveness check found a dead session, self-healing");
            let healed = {
                let mut sessions = self.sessions.write().await;
                sessions.get_mut(&session_id).map(|entry| {
                    entry.session.force_terminated("Process no longer alive");
                    entry.session.clone()
                })
            };
            self.active_by_entity.write().await.remove(&entity_id);
            if let Some(session) = healed {
                self.persist_session(&session).await;
            }
        }
        Ok(())
    }

    pub async fn list_sessions(&self, filter: SessionFilter) -> DispatchResult<Vec<Session>> {
        if let Some(entity_id) = filter.entity_id {
            self.verify_liveness_for_entity(entity_id).await?;
        } else {
            let ids: Vec<Uuid> = self.sessions.read().await.keys().copied().collect();
            for id in ids {
                self.verify_liveness(id).await?;
            }
        }
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .map(|e| &e.session)
            .filter(|s| filter.entity_id.is_none_or(|id| s.entity_id == id))
            .filter(|s| filter.role.as_deref().is_none_or(|r| s.role == r))
            .filter(|s| {
                filter
                    .statuses
                    .as_ref()
                    .is_none_or(|statuses| statuses.contains(&s.status))
            })
            .filter(|s| {
                filter
                    .resumable
                    .is_none_or(|want| want == s.provider_session_id.is_some())
            })
            .cloned()
            .collect())
    }

    async fn verify_liveness_for_entity(&self, entity_id: Uuid) -> DispatchResult<()> {
        if let Some(session_id) = self.active_by_entity.read().await.get(&entity_id).copied() {
            self.verify_liveness(session_id).await?;
        }
        Ok(())
    }

    /// Injects a user-role message into a live session. Fails unless the
    /// session's status accepts input (only `running`, per §4.3).
    pub async fn message_session(&self, session_id: Uuid, content: String) -> DispatchResult<()> {
        let spawner_id = {
            let sessions = self.sessions.read().await;
            let entry = sessions
                .get(&session_id)
                .ok_or_else(|| DispatchError::NotFound(format!("session {session_id}")))?;
            if !entry.session.status.accepts_input() {
                return Err(DispatchError::InvalidArgument(format!(
                    "session {session_id} does not accept input in status {:?}",
                    entry.session.status
                )));
            }
            entry.spawner_id
        };
        self.spawner.send_input(spawner_id, content).await
    }

    /// Records a session's entry into the owning task's persisted
    /// `sessionHistory`, bounded per `MAX_SESSION_HISTORY`. Called by
    /// `services::task_assignment` right after `dispatch`.
    pub async fn append_task_session_history(
        &self,
        task_store: &dyn TaskStore,
        task_id: Uuid,
        entry: SessionHistoryEntry,
    ) -> DispatchResult<()> {
        let mut task = task_store
            .get(task_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("task {task_id}")))?;
        if entry.provider_session_id.is_some() {
            task.orchestrator.session_id = entry.provider_session_id.clone();
        }
        task.orchestrator.push_session_history(entry);
        task_store
            .update(
                task_id,
                crate::domain::ports::TaskPatch {
                    orchestrator: Some(task.orchestrator),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    pub async fn log_session_event(event_log: &dyn crate::domain::ports::EventLog, event: TaskEvent) -> DispatchResult<()> {
        event_log.append(event).await
    }
}

/// Tracks the duplicate-forward guard's in-flight set for the Inbox Router.
/// Lives alongside the session manager because both are per-daemon singleton
/// state; kept as a standalone type so it is independently unit testable.
#[derive(Default)]
pub struct InFlightForwardSet {
    inner: RwLock<HashSet<Uuid>>,
}

impl InFlightForwardSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically checks-and-inserts. Returns `true` if this caller won the
    /// race and should proceed with the forward.
    pub async fn try_claim(&self, inbox_item_id: Uuid) -> bool {
        let mut set = self.inner.write().await;
        set.insert(inbox_item_id)
    }

    pub async fn release(&self, inbox_item_id: Uuid) {
        self.inner.write().await.remove(&inbox_item_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fakes::FakeProcessLauncher;
    use crate::adapters::memory_storage::MemoryStorage;
    use crate::domain::models::{Entity, EntitySubkind, WorkerKind};
    use crate::services::process_spawner::SpawnerConfig;

    fn manager() -> SessionManager<FakeProcessLauncher> {
        let spawner = Arc::new(ProcessSpawner::new(SpawnerConfig::default(), Arc::new(FakeProcessLauncher::new())));
        SessionManager::new(spawner, MemoryStorage::shared())
    }

    /// Law 6: start, suspend, and (simulating a restart) reload from the
    /// entity's persisted metadata reconstruct a record carrying the same
    /// `providerSessionId`.
    #[tokio::test]
    async fn round_trip_of_session_persistence_preserves_provider_session_id() {
        let storage = MemoryStorage::shared();
        let spawner = Arc::new(ProcessSpawner::new(SpawnerConfig::default(), Arc::new(FakeProcessLauncher::new())));
        let mgr = SessionManager::new(spawner, storage.clone());
        let entity = Entity::new("w1", EntitySubkind::Worker(WorkerKind::Ephemeral));
        EntityStore::create(storage.as_ref(), entity.clone()).await.unwrap();

        let (session, _events) = mgr
            .start_session(
                entity.id,
                "worker",
                StartOpts {
                    working_directory: "/wt".into(),
                    worktree: None,
                    initial_prompt: "go".into(),
                    interactive: false,
                },
            )
            .await
            .unwrap();
        let provider_session_id = session.provider_session_id.clone();

        mgr.suspend_session(session.id, None).await.unwrap();

        // Simulate a process restart: a fresh SessionManager over the same
        // storage has no in-memory record at all.
        let spawner2 = Arc::new(ProcessSpawner::new(SpawnerConfig::default(), Arc::new(FakeProcessLauncher::new())));
        let mgr2 = SessionManager::new(spawner2, storage.clone());
        let reloaded = mgr2.load_session_state(entity.id).await.unwrap();
        assert!(reloaded.is_some());
        assert_eq!(reloaded.unwrap().provider_session_id, provider_session_id);

        let previous = mgr2.get_previous_session("worker").await.unwrap();
        assert!(previous.is_none(), "history only records terminal sessions; a suspended one isn't in it yet");
    }

    #[tokio::test]
    async fn start_session_rejects_a_second_concurrent_session() {
        let mgr = manager();
        let entity_id = Uuid::new_v4();
        mgr.start_session(
            entity_id,
            "worker",
            StartOpts {
                working_directory: "/wt".into(),
                worktree: None,
                initial_prompt: "go".into(),
                interactive: false,
            },
        )
        .await
        .unwrap();
        let err = mgr
            .start_session(
                entity_id,
                "worker",
                StartOpts {
                    working_directory: "/wt".into(),
                    worktree: None,
                    initial_prompt: "go".into(),
                    interactive: false,
                },
            )
            .await;
        assert!(matches!(err, Err(DispatchError::AlreadyActive(_))));
    }

    #[tokio::test]
    async fn get_active_session_returns_none_after_stop() {
        let mgr = manager();
        let entity_id = Uuid::new_v4();
        let (session, _events) = mgr
            .start_session(
                entity_id,
                "worker",
                StartOpts {
                    working_directory: "/wt".into(),
                    worktree: None,
                    initial_prompt: "go".into(),
                    interactive: false,
                },
            )
            .await
            .unwrap();
        mgr.stop_session(session.id, None, true).await.unwrap();
        assert!(mgr.get_active_session(entity_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_flight_forward_set_prevents_double_claim() {
        let set = InFlightForwardSet::new();
        let id = Uuid::new_v4();
        assert!(set.try_claim(id).await);
        assert!(!set.try_claim(id).await);
        set.release(id).await;
        assert!(set.try_claim(id).await);
    }

    /// A headless session the Spawner no longer has any record of (it
    /// exited without the Session Manager ever calling `stop_session`)
    /// self-heals on the next liveness check: `getActiveSession` forces the
    /// record to `terminated` and stops reporting it as active.
    #[tokio::test]
    async fn get_active_session_self_heals_a_session_the_spawner_has_forgotten() {
        let mgr = manager();
        let entity_id = Uuid::new_v4();
        let (session, _events) = mgr
            .start_session(
                entity_id,
                "worker",
                StartOpts {
                    working_directory: "/wt".into(),
                    worktree: None,
                    initial_prompt: "go".into(),
                    interactive: false,
                },
            )
            .await
            .unwrap();

        // Desync the Spawner's belief from what the Session Manager thinks,
        // without going through `stop_session` (which would keep both in
        // sync). This mirrors a process that died without the orchestrator
        // having reaped it yet.
        mgr.spawner.terminate(session.id, true).await.unwrap();

        let active = mgr.get_active_session(entity_id).await.unwrap();
        assert!(active.is_none(), "dead session should no longer be reported as active");

        let healed = mgr.sessions.read().await.get(&session.id).unwrap().session.clone();
        assert_eq!(healed.status, SessionStatus::Terminated);
        assert_eq!(healed.termination_reason.as_deref(), Some("Process no longer alive"));
    }
}
