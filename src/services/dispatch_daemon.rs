//! Dispatch Daemon: the single-threaded poll loop that ties every other
//! service together (§4.1).
//!
//! Grounded on `memory_decay_daemon.rs`'s lifecycle shape — an `AtomicBool`
//! stop flag, a `tokio::time::interval` driving a `run_loop` spawned via
//! `tokio::spawn`, events surfaced on an `mpsc::Receiver` the caller drains —
//! generalized from one maintenance cycle to the seven independently
//! toggleable sub-polls the dispatcher runs in a fixed order every tick.
//! A `Mutex<()>` cycle lock stands in for that daemon's single `self`
//! ownership: since `DispatchDaemon` exposes each sub-poll as its own public
//! method (for direct invocation in tests and by operators), the lock is
//! what keeps two cycles from ever running concurrently against the same
//! entities.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::warn;
use uuid::Uuid;

use crate::domain::errors::DispatchResult;
use crate::domain::models::{
    DaemonEvent, Entity, EntityRole, NotificationLevel, PollKind, PollResult, Session,
    SessionHistoryEntry, TaskStatus, WorktreeKey,
};
use crate::domain::ports::{
    EntityFilter, EntityStore, EventLog, InboxFilter, InboxStatus, MessageStore, ProcessLauncher,
    SpawnerEvent, TaskEvent, TaskFilter, TaskStore, WorktreeManager,
};
use crate::services::agent_pool::{AgentPool, SpawnRequest};
use crate::services::inbox_router::{Disposition, InboxRouter, TriageBatch};
use crate::services::merge_pipeline::MergePipeline;
use crate::services::session_manager::{ResumeOpts, SessionFilter, SessionManager, StartOpts};
use crate::services::task_assignment::{DispatchOpts, TaskAssignment};
use crate::services::worktree_coordinator::WorktreeCoordinator;

/// Clamp bounds for `poll_interval`, per §4.1's boundary rule.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// How long `stop()` waits for an in-flight cycle before giving up, per §5.
const STOP_GRACE: Duration = Duration::from_secs(30);

/// Configuration for the dispatch daemon's poll cycle and its toggles.
#[derive(Debug, Clone)]
pub struct DispatchDaemonConfig {
    pub poll_interval: Duration,
    pub worker_availability_poll_enabled: bool,
    pub inbox_poll_enabled: bool,
    pub steward_trigger_poll_enabled: bool,
    pub workflow_task_poll_enabled: bool,
    pub orphan_recovery_enabled: bool,
    pub closed_unmerged_reconciliation_enabled: bool,
    pub stuck_merge_recovery_enabled: bool,
    /// Sessions running longer than this are reaped. Disabled when `None`.
    pub max_session_duration: Option<ChronoDuration>,
    pub director_inbox_forwarding_enabled: bool,
    pub director_inbox_idle_threshold: Duration,
}

impl Default for DispatchDaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            worker_availability_poll_enabled: true,
            inbox_poll_enabled: true,
            steward_trigger_poll_enabled: true,
            workflow_task_poll_enabled: true,
            orphan_recovery_enabled: true,
            closed_unmerged_reconciliation_enabled: true,
            stuck_merge_recovery_enabled: true,
            max_session_duration: None,
            director_inbox_forwarding_enabled: true,
            director_inbox_idle_threshold: Duration::from_secs(120),
        }
    }
}

impl DispatchDaemonConfig {
    fn normalized(mut self) -> Self {
        self.poll_interval = self.poll_interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
        self
    }
}

/// The storage/worktree ports the daemon needs directly, bundled so
/// `DispatchDaemon::new` doesn't take six bare `Arc<dyn ...>` positionals.
pub struct DispatchDaemonPorts {
    pub tasks: Arc<dyn TaskStore>,
    pub entities: Arc<dyn EntityStore>,
    pub messages: Arc<dyn MessageStore>,
    pub inbox: Arc<dyn crate::domain::ports::InboxStore>,
    pub events: Arc<dyn EventLog>,
    pub worktrees: Arc<dyn WorktreeManager>,
}

/// Called once, synchronously, right after a session is started (by any
/// poll, including startup orphan recovery), so an external observer can
/// attach per-session bookkeeping without racing the daemon's own watcher.
pub type SessionStartedHook = Arc<dyn Fn(&Session, Uuid, &str) + Send + Sync>;

fn role_label(role: EntityRole) -> &'static str {
    match role {
        EntityRole::Director => "director",
        EntityRole::Worker => "worker",
        EntityRole::Steward => "steward",
    }
}

pub struct DispatchDaemon<L: ProcessLauncher + 'static> {
    tasks: Arc<dyn TaskStore>,
    entities: Arc<dyn EntityStore>,
    messages: Arc<dyn MessageStore>,
    inbox: Arc<dyn crate::domain::ports::InboxStore>,
    events: Arc<dyn EventLog>,
    worktrees: Arc<dyn WorktreeManager>,

    worktree_coordinator: Arc<WorktreeCoordinator>,
    task_assignment: TaskAssignment,
    sessions: Arc<SessionManager<L>>,
    inbox_router: Arc<InboxRouter>,
    merge_pipeline: MergePipeline,
    agent_pool: Arc<AgentPool>,

    config: DispatchDaemonConfig,
    on_session_started: SessionStartedHook,
    director_last_input: Mutex<HashMap<Uuid, Instant>>,
    stop_flag: Arc<AtomicBool>,
    cycle_lock: Mutex<()>,
}

impl<L: ProcessLauncher + 'static> DispatchDaemon<L> {
    #[must_use]
    pub fn new(
        ports: DispatchDaemonPorts,
        sessions: Arc<SessionManager<L>>,
        agent_pool: Arc<AgentPool>,
        merge_pipeline: MergePipeline,
        config: DispatchDaemonConfig,
        on_session_started: SessionStartedHook,
    ) -> Self {
        let in_flight = Arc::new(crate::services::session_manager::InFlightForwardSet::new());
        let worktree_coordinator = Arc::new(WorktreeCoordinator::new(Arc::clone(&ports.worktrees)));
        let task_assignment = TaskAssignment::new(
            Arc::clone(&ports.tasks),
            Arc::clone(&ports.entities),
            Arc::clone(&ports.messages),
        );
        let inbox_router = Arc::new(InboxRouter::new(Arc::clone(&ports.inbox), Arc::clone(&ports.worktrees), in_flight));

        Self {
            tasks: ports.tasks,
            entities: ports.entities,
            messages: ports.messages,
            inbox: ports.inbox,
            events: ports.events,
            worktrees: ports.worktrees,
            worktree_coordinator,
            task_assignment,
            sessions,
            inbox_router,
            merge_pipeline,
            agent_pool,
            config: config.normalized(),
            on_session_started,
            director_last_input: Mutex::new(HashMap::new()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            cycle_lock: Mutex::new(()),
        }
    }

    /// Startup sequence (§4.1): reconcile stale sessions, run one orphan
    /// recovery pass synchronously, then start the interval timer.
    ///
    /// There is no dedicated session-persistence port in this model — a
    /// task's `orchestrator` fields (`sessionId`, `assignedAgent`, worktree)
    /// are the durable record of what was running. `reload_active_index` is
    /// therefore always seeded empty: it exists so `SessionManager` never
    /// has to special-case "just booted", and the real reconciliation work
    /// is orphan recovery itself (see Decision D7 in the grounding ledger).
    pub async fn run(self: Arc<Self>) -> mpsc::Receiver<DaemonEvent> {
        let (tx, rx) = mpsc::channel(256);
        self.sessions.reload_active_index(&[]).await;
        if self.config.orphan_recovery_enabled {
            if let Err(e) = self.recover_orphaned_assignments(&tx).await {
                warn!(error = %e, "orphan recovery pass failed at startup");
            }
        }
        let daemon = Arc::clone(&self);
        tokio::spawn(async move { daemon.run_loop(tx).await });
        rx
    }

    /// Requests shutdown and waits for the in-flight cycle to finish, bounded
    /// at 30s (§5). Returns regardless of whether the wait completed.
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let _ = timeout(STOP_GRACE, self.cycle_lock.lock()).await;
    }

    async fn run_loop(self: Arc<Self>, tx: mpsc::Sender<DaemonEvent>) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            let Ok(guard) = self.cycle_lock.try_lock() else {
                continue;
            };
            self.run_cycle(&tx).await;
            drop(guard);
        }
    }

    /// Runs the seven sub-polls in the fixed order §4.1 specifies. Each is
    /// independently failure-isolated: an error from one never aborts the
    /// rest of the cycle.
    pub async fn run_cycle(&self, tx: &mpsc::Sender<DaemonEvent>) {
        if self.config.max_session_duration.is_some() {
            let _ = self.poll_reap_max_duration(tx).await;
        }
        if self.config.inbox_poll_enabled {
            let _ = self.poll_inbox(tx).await;
        }
        if self.config.worker_availability_poll_enabled {
            let _ = self.poll_worker_availability(tx).await;
        }
        if self.config.steward_trigger_poll_enabled {
            let _ = self.poll_steward_trigger(tx).await;
        }
        if self.config.workflow_task_poll_enabled {
            let _ = self.poll_workflow_task(tx).await;
        }
        if self.config.closed_unmerged_reconciliation_enabled {
            let _ = self.poll_closed_unmerged_reconciliation(tx).await;
        }
        if self.config.stuck_merge_recovery_enabled {
            let _ = self.poll_stuck_merge_recovery(tx).await;
        }
    }

    fn finish(&self, kind: PollKind, started_at: DateTime<Utc>, t0: Instant, processed: u64, errors: u64, error_messages: Vec<String>) -> PollResult {
        PollResult {
            poll_type: kind,
            started_at,
            duration_ms: u64::try_from(t0.elapsed().as_millis()).unwrap_or(u64::MAX),
            processed,
            errors,
            error_messages: if error_messages.is_empty() { None } else { Some(error_messages) },
        }
    }

    async fn log_event(&self, task_id: Uuid, kind: &str, payload: serde_json::Value) {
        let event = TaskEvent {
            id: Uuid::new_v4(),
            task_id,
            kind: kind.to_string(),
            payload,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.events.append(event).await {
            warn!(error = %e, task_id = %task_id, "failed to append task event");
        }
    }

    // ---- 1. Max session duration reap ---------------------------------

    pub async fn poll_reap_max_duration(&self, tx: &mpsc::Sender<DaemonEvent>) -> DispatchResult<PollResult> {
        let kind = PollKind::MaxSessionDurationReap;
        let _ = tx.send(DaemonEvent::PollStart { kind }).await;
        let started_at = Utc::now();
        let t0 = Instant::now();

        let Some(max_duration) = self.config.max_session_duration else {
            let result = self.finish(kind, started_at, t0, 0, 0, Vec::new());
            let _ = tx.send(DaemonEvent::PollComplete { result: result.clone() }).await;
            return Ok(result);
        };

        let sessions = match self.sessions.list_sessions(SessionFilter::default()).await {
            Ok(s) => s,
            Err(e) => {
                let _ = tx.send(DaemonEvent::PollError { kind, error: e.to_string() }).await;
                return Err(e);
            }
        };

        let mut processed = 0u64;
        let mut errors = 0u64;
        let mut error_messages = Vec::new();
        let now = Utc::now();

        for session in sessions {
            if session.status.is_terminal() || now - session.created_at < max_duration {
                continue;
            }
            match self
                .sessions
                .stop_session(session.id, Some("max session duration exceeded".into()), true)
                .await
            {
                Ok(_) => processed += 1,
                Err(e) => {
                    errors += 1;
                    error_messages.push(e.to_string());
                }
            }
        }

        let result = self.finish(kind, started_at, t0, processed, errors, error_messages);
        let _ = tx.send(DaemonEvent::PollComplete { result: result.clone() }).await;
        Ok(result)
    }

    // ---- 2. Inbox poll --------------------------------------------------

    pub async fn poll_inbox(&self, tx: &mpsc::Sender<DaemonEvent>) -> DispatchResult<PollResult> {
        let kind = PollKind::Inbox;
        let _ = tx.send(DaemonEvent::PollStart { kind }).await;
        let started_at = Utc::now();
        let t0 = Instant::now();

        let entities = match self
            .entities
            .list(EntityFilter { role: None, active_only: true })
            .await
        {
            Ok(e) => e,
            Err(e) => {
                let _ = tx.send(DaemonEvent::PollError { kind, error: e.to_string() }).await;
                return Err(e);
            }
        };

        let mut processed = 0u64;
        let mut errors = 0u64;
        let mut error_messages = Vec::new();

        for entity in entities {
            match self.process_one_inbox(&entity, tx).await {
                Ok(count) => processed += count,
                Err(e) => {
                    errors += 1;
                    error_messages.push(format!("entity {}: {e}", entity.id));
                }
            }
        }

        let result = self.finish(kind, started_at, t0, processed, errors, error_messages);
        let _ = tx.send(DaemonEvent::PollComplete { result: result.clone() }).await;
        Ok(result)
    }

    async fn process_one_inbox(&self, entity: &Entity, tx: &mpsc::Sender<DaemonEvent>) -> DispatchResult<u64> {
        let active_session = self.sessions.get_active_session(entity.id).await?;
        let session_active = active_session.is_some();
        let director_idle = entity.role() == EntityRole::Director
            && self.config.director_inbox_forwarding_enabled
            && self.is_director_idle(entity.id).await;

        let unread = self
            .inbox
            .get_inbox(entity.id, InboxFilter { status: Some(InboxStatus::Unread) })
            .await?;
        let mut message_cache = HashMap::new();
        for item in &unread {
            if let Some(message) = self.messages.get_message(item.message_id).await? {
                message_cache.insert(item.message_id, message);
            }
        }

        let (decisions, deferred) = self
            .inbox_router
            .process_entity_inbox(entity, session_active, director_idle, |id| message_cache.get(&id).cloned())
            .await?;

        if let Some(session) = &active_session {
            for (item, disposition) in &decisions {
                if *disposition != Disposition::ForwardAsInput {
                    continue;
                }
                let Some(message) = message_cache.get(&item.message_id) else {
                    continue;
                };
                self.sessions.message_session(session.id, message.content.clone()).await?;
                let _ = tx
                    .send(DaemonEvent::MessageForwarded { message_id: message.id, agent_id: entity.id })
                    .await;
                if entity.role() == EntityRole::Director {
                    self.mark_director_input(entity.id).await;
                }
            }
        }
        let mut processed = decisions.len() as u64;

        if !deferred.is_empty() && !session_active {
            if let Some(batch) = InboxRouter::group_for_triage(entity.id, deferred).into_iter().next() {
                self.spawn_triage_session(entity, batch, tx).await?;
                processed += 1;
            }
        }

        Ok(processed)
    }

    async fn is_director_idle(&self, entity_id: Uuid) -> bool {
        let map = self.director_last_input.lock().await;
        match map.get(&entity_id) {
            Some(last) => last.elapsed() >= self.config.director_inbox_idle_threshold,
            None => true,
        }
    }

    async fn mark_director_input(&self, entity_id: Uuid) {
        self.director_last_input.lock().await.insert(entity_id, Instant::now());
    }

    async fn spawn_triage_session(&self, entity: &Entity, batch: TriageBatch, tx: &mpsc::Sender<DaemonEvent>) -> DispatchResult<()> {
        let root = self.worktree_coordinator.get_workspace_root();
        let base = self.worktree_coordinator.get_default_branch().await?;
        let path = crate::services::worktree_coordinator::read_only_worktree_path(&root, &entity.name, "triage");
        self.inbox_router.ensure_triage_worktree(&entity.name, &path, &base).await?;

        let prompt = batch.build_prompt();
        let channel_id = batch.channel_id;
        let (session, events) = self
            .sessions
            .start_session(
                entity.id,
                "triage",
                StartOpts {
                    working_directory: path.clone(),
                    worktree: Some(path.clone()),
                    initial_prompt: prompt.clone(),
                    interactive: false,
                },
            )
            .await?;

        (self.on_session_started)(&session, entity.id, &prompt);
        let _ = tx
            .send(DaemonEvent::AgentTriageSpawned { agent_id: entity.id, channel_id, worktree: path })
            .await;
        self.watch_session_exit(events, None, None, Some(batch));
        Ok(())
    }

    // ---- 3. Worker availability poll ------------------------------------

    pub async fn poll_worker_availability(&self, tx: &mpsc::Sender<DaemonEvent>) -> DispatchResult<PollResult> {
        let kind = PollKind::WorkerAvailability;
        let _ = tx.send(DaemonEvent::PollStart { kind }).await;
        let started_at = Utc::now();
        let t0 = Instant::now();

        let ready_tasks = match self.task_assignment.ready().await {
            Ok(t) => t,
            Err(e) => {
                let _ = tx.send(DaemonEvent::PollError { kind, error: e.to_string() }).await;
                return Err(e);
            }
        };
        let workers = match self
            .entities
            .list(EntityFilter { role: Some(EntityRole::Worker), active_only: true })
            .await
        {
            Ok(w) => w,
            Err(e) => {
                let _ = tx.send(DaemonEvent::PollError { kind, error: e.to_string() }).await;
                return Err(e);
            }
        };

        let mut idle_workers = Vec::new();
        for worker in workers {
            match self.sessions.get_active_session(worker.id).await {
                Ok(None) => idle_workers.push(worker),
                Ok(Some(_)) => {}
                Err(e) => {
                    let _ = tx.send(DaemonEvent::PollError { kind, error: e.to_string() }).await;
                    return Err(e);
                }
            }
        }

        let mut processed = 0u64;
        let mut errors = 0u64;
        let mut error_messages = Vec::new();

        for task in ready_tasks {
            if idle_workers.is_empty() {
                break;
            }
            let mut dispatched = false;
            for pos in 0..idle_workers.len() {
                let req = SpawnRequest { subkind: idle_workers[pos].subkind, agent_id: idle_workers[pos].id };
                if !self.agent_pool.can_spawn(&req).await {
                    continue;
                }
                let worker = idle_workers.remove(pos);
                match self.dispatch_to_worker(&task, &worker, tx).await {
                    Ok(()) => processed += 1,
                    Err(e) => {
                        errors += 1;
                        error_messages.push(format!("task {}: {e}", task.id));
                    }
                }
                dispatched = true;
                break;
            }
            if !dispatched {
                break;
            }
        }

        let result = self.finish(kind, started_at, t0, processed, errors, error_messages);
        let _ = tx.send(DaemonEvent::PollComplete { result: result.clone() }).await;
        Ok(result)
    }

    async fn dispatch_to_worker(&self, task: &crate::domain::models::Task, worker: &Entity, tx: &mpsc::Sender<DaemonEvent>) -> DispatchResult<()> {
        let worktree = self.worktree_coordinator.create_worktree(&worker.name, task.id).await?;
        let key = WorktreeKey::Task { agent_name: worker.name.clone(), task_id: task.id };

        self.task_assignment
            .dispatch(
                task.id,
                worker.id,
                DispatchOpts {
                    worktree: Some(worktree.path.clone()),
                    branch: worktree.branch.clone(),
                    session_id: None,
                    mark_as_started: true,
                },
            )
            .await?;

        let initial_prompt = format!("Task {}: {}", task.id, task.description_ref);
        let (session, events) = self
            .sessions
            .start_session(
                worker.id,
                "worker",
                StartOpts {
                    working_directory: worktree.path.clone(),
                    worktree: Some(worktree.path.clone()),
                    initial_prompt: initial_prompt.clone(),
                    interactive: false,
                },
            )
            .await?;

        if let Some(Err(holder)) = self.worktree_coordinator.lease(&key, session.id).await? {
            warn!(task_id = %task.id, held_by = %holder, "worktree already leased to another session");
        }
        self.agent_pool.on_agent_spawned(worker.subkind).await;
        self.sessions
            .append_task_session_history(
                self.tasks.as_ref(),
                task.id,
                SessionHistoryEntry {
                    session_id: session.id,
                    provider_session_id: session.provider_session_id.clone(),
                    agent_id: worker.id,
                    agent_name: worker.name.clone(),
                    agent_role: "worker".into(),
                    started_at: session.created_at,
                },
            )
            .await?;
        self.log_event(task.id, "task:dispatched", json!({ "agentId": worker.id })).await;

        let _ = tx.send(DaemonEvent::TaskDispatched { task_id: task.id, agent_id: worker.id }).await;
        let _ = tx
            .send(DaemonEvent::AgentSpawned { agent_id: worker.id, worktree: Some(worktree.path.clone()) })
            .await;
        (self.on_session_started)(&session, worker.id, &initial_prompt);
        self.watch_session_exit(events, Some(worker.subkind), Some(key), None);
        Ok(())
    }

    // ---- 4. Steward trigger poll -----------------------------------------

    pub async fn poll_steward_trigger(&self, tx: &mpsc::Sender<DaemonEvent>) -> DispatchResult<PollResult> {
        let kind = PollKind::StewardTrigger;
        let _ = tx.send(DaemonEvent::PollStart { kind }).await;
        let started_at = Utc::now();
        let t0 = Instant::now();

        let eligible = match self.merge_pipeline.eligible_tasks().await {
            Ok(t) => t,
            Err(e) => {
                let _ = tx.send(DaemonEvent::PollError { kind, error: e.to_string() }).await;
                return Err(e);
            }
        };

        let all_stewards = match self
            .entities
            .list(EntityFilter { role: Some(EntityRole::Steward), active_only: true })
            .await
        {
            Ok(s) => s,
            Err(e) => {
                let _ = tx.send(DaemonEvent::PollError { kind, error: e.to_string() }).await;
                return Err(e);
            }
        };
        let mut active = std::collections::HashSet::new();
        for steward in &all_stewards {
            match self.sessions.get_active_session(steward.id).await {
                Ok(Some(_)) => {
                    active.insert(steward.id);
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = tx.send(DaemonEvent::PollError { kind, error: e.to_string() }).await;
                    return Err(e);
                }
            }
        }

        let mut available = match self.merge_pipeline.available_stewards(|id| active.contains(&id)).await {
            Ok(s) => s,
            Err(e) => {
                let _ = tx.send(DaemonEvent::PollError { kind, error: e.to_string() }).await;
                return Err(e);
            }
        };

        let mut processed = 0u64;
        let mut errors = 0u64;
        let mut error_messages = Vec::new();

        for task in eligible {
            if available.is_empty() {
                break;
            }
            let steward = available.remove(0);
            match self.assign_steward(&task, &steward, tx).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    errors += 1;
                    error_messages.push(format!("task {}: {e}", task.id));
                }
            }
        }

        let result = self.finish(kind, started_at, t0, processed, errors, error_messages);
        let _ = tx.send(DaemonEvent::PollComplete { result: result.clone() }).await;
        Ok(result)
    }

    async fn assign_steward(&self, task: &crate::domain::models::Task, steward: &Entity, tx: &mpsc::Sender<DaemonEvent>) -> DispatchResult<()> {
        let sync_result = self.merge_pipeline.run_sync_step(task).await?;
        let prompt = MergePipeline::build_steward_prompt(task, &sync_result, &task.description_ref, "");

        let worktree = task.orchestrator.worktree.clone().unwrap_or_default();
        let (session, events) = self
            .sessions
            .start_session(
                steward.id,
                "steward",
                StartOpts {
                    working_directory: worktree.clone(),
                    worktree: Some(worktree.clone()),
                    initial_prompt: prompt.clone(),
                    interactive: false,
                },
            )
            .await?;

        self.merge_pipeline
            .begin_steward_assignment(task.id, steward.id, session.provider_session_id.clone().unwrap_or_default())
            .await?;
        self.agent_pool.on_agent_spawned(steward.subkind).await;
        self.sessions
            .append_task_session_history(
                self.tasks.as_ref(),
                task.id,
                SessionHistoryEntry {
                    session_id: session.id,
                    provider_session_id: session.provider_session_id.clone(),
                    agent_id: steward.id,
                    agent_name: steward.name.clone(),
                    agent_role: "steward".into(),
                    started_at: session.created_at,
                },
            )
            .await?;
        self.log_event(task.id, "task:steward-assigned", json!({ "stewardId": steward.id })).await;

        let _ = tx
            .send(DaemonEvent::AgentSpawned { agent_id: steward.id, worktree: Some(worktree) })
            .await;
        (self.on_session_started)(&session, steward.id, &prompt);
        self.watch_session_exit(events, Some(steward.subkind), None, None);
        Ok(())
    }

    // ---- 5. Workflow task poll --------------------------------------------

    pub async fn poll_workflow_task(&self, tx: &mpsc::Sender<DaemonEvent>) -> DispatchResult<PollResult> {
        let kind = PollKind::WorkflowTask;
        let _ = tx.send(DaemonEvent::PollStart { kind }).await;
        let started_at = Utc::now();
        let t0 = Instant::now();

        let workers = match self
            .entities
            .list(EntityFilter { role: Some(EntityRole::Worker), active_only: true })
            .await
        {
            Ok(w) => w,
            Err(e) => {
                let _ = tx.send(DaemonEvent::PollError { kind, error: e.to_string() }).await;
                return Err(e);
            }
        };

        let mut processed = 0u64;
        let mut errors = 0u64;
        let mut error_messages = Vec::new();

        for worker in workers {
            match self.sessions.get_active_session(worker.id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    errors += 1;
                    error_messages.push(format!("worker {}: {e}", worker.id));
                    continue;
                }
            }
            let pending = match self.task_assignment.get_agent_tasks(worker.id, &[TaskStatus::Open]).await {
                Ok(t) => t,
                Err(e) => {
                    errors += 1;
                    error_messages.push(format!("worker {}: {e}", worker.id));
                    continue;
                }
            };
            let Some(task) = pending.into_iter().next() else { continue };
            match self.resume_workflow_task(&task, &worker, tx).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    errors += 1;
                    error_messages.push(format!("task {}: {e}", task.id));
                }
            }
        }

        let result = self.finish(kind, started_at, t0, processed, errors, error_messages);
        let _ = tx.send(DaemonEvent::PollComplete { result: result.clone() }).await;
        Ok(result)
    }

    async fn resume_workflow_task(&self, task: &crate::domain::models::Task, worker: &Entity, tx: &mpsc::Sender<DaemonEvent>) -> DispatchResult<()> {
        let key = WorktreeKey::Task { agent_name: worker.name.clone(), task_id: task.id };
        let path = match &task.orchestrator.worktree {
            Some(existing) if self.worktree_coordinator.worktree_exists(existing).await? => existing.clone(),
            _ => self.worktree_coordinator.create_worktree(&worker.name, task.id).await?.path,
        };

        self.task_assignment
            .dispatch(
                task.id,
                worker.id,
                DispatchOpts {
                    worktree: Some(path.clone()),
                    branch: task.orchestrator.branch.clone(),
                    session_id: None,
                    mark_as_started: true,
                },
            )
            .await?;

        let initial_prompt = format!("Task {}: {}", task.id, task.description_ref);
        let (session, events) = self
            .sessions
            .start_session(
                worker.id,
                "worker",
                StartOpts {
                    working_directory: path.clone(),
                    worktree: Some(path.clone()),
                    initial_prompt: initial_prompt.clone(),
                    interactive: false,
                },
            )
            .await?;

        if let Some(Err(holder)) = self.worktree_coordinator.lease(&key, session.id).await? {
            warn!(task_id = %task.id, held_by = %holder, "worktree already leased to another session");
        }
        self.agent_pool.on_agent_spawned(worker.subkind).await;
        self.sessions
            .append_task_session_history(
                self.tasks.as_ref(),
                task.id,
                SessionHistoryEntry {
                    session_id: session.id,
                    provider_session_id: session.provider_session_id.clone(),
                    agent_id: worker.id,
                    agent_name: worker.name.clone(),
                    agent_role: "worker".into(),
                    started_at: session.created_at,
                },
            )
            .await?;
        self.log_event(task.id, "task:dispatched", json!({ "agentId": worker.id })).await;

        let _ = tx.send(DaemonEvent::AgentSpawned { agent_id: worker.id, worktree: Some(path) }).await;
        (self.on_session_started)(&session, worker.id, &initial_prompt);
        self.watch_session_exit(events, Some(worker.subkind), Some(key), None);
        Ok(())
    }

    // ---- 6. Closed-but-unmerged reconciliation ---------------------------

    pub async fn poll_closed_unmerged_reconciliation(&self, tx: &mpsc::Sender<DaemonEvent>) -> DispatchResult<PollResult> {
        let kind = PollKind::ClosedUnmergedReconciliation;
        let _ = tx.send(DaemonEvent::PollStart { kind }).await;
        let started_at = Utc::now();
        let t0 = Instant::now();

        let closed = match self
            .tasks
            .list(TaskFilter { assignee: None, status: Some(TaskStatus::Closed) })
            .await
        {
            Ok(t) => t,
            Err(e) => {
                let _ = tx.send(DaemonEvent::PollError { kind, error: e.to_string() }).await;
                return Err(e);
            }
        };

        let mut processed = 0u64;
        let mut errors = 0u64;
        let mut error_messages = Vec::new();
        let now = Utc::now();

        for task in closed {
            match self.merge_pipeline.reconcile_if_closed_unmerged(&task, now).await {
                Ok(true) => {
                    processed += 1;
                    self.log_event(task.id, "task:reconciled", json!({})).await;
                    let _ = tx
                        .send(DaemonEvent::DaemonNotification {
                            level: NotificationLevel::Warning,
                            title: "task reconciled to review".into(),
                            message: Some(format!("task {} was closed unmerged and pushed back to review", task.id)),
                        })
                        .await;
                }
                Ok(false) => {}
                Err(e) => {
                    errors += 1;
                    error_messages.push(format!("task {}: {e}", task.id));
                }
            }
        }

        let result = self.finish(kind, started_at, t0, processed, errors, error_messages);
        let _ = tx.send(DaemonEvent::PollComplete { result: result.clone() }).await;
        Ok(result)
    }

    // ---- 7. Stuck-merge recovery ------------------------------------------

    pub async fn poll_stuck_merge_recovery(&self, tx: &mpsc::Sender<DaemonEvent>) -> DispatchResult<PollResult> {
        let kind = PollKind::StuckMergeRecovery;
        let _ = tx.send(DaemonEvent::PollStart { kind }).await;
        let started_at = Utc::now();
        let t0 = Instant::now();

        let review_tasks = match self
            .tasks
            .list(TaskFilter { assignee: None, status: Some(TaskStatus::Review) })
            .await
        {
            Ok(t) => t,
            Err(e) => {
                let _ = tx.send(DaemonEvent::PollError { kind, error: e.to_string() }).await;
                return Err(e);
            }
        };

        let mut processed = 0u64;
        let mut errors = 0u64;
        let mut error_messages = Vec::new();
        let now = Utc::now();

        for task in review_tasks {
            let worktrees = Arc::clone(&self.worktrees);
            let force_remove = move |path: &str| {
                let worktrees = Arc::clone(&worktrees);
                let path = path.to_string();
                tokio::spawn(async move {
                    if let Err(e) = worktrees.remove_worktree(&path, true).await {
                        warn!(error = %e, path = %path, "failed to force-remove stuck-merge worktree");
                    }
                });
            };
            match self.merge_pipeline.recover_if_stuck(&task, now, force_remove).await {
                Ok(true) => {
                    processed += 1;
                    self.log_event(task.id, "task:stuck-merge-recovered", json!({})).await;
                }
                Ok(false) => {}
                Err(e) => {
                    errors += 1;
                    error_messages.push(format!("task {}: {e}", task.id));
                }
            }
        }

        let result = self.finish(kind, started_at, t0, processed, errors, error_messages);
        let _ = tx.send(DaemonEvent::PollComplete { result: result.clone() }).await;
        Ok(result)
    }

    // ---- Startup-only orphan recovery -------------------------------------

    /// Tasks `IN_PROGRESS` with an assignee but no live session for that
    /// entity are orphans from a prior process's death. Each is resumed from
    /// its last provider session id when one was recorded, falling back to a
    /// fresh session with an interruption notice otherwise (Decision D3).
    async fn recover_orphaned_assignments(&self, tx: &mpsc::Sender<DaemonEvent>) -> DispatchResult<()> {
        let in_progress = self
            .tasks
            .list(TaskFilter { assignee: None, status: Some(TaskStatus::InProgress) })
            .await?;
        for task in in_progress {
            let Some(agent_id) = task.assignee else { continue };
            if self.sessions.get_active_session(agent_id).await?.is_some() {
                continue;
            }
            let Some(agent) = self.entities.get(agent_id).await? else { continue };
            if let Err(e) = self.recover_one_orphan(&task, &agent, tx).await {
                warn!(task_id = %task.id, agent_id = %agent_id, error = %e, "orphan recovery failed for task");
                let _ = tx
                    .send(DaemonEvent::DaemonNotification {
                        level: NotificationLevel::Error,
                        title: "orphan recovery failed".into(),
                        message: Some(format!("task {}: {e}", task.id)),
                    })
                    .await;
            }
        }
        Ok(())
    }

    async fn recover_one_orphan(&self, task: &crate::domain::models::Task, agent: &Entity, tx: &mpsc::Sender<DaemonEvent>) -> DispatchResult<()> {
        let worktree = task.orchestrator.worktree.clone().unwrap_or_else(|| self.worktree_coordinator.get_workspace_root());
        let role = role_label(agent.role());

        let resumed = if let Some(provider_session_id) = task.orchestrator.session_id.clone() {
            self.sessions
                .resume_session(
                    agent.id,
                    role,
                    ResumeOpts {
                        provider_session_id,
                        working_directory: worktree.clone(),
                        worktree: Some(worktree.clone()),
                        initial_prompt: String::new(),
                        interactive: false,
                    },
                    None::<fn(Uuid, usize) -> Vec<Uuid>>,
                )
                .await
                .ok()
        } else {
            None
        };

        let (session, events, prompt) = if let Some((session, events, _uwp)) = resumed {
            (session, events, String::new())
        } else {
            let prompt = "Your previous session was interrupted. Resume work on your assigned task.".to_string();
            let (session, events) = self
                .sessions
                .start_session(
                    agent.id,
                    role,
                    StartOpts {
                        working_directory: worktree.clone(),
                        worktree: Some(worktree.clone()),
                        initial_prompt: prompt.clone(),
                        interactive: false,
                    },
                )
                .await?;
            (session, events, prompt)
        };

        self.sessions
            .append_task_session_history(
                self.tasks.as_ref(),
                task.id,
                SessionHistoryEntry {
                    session_id: session.id,
                    provider_session_id: session.provider_session_id.clone(),
                    agent_id: agent.id,
                    agent_name: agent.name.clone(),
                    agent_role: role.to_string(),
                    started_at: session.created_at,
                },
            )
            .await?;
        self.log_event(task.id, "task:orphan-recovered", json!({ "agentId": agent.id })).await;

        let _ = tx.send(DaemonEvent::AgentSpawned { agent_id: agent.id, worktree: Some(worktree) }).await;
        (self.on_session_started)(&session, agent.id, &prompt);
        self.watch_session_exit(events, Some(agent.subkind), None, None);
        Ok(())
    }

    /// Drains a just-started session's event stream in the background so the
    /// daemon can release its worktree lease and agent-pool slot, and — for a
    /// triage session — mark its batch read, the moment the process exits
    /// cleanly (§4.5, Law 7). A crash or non-zero exit leaves the triage
    /// batch untouched for the next cycle to retry.
    fn watch_session_exit(
        &self,
        mut events: mpsc::Receiver<SpawnerEvent>,
        pool_subkind: Option<crate::domain::models::EntitySubkind>,
        worktree_key: Option<WorktreeKey>,
        triage: Option<TriageBatch>,
    ) {
        let agent_pool = Arc::clone(&self.agent_pool);
        let worktree_coordinator = Arc::clone(&self.worktree_coordinator);
        let inbox_router = Arc::clone(&self.inbox_router);
        tokio::spawn(async move {
            let mut clean_exit = false;
            while let Some(event) = events.recv().await {
                if let SpawnerEvent::Exit { code, .. } = event {
                    clean_exit = code == Some(0);
                    break;
                }
            }
            if let Some(subkind) = pool_subkind {
                agent_pool.on_agent_ended(subkind).await;
            }
            if let Some(key) = &worktree_key {
                worktree_coordinator.release(key).await;
            }
            if clean_exit {
                if let Some(batch) = &triage {
                    if let Err(e) = inbox_router.complete_triage(batch).await {
                        warn!(error = %e, "failed to mark triage batch read after clean exit");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fakes::{FakeProcessLauncher, FakeWorktreeManager};
    use crate::adapters::memory_storage::MemoryStorage;
    use crate::domain::models::{Entity, EntitySubkind, MessageKind, Task, WorkerKind};
    use crate::domain::ports::NewMessage;
    use crate::services::merge_pipeline::MergePipelineConfig;
    use crate::services::process_spawner::{ProcessSpawner, SpawnerConfig};

    fn daemon(storage: Arc<MemoryStorage>) -> Arc<DispatchDaemon<FakeProcessLauncher>> {
        let worktrees: Arc<dyn WorktreeManager> = Arc::new(FakeWorktreeManager::new());
        let spawner = Arc::new(ProcessSpawner::new(SpawnerConfig::default(), Arc::new(FakeProcessLauncher::new())));
        let sessions = Arc::new(SessionManager::new(spawner, storage.clone()));
        let agent_pool = Arc::new(AgentPool::new(HashMap::new()));
        let merge_pipeline = MergePipeline::new(
            storage.clone(),
            storage.clone(),
            MergePipelineConfig::default(),
            Arc::new(|_path: &str| Ok(crate::domain::models::SyncResult::Success)),
        );
        let ports = DispatchDaemonPorts {
            tasks: storage.clone(),
            entities: storage.clone(),
            messages: storage.clone(),
            inbox: storage.clone(),
            events: storage.clone(),
            worktrees,
        };
        Arc::new(DispatchDaemon::new(
            ports,
            sessions,
            agent_pool,
            merge_pipeline,
            DispatchDaemonConfig::default(),
            Arc::new(|_session, _entity_id, _prompt| {}),
        ))
    }

    fn worker() -> Entity {
        Entity::new("w1", EntitySubkind::Worker(WorkerKind::Ephemeral))
    }

    // S1: an unassigned OPEN task and an idle worker are dispatched within
    // one poll cycle, producing exactly one session and one dispatch event.
    #[tokio::test]
    async fn s1_worker_availability_dispatches_one_ready_task() {
        let storage = MemoryStorage::shared();
        let d = daemon(storage.clone());
        let w = worker();
        EntityStore::create(storage.as_ref(), w.clone()).await.unwrap();
        let task = Task::new(Uuid::new_v4(), "doc://1", 1);
        let task_id = task.id;
        TaskStore::create(storage.as_ref(), task).await.unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        d.poll_worker_availability(&tx).await.unwrap();
        drop(tx);

        let updated = storage.get(task_id).await.unwrap().unwrap();
        assert_eq!(updated.status, TaskStatus::InProgress);
        assert_eq!(updated.assignee, Some(w.id));

        let session = d.sessions.get_active_session(w.id).await.unwrap();
        assert!(session.is_some());

        let mut dispatched_count = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event, DaemonEvent::TaskDispatched { .. }) {
                dispatched_count += 1;
            }
        }
        assert_eq!(dispatched_count, 1);
    }

    // S3: an IN_PROGRESS task with an assignee but no live session is
    // recovered at startup with the interruption-notice prompt.
    #[tokio::test]
    async fn s3_orphan_recovery_starts_a_fresh_session_with_interruption_notice() {
        let storage = MemoryStorage::shared();
        let d = daemon(storage.clone());
        let w = worker();
        EntityStore::create(storage.as_ref(), w.clone()).await.unwrap();

        let mut task = Task::new(Uuid::new_v4(), "doc://1", 1);
        task.assignee = Some(w.id);
        task.transition_to(TaskStatus::InProgress).unwrap();
        task.orchestrator.worktree = Some("/ws/w1/task".into());
        TaskStore::create(storage.as_ref(), task.clone()).await.unwrap();

        let seen_prompt = Arc::new(Mutex::new(String::new()));
        let captured = seen_prompt.clone();
        let d = {
            let worktrees: Arc<dyn WorktreeManager> = Arc::new(FakeWorktreeManager::new());
            let spawner = Arc::new(ProcessSpawner::new(SpawnerConfig::default(), Arc::new(FakeProcessLauncher::new())));
            let sessions = Arc::new(SessionManager::new(spawner, storage.clone()));
            let agent_pool = Arc::new(AgentPool::new(HashMap::new()));
            let merge_pipeline = MergePipeline::new(
                storage.clone(),
                storage.clone(),
                MergePipelineConfig::default(),
                Arc::new(|_path: &str| Ok(crate::domain::models::SyncResult::Success)),
            );
            let ports = DispatchDaemonPorts {
                tasks: storage.clone(),
                entities: storage.clone(),
                messages: storage.clone(),
                inbox: storage.clone(),
                events: storage.clone(),
                worktrees,
            };
            Arc::new(DispatchDaemon::new(
                ports,
                sessions,
                agent_pool,
                merge_pipeline,
                DispatchDaemonConfig::default(),
                Arc::new(move |_session, _entity_id, prompt: &str| {
                    let captured = captured.clone();
                    let prompt = prompt.to_string();
                    tokio::spawn(async move {
                        *captured.lock().await = prompt;
                    });
                }),
            ))
        };
        let _ = d;

        let (tx, mut rx) = mpsc::channel(64);
        d.recover_orphaned_assignments(&tx).await.unwrap();
        drop(tx);

        let session = d.sessions.get_active_session(w.id).await.unwrap();
        assert!(session.is_some());

        let mut saw_spawn = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, DaemonEvent::AgentSpawned { .. }) {
                saw_spawn = true;
            }
        }
        assert!(saw_spawn);
    }

    // S5: a CLOSED-but-unmerged task past its grace period is pushed back to
    // REVIEW by the reconciliation poll.
    #[tokio::test]
    async fn s5_closed_unmerged_reconciliation_pushes_back_to_review() {
        let storage = MemoryStorage::shared();
        let d = daemon(storage.clone());

        let mut task = Task::new(Uuid::new_v4(), "doc://1", 1);
        task.transition_to(TaskStatus::InProgress).unwrap();
        task.transition_to(TaskStatus::Review).unwrap();
        task.transition_to(TaskStatus::Closed).unwrap();
        task.closed_at = Some(Utc::now() - ChronoDuration::minutes(5));
        task.orchestrator.merge_status = crate::domain::models::MergeStatus::Conflict;
        TaskStore::create(storage.as_ref(), task).await.unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let result = d.poll_closed_unmerged_reconciliation(&tx).await.unwrap();
        drop(tx);
        assert_eq!(result.processed, 1);
        assert_eq!(result.items_considered(), result.processed + result.errors);

        let mut saw_notification = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, DaemonEvent::DaemonNotification { .. }) {
                saw_notification = true;
            }
        }
        assert!(saw_notification);
    }

    // S6: a stuck merge past its grace period is reset to pending with the
    // retry count bumped.
    #[tokio::test]
    async fn s6_stuck_merge_recovery_resets_pending() {
        let storage = MemoryStorage::shared();
        let d = daemon(storage.clone());

        let mut task = Task::new(Uuid::new_v4(), "doc://1", 1);
        task.transition_to(TaskStatus::InProgress).unwrap();
        task.transition_to(TaskStatus::Review).unwrap();
        task.orchestrator.merge_status = crate::domain::models::MergeStatus::Testing;
        task.updated_at = Utc::now() - ChronoDuration::minutes(15);
        TaskStore::create(storage.as_ref(), task.clone()).await.unwrap();

        let (tx, _rx) = mpsc::channel(64);
        let result = d.poll_stuck_merge_recovery(&tx).await.unwrap();
        assert_eq!(result.processed, 1);

        let updated = storage.get(task.id).await.unwrap().unwrap();
        assert_eq!(updated.orchestrator.merge_status, crate::domain::models::MergeStatus::Pending);
    }

    // S5 safety valve: a task that already hit the retry cap is left alone
    // by the poll rather than retried a fourth time.
    #[tokio::test]
    async fn stuck_merge_recovery_leaves_a_task_at_the_retry_cap_untouched() {
        let storage = MemoryStorage::shared();
        let d = daemon(storage.clone());

        let mut task = Task::new(Uuid::new_v4(), "doc://1", 1);
        task.transition_to(TaskStatus::InProgress).unwrap();
        task.transition_to(TaskStatus::Review).unwrap();
        task.orchestrator.merge_status = crate::domain::models::MergeStatus::Merging;
        task.orchestrator.stuck_merge_recovery_count = 3;
        task.updated_at = Utc::now() - ChronoDuration::minutes(15);
        TaskStore::create(storage.as_ref(), task.clone()).await.unwrap();

        let (tx, _rx) = mpsc::channel(64);
        let result = d.poll_stuck_merge_recovery(&tx).await.unwrap();
        assert_eq!(result.processed, 0);

        let updated = storage.get(task.id).await.unwrap().unwrap();
        assert_eq!(updated.orchestrator.merge_status, crate::domain::models::MergeStatus::Merging);
        assert_eq!(updated.orchestrator.stuck_merge_recovery_count, 3);
    }

    // Testable Property 3: items_considered always equals processed+errors.
    #[tokio::test]
    async fn poll_result_items_considered_matches_processed_plus_errors() {
        let storage = MemoryStorage::shared();
        let d = daemon(storage);
        let (tx, _rx) = mpsc::channel(64);
        let result = d.poll_inbox(&tx).await.unwrap();
        assert_eq!(result.items_considered(), result.processed + result.errors);
    }

    // S2: an unread non-dispatch message with no active session defers the
    // worker to a triage session against a read-only worktree, rather than
    // being forwarded, and stays unread until that session exits.
    #[tokio::test]
    async fn s2_idle_message_defers_to_a_triage_session() {
        let storage = MemoryStorage::shared();
        let d = daemon(storage.clone());
        let w = worker();
        EntityStore::create(storage.as_ref(), w.clone()).await.unwrap();
        let sender = Uuid::new_v4();

        let channel = storage.create_direct_channel(sender, w.id).await.unwrap();
        let message = storage
            .post_message(channel, NewMessage { sender_id: sender, content: "what's the status?".into(), kind: MessageKind::Other })
            .await
            .unwrap();
        storage.seed_inbox_item(w.id, channel, message.id).await;

        let (tx, mut rx) = mpsc::channel(64);
        let result = d.poll_inbox(&tx).await.unwrap();
        drop(tx);
        assert_eq!(result.processed, 1);

        let mut saw_triage = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, DaemonEvent::AgentTriageSpawned { .. }) {
                saw_triage = true;
            }
        }
        assert!(saw_triage, "a deferred message with no active session should spawn a triage session");

        let unread = storage
            .get_inbox(w.id, InboxFilter { status: Some(InboxStatus::Unread) })
            .await
            .unwrap();
        assert!(
            unread.iter().any(|item| item.message_id == message.id),
            "deferred message stays unread until the triage session exits"
        );

        let session = d.sessions.get_active_session(w.id).await.unwrap();
        assert!(session.is_some(), "triage runs as a real session on the worker entity");
    }

    // Director messages only forward while idle past the configured
    // threshold, even when a session is active.
    #[tokio::test]
    async fn director_message_is_not_forwarded_while_not_idle() {
        let storage = MemoryStorage::shared();
        let d = daemon(storage.clone());
        let director = Entity::new("director", EntitySubkind::Director);
        EntityStore::create(storage.as_ref(), director.clone()).await.unwrap();
        d.mark_director_input(director.id).await;

        let w = worker();
        EntityStore::create(storage.as_ref(), w.clone()).await.unwrap();
        let channel = storage.create_direct_channel(director.id, w.id).await.unwrap();
        let message = storage
            .post_message(
                channel,
                NewMessage { sender_id: w.id, content: "status update".into(), kind: MessageKind::Other },
            )
            .await
            .unwrap();
        storage.seed_inbox_item(director.id, channel, message.id).await;

        assert!(!d.is_director_idle(director.id).await);
    }
}
