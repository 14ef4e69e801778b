//! `stoneforged` — the Dispatch Orchestrator entry point.
//!
//! Loads configuration, wires the reference in-memory storage adapter to
//! the real `git`/process-launching adapters, starts the daemon, and logs
//! its event stream to completion (Ctrl-C or a fatal startup error).
//!
//! The storage and process-provider contracts are opaque per §1 of the
//! spec; this binary uses the in-memory reference adapter
//! (`adapters::MemoryStorage`) rather than a real database, since no
//! concrete storage backend is in scope here. A production deployment
//! would swap it for a real implementation of the five storage ports
//! without touching anything under `services::`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use tracing::{error, info, warn};

use stoneforge::adapters::{GitWorktreeManager, MemoryStorage, TokioProcessLauncher};
use stoneforge::domain::models::DaemonEvent;
use stoneforge::infrastructure::config::ConfigLoader;
use stoneforge::infrastructure::logging::LoggerImpl;
use stoneforge::services::{
    AgentPool, DispatchDaemon, DispatchDaemonConfig, DispatchDaemonPorts, MergePipeline,
    MergePipelineConfig, ProcessSpawner, SessionManager, SpawnerConfig,
};

fn git_sync_runner(
    worktree: &str,
) -> stoneforge::domain::errors::DispatchResult<stoneforge::domain::models::SyncResult> {
    use std::process::Command;
    use stoneforge::domain::errors::DispatchError;
    use stoneforge::domain::models::SyncResult;

    let fetch = Command::new("git")
        .current_dir(worktree)
        .args(["fetch", "origin"])
        .output()
        .map_err(|e| DispatchError::Spawn(e.to_string()))?;
    if !fetch.status.success() {
        return Ok(SyncResult::Error {
            message: String::from_utf8_lossy(&fetch.stderr).into_owned(),
        });
    }

    let merge = Command::new("git")
        .current_dir(worktree)
        .args(["merge", "origin/HEAD", "--no-edit"])
        .output()
        .map_err(|e| DispatchError::Spawn(e.to_string()))?;

    if merge.status.success() {
        return Ok(SyncResult::Success);
    }

    let status_out = Command::new("git")
        .current_dir(worktree)
        .args(["diff", "--name-only", "--diff-filter=U"])
        .output()
        .map_err(|e| DispatchError::Spawn(e.to_string()))?;
    let files: Vec<String> = String::from_utf8_lossy(&status_out.stdout)
        .lines()
        .map(str::to_string)
        .collect();

    if files.is_empty() {
        Ok(SyncResult::Error {
            message: String::from_utf8_lossy(&merge.stderr).into_owned(),
        })
    } else {
        Ok(SyncResult::Conflicts { files })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigLoader::load().unwrap_or_else(|e| {
        eprintln!("using default configuration ({e:#}), no .stoneforge/config.yaml found");
        stoneforge::infrastructure::config::StoneforgeConfig::default()
    });

    let _logger_guard = LoggerImpl::init(&config.logging).context("failed to initialize logging")?;

    info!("stoneforged starting up");

    let storage = MemoryStorage::shared();
    let worktrees: Arc<dyn stoneforge::domain::ports::WorktreeManager> = Arc::new(
        GitWorktreeManager::new(config.worktree.repo_root.clone(), config.worktree.workspace_root.clone()),
    );
    let launcher = Arc::new(TokioProcessLauncher::new());

    let spawner = Arc::new(ProcessSpawner::new(
        SpawnerConfig {
            binary_path: config.spawner.binary_path.clone(),
        },
        launcher,
    ));
    let sessions = Arc::new(SessionManager::new(spawner, storage.clone()));

    let agent_pool = Arc::new(AgentPool::new(config.agent_pool.resolve()));

    let merge_pipeline = MergePipeline::new(
        storage.clone(),
        storage.clone(),
        MergePipelineConfig {
            closed_unmerged_grace_period: ChronoDuration::seconds(
                config.merge.closed_unmerged_grace_period_secs,
            ),
            stuck_merge_recovery_grace_period: ChronoDuration::seconds(
                config.merge.stuck_merge_recovery_grace_period_secs,
            ),
        },
        Arc::new(git_sync_runner),
    );

    let daemon_config = DispatchDaemonConfig {
        poll_interval: Duration::from_secs(config.daemon.poll_interval_secs),
        worker_availability_poll_enabled: config.daemon.worker_availability_poll_enabled,
        inbox_poll_enabled: config.daemon.inbox_poll_enabled,
        steward_trigger_poll_enabled: config.daemon.steward_trigger_poll_enabled,
        workflow_task_poll_enabled: config.daemon.workflow_task_poll_enabled,
        orphan_recovery_enabled: config.daemon.orphan_recovery_enabled,
        closed_unmerged_reconciliation_enabled: config.daemon.closed_unmerged_reconciliation_enabled,
        stuck_merge_recovery_enabled: config.daemon.stuck_merge_recovery_enabled,
        max_session_duration: config
            .daemon
            .max_session_duration_secs
            .map(ChronoDuration::seconds),
        director_inbox_forwarding_enabled: config.daemon.director_inbox_forwarding_enabled,
        director_inbox_idle_threshold: Duration::from_secs(
            config.daemon.director_inbox_idle_threshold_secs,
        ),
    };

    let ports = DispatchDaemonPorts {
        tasks: storage.clone(),
        entities: storage.clone(),
        messages: storage.clone(),
        inbox: storage.clone(),
        events: storage.clone(),
        worktrees,
    };

    let daemon = Arc::new(DispatchDaemon::new(
        ports,
        sessions,
        agent_pool,
        merge_pipeline,
        daemon_config,
        Arc::new(|session, entity_id, prompt| {
            info!(
                session_id = %session.id,
                entity_id = %entity_id,
                prompt_len = prompt.len(),
                "session started"
            );
        }),
    ));

    let mut events = Arc::clone(&daemon).run().await;

    let daemon_for_ctrlc = Arc::clone(&daemon);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, draining in-flight cycle");
            daemon_for_ctrlc.stop().await;
        }
    });

    while let Some(event) = events.recv().await {
        log_daemon_event(&event);
    }

    info!("stoneforged shut down");
    Ok(())
}

fn log_daemon_event(event: &DaemonEvent) {
    match event {
        DaemonEvent::PollStart { kind } => info!(?kind, "poll:start"),
        DaemonEvent::PollComplete { result } => info!(
            poll_type = ?result.poll_type,
            duration_ms = result.duration_ms,
            processed = result.processed,
            errors = result.errors,
            "poll:complete"
        ),
        DaemonEvent::PollError { kind, error: err } => warn!(?kind, error = %err, "poll:error"),
        DaemonEvent::TaskDispatched { task_id, agent_id } => {
            info!(%task_id, %agent_id, "task:dispatched");
        }
        DaemonEvent::MessageForwarded { message_id, agent_id } => {
            info!(%message_id, %agent_id, "message:forwarded");
        }
        DaemonEvent::AgentSpawned { agent_id, worktree } => {
            info!(%agent_id, ?worktree, "agent:spawned");
        }
        DaemonEvent::AgentTriageSpawned { agent_id, channel_id, worktree } => {
            info!(%agent_id, %channel_id, %worktree, "agent:triage-spawned");
        }
        DaemonEvent::DaemonNotification { level, title, message } => match level {
            stoneforge::domain::models::NotificationLevel::Error => {
                error!(%title, ?message, "daemon:notification");
            }
            stoneforge::domain::models::NotificationLevel::Warning => {
                warn!(%title, ?message, "daemon:notification");
            }
            stoneforge::domain::models::NotificationLevel::Info => {
                info!(%title, ?message, "daemon:notification");
            }
        },
    }
}
