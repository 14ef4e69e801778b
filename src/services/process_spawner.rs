//! Process Spawner: forks the external LLM CLI and bridges its JSON stream to
//! a typed event emitter (§4.3).
//!
//! Grounded on `src/adapters/substrates/claude_code.rs` for the overall shape
//! — a `Command`-style launch, a background reader task, an `mpsc` channel
//! bridging events out, a pid-tracking map — with three deliberate
//! deviations from that file, recorded in `DESIGN.md`: the initial prompt
//! travels on stdin, not as a `-p` CLI argument; the exit status is always
//! translated into a single `exit(code, signal)` event, never discarded; and
//! termination goes through `nix::sys::signal::kill` rather than the
//! teacher's `Command::exec()`-based `terminate()`, which replaces the
//! calling process image and would kill the orchestrator itself if reached.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::models::{Session, SessionMode, SessionStatus};
use crate::domain::ports::{LaunchOpts, ProcessLauncher, SpawnerEvent};

/// CLI flags the headless contract requires, per §4.3 point 1.
const PRINT_FLAG: &str = "--print";
const VERBOSE_FLAG: &str = "--verbose";
const PERMISSION_BYPASS_FLAG: &str = "--dangerously-skip-permissions";
const OUTPUT_FORMAT_FLAGS: [&str; 2] = ["--output-format", "stream-json"];
const INPUT_FORMAT_FLAGS: [&str; 2] = ["--input-format", "stream-json"];

/// Configuration for the process spawner. `binary_path` names the provider
/// CLI; its wire format beyond the §4.3 contract is out of scope.
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    pub binary_path: String,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            binary_path: "agent-cli".into(),
        }
    }
}

/// Arguments to `ProcessSpawner::spawn`.
#[derive(Debug, Clone)]
pub struct SpawnOpts {
    pub entity_id: Uuid,
    pub role: String,
    pub working_directory: String,
    pub initial_prompt: String,
    pub interactive: bool,
    /// `--resume <providerSessionId>`, when resuming.
    pub resume: Option<String>,
}

/// Returned by `spawn`/`resume`-style calls: the session handle plus its
/// event stream.
pub struct SpawnOutcome {
    pub session: Session,
    pub events: mpsc::Receiver<SpawnerEvent>,
}

struct TrackedSession {
    entity_id: Uuid,
    os_pid: Option<u32>,
    status: SessionStatus,
    created_at: DateTime<Utc>,
    stdin: mpsc::Sender<String>,
}

/// Builds CLI args, launches the provider process, and classifies its NDJSON
/// stdout into typed events.
pub struct ProcessSpawner<L: ProcessLauncher> {
    config: SpawnerConfig,
    launcher: Arc<L>,
    tracked: Arc<RwLock<HashMap<Uuid, TrackedSession>>>,
}

impl<L: ProcessLauncher + 'static> ProcessSpawner<L> {
    #[must_use]
    pub fn new(config: SpawnerConfig, launcher: Arc<L>) -> Self {
        Self {
            config,
            launcher,
            tracked: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Assembles the CLI argument vector per §4.3 point 1. Pure and unit
    /// tested in isolation from the actual launch.
    #[must_use]
    pub fn build_args(&self, resume: Option<&str>) -> Vec<String> {
        let mut args = vec![
            PRINT_FLAG.to_string(),
            VERBOSE_FLAG.to_string(),
            PERMISSION_BYPASS_FLAG.to_string(),
        ];
        args.extend(OUTPUT_FORMAT_FLAGS.iter().map(ToString::to_string));
        args.extend(INPUT_FORMAT_FLAGS.iter().map(ToString::to_string));
        if let Some(id) = resume {
            args.push("--resume".to_string());
            args.push(id.to_string());
        }
        args
    }

    #[tracing::instrument(skip(self, opts), fields(entity_id = %opts.entity_id, role = %opts.role))]
    pub async fn spawn(&self, opts: SpawnOpts) -> DispatchResult<SpawnOutcome> {
        let mode = if opts.interactive {
            SessionMode::Interactive
        } else {
            SessionMode::Headless
        };
        let args = self.build_args(opts.resume.as_deref());
        let launched = self
            .launcher
            .launch(LaunchOpts {
                binary: self.config.binary_path.clone(),
                args,
                working_directory: opts.working_directory.clone(),
                initial_prompt: opts.initial_prompt,
                mode,
            })
            .await?;

        let mut session = Session::new(opts.entity_id, opts.role, mode, opts.working_directory);
        if opts.interactive {
            session.pid = launched.pid;
        }
        let mut raw_events = launched.events;
        let mut pending_first = None;
        if let Some(provider_id) = opts.resume {
            session.provider_session_id = Some(provider_id);
        } else {
            // A fresh spawn has no provider session id yet — the provider
            // mints one and reports it on the first `system` event it
            // emits (per the real CLI's `system`/`init` message carrying a
            // `session_id` field). Wait for it before returning so every
            // caller sees a resumable session from the start; this mirrors
            // how quickly a real headless CLI emits its init line.
            if let Some(event) = raw_events.recv().await {
                if let SpawnerEvent::System(value) = &event {
                    if let Some(id) = value.get("session_id").and_then(serde_json::Value::as_str) {
                        session.provider_session_id = Some(id.to_string());
                    }
                }
                pending_first = Some(event);
            }
        }
        session
            .transition_to(SessionStatus::Running)
            .map_err(|(from, to)| DispatchError::IllegalTransition {
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            })?;

        let tracked = TrackedSession {
            entity_id: opts.entity_id,
            os_pid: launched.pid,
            status: SessionStatus::Running,
            created_at: session.created_at,
            stdin: launched.stdin,
        };
        self.tracked.write().await.insert(session.id, tracked);

        let (out_tx, out_rx) = mpsc::channel(100);
        let tracked_map = Arc::clone(&self.tracked);
        let session_id = session.id;
        tokio::spawn(async move {
            let mut pending_first = pending_first;
            loop {
                let event = match pending_first.take() {
                    Some(event) => Some(event),
                    None => raw_events.recv().await,
                };
                let Some(event) = event else { break };
                let is_exit = matches!(event, SpawnerEvent::Exit { .. });
                if is_exit {
                    if let Some(t) = tracked_map.write().await.get_mut(&session_id) {
                        t.status = SessionStatus::Terminated;
                        t.os_pid = None;
                    }
                }
                if out_tx.send(event).await.is_err() {
                    break;
                }
                if is_exit {
                    break;
                }
            }
        });

        Ok(SpawnOutcome {
            session,
            events: out_rx,
        })
    }

    /// Allowed only when the session's tracked status is `Running`, per the
    /// input-acceptability predicate in §4.3.
    pub async fn send_input(&self, session_id: Uuid, content: String) -> DispatchResult<()> {
        let tracked = self.tracked.read().await;
        let t = tracked
            .get(&session_id)
            .ok_or_else(|| DispatchError::NotFound(format!("session {session_id}")))?;
        if t.status != SessionStatus::Running {
            return Err(DispatchError::InvalidArgument(format!(
                "session {session_id} is not running (status {:?})",
                t.status
            )));
        }
        t.stdin
            .send(content)
            .await
            .map_err(|_| DispatchError::Spawn("stdin channel closed".into()))
    }

    pub async fn suspend(&self, session_id: Uuid) -> DispatchResult<()> {
        let mut tracked = self.tracked.write().await;
        let t = tracked
            .get_mut(&session_id)
            .ok_or_else(|| DispatchError::NotFound(format!("session {session_id}")))?;
        if !t.status.can_transition_to(SessionStatus::Suspended) {
            return Err(DispatchError::IllegalTransition {
                from: format!("{:?}", t.status),
                to: "Suspended".into(),
            });
        }
        t.status = SessionStatus::Suspended;
        Ok(())
    }

    /// `graceful = true` sends SIGTERM via the launcher (which escalates to
    /// SIGKILL after its own grace timeout); `graceful = false` sends SIGKILL
    /// immediately.
    pub async fn terminate(&self, session_id: Uuid, graceful: bool) -> DispatchResult<()> {
        let pid = {
            let mut tracked = self.tracked.write().await;
            let t = tracked
                .get_mut(&session_id)
                .ok_or_else(|| DispatchError::NotFound(format!("session {session_id}")))?;
            if t.status.can_transition_to(SessionStatus::Terminating) {
                t.status = SessionStatus::Terminating;
            }
            t.os_pid
        };
        if let Some(pid) = pid {
            self.launcher.terminate(pid, graceful).await?;
        }
        Ok(())
    }

    /// The Spawner's own belief about a session's status. `None` means the
    /// Spawner has no record of it at all — used by the Session Manager's
    /// liveness cross-reference for headless sessions.
    pub async fn session_status(&self, session_id: Uuid) -> Option<SessionStatus> {
        self.tracked.read().await.get(&session_id).map(|t| t.status)
    }

    /// Whether the OS still believes `pid` is alive, delegated to the
    /// launcher. Used by the Session Manager's liveness check for
    /// `interactive` sessions, which surface a real `pid` on the domain model.
    pub fn is_alive(&self, pid: u32) -> bool {
        self.launcher.is_alive(pid)
    }

    pub async fn list_active_sessions(&self, entity_id: Option<Uuid>) -> Vec<Uuid> {
        self.tracked
            .read()
            .await
            .iter()
            .filter(|(_, t)| t.status != SessionStatus::Terminated)
            .filter(|(_, t)| entity_id.is_none_or(|e| e == t.entity_id))
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn list_all_sessions(&self, entity_id: Option<Uuid>) -> Vec<Uuid> {
        self.tracked
            .read()
            .await
            .iter()
            .filter(|(_, t)| entity_id.is_none_or(|e| e == t.entity_id))
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn get_most_recent_session(&self, entity_id: Uuid) -> Option<Uuid> {
        self.tracked
            .read()
            .await
            .iter()
            .filter(|(_, t)| t.entity_id == entity_id)
            .max_by_key(|(_, t)| t.created_at)
            .map(|(id, _)| *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fakes::FakeProcessLauncher;

    fn spawner() -> ProcessSpawner<FakeProcessLauncher> {
        ProcessSpawner::new(SpawnerConfig::default(), Arc::new(FakeProcessLauncher::new()))
    }

    #[test]
    fn build_args_includes_required_flags_and_never_the_prompt() {
        let s = spawner();
        let args = s.build_args(None);
        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"--verbose".to_string()));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(args.windows(2).any(|w| w == ["--output-format", "stream-json"]));
        assert!(args.windows(2).any(|w| w == ["--input-format", "stream-json"]));
        assert!(!args.iter().any(|a| a == "-p"));
    }

    #[test]
    fn build_args_includes_resume_flag_when_resuming() {
        let s = spawner();
        let args = s.build_args(Some("prov-123"));
        assert!(args.windows(2).any(|w| w == ["--resume", "prov-123"]));
    }

    #[tokio::test]
    async fn spawn_transitions_session_to_running_and_tracks_it() {
        let s = spawner();
        let outcome = s
            .spawn(SpawnOpts {
                entity_id: Uuid::new_v4(),
                role: "worker".into(),
                working_directory: "/wt".into(),
                initial_prompt: "do the task".into(),
                interactive: false,
                resume: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome.session.status, SessionStatus::Running);
        assert!(outcome.session.pid.is_none(), "headless sessions don't surface pid");
        assert_eq!(
            s.session_status(outcome.session.id).await,
            Some(SessionStatus::Running)
        );
    }

    #[tokio::test]
    async fn spawn_captures_provider_session_id_from_first_system_event() {
        let launcher = FakeProcessLauncher::with_initial_system_event(
            serde_json::json!({ "type": "system", "subtype": "init", "session_id": "prov-abc" }),
        );
        let s = ProcessSpawner::new(SpawnerConfig::default(), Arc::new(launcher));
        let outcome = s
            .spawn(SpawnOpts {
                entity_id: Uuid::new_v4(),
                role: "worker".into(),
                working_directory: "/wt".into(),
                initial_prompt: "do the task".into(),
                interactive: false,
                resume: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome.session.provider_session_id.as_deref(), Some("prov-abc"));

        let mut events = outcome.events;
        let first = events.recv().await.unwrap();
        assert!(matches!(first, SpawnerEvent::System(_)), "the seeded event is still forwarded to observers");
    }

    #[tokio::test]
    async fn send_input_rejected_when_not_running() {
        let s = spawner();
        let outcome = s
            .spawn(SpawnOpts {
                entity_id: Uuid::new_v4(),
                role: "worker".into(),
                working_directory: "/wt".into(),
                initial_prompt: "do the task".into(),
                interactive: false,
                resume: None,
            })
            .await
            .unwrap();
        s.suspend(outcome.session.id).await.unwrap();
        let err = s.send_input(outcome.session.id, "hello".into()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn unknown_session_status_is_none() {
        let s = spawner();
        assert_eq!(s.session_status(Uuid::new_v4()).await, None);
    }
}
