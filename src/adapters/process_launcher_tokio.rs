//! Real `ProcessLauncher`, backed by `tokio::process::Command`.
//!
//! Grounded on `src/adapters/substrates/claude_code.rs`'s `execute_streaming`
//! (spawn, take stdout, `BufReader::lines()`, forward parsed output over an
//! `mpsc` channel, reap the child on exit) with the three deviations recorded
//! in `DESIGN.md`: the prompt is written to stdin after spawn rather than
//! passed as a `-p` argument, the exit status always becomes one
//! `SpawnerEvent::Exit`, and termination sends real signals via `nix`
//! instead of that file's `std::os::unix::process::CommandExt::exec()` call
//! (which replaces the *caller's* process image — fatal here, since the
//! caller is the orchestrator itself, not a disposable helper process).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};
use tracing::{instrument, warn};

use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::ports::{LaunchOpts, LaunchedProcess, ProcessLauncher, SpawnerEvent};

/// How long a graceful `terminate` waits after SIGTERM before escalating to
/// SIGKILL.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(5);

fn classify_line(line: &str) -> Option<SpawnerEvent> {
    let json: Value = serde_json::from_str(line).ok()?;
    let kind = json.get("type")?.as_str()?;
    Some(match kind {
        "system" => SpawnerEvent::System(json),
        "assistant" => SpawnerEvent::Assistant(json),
        "tool_use" => SpawnerEvent::ToolUse(json),
        "tool_result" => SpawnerEvent::ToolResult(json),
        "error" => SpawnerEvent::Error(json),
        _ => return None,
    })
}

pub struct TokioProcessLauncher {
    alive: Arc<Mutex<HashMap<u32, bool>>>,
}

impl TokioProcessLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            alive: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for TokioProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    #[instrument(skip(self, opts), fields(binary = %opts.binary))]
    async fn launch(&self, opts: LaunchOpts) -> DispatchResult<LaunchedProcess> {
        let mut cmd = Command::new(&opts.binary);
        cmd.args(&opts.args)
            .current_dir(&opts.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| DispatchError::Spawn(format!("failed to spawn {}: {e}", opts.binary)))?;

        let pid = child.id();
        if let Some(pid) = pid {
            self.alive.lock().await.insert(pid, true);
        }

        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| DispatchError::Spawn("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DispatchError::Spawn("failed to capture stdout".into()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(16);
        let initial_prompt = opts.initial_prompt;
        tokio::spawn(async move {
            if child_stdin
                .write_all(format!("{initial_prompt}\n").as_bytes())
                .await
                .is_err()
            {
                return;
            }
            while let Some(line) = stdin_rx.recv().await {
                if child_stdin.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let (events_tx, events_rx) = mpsc::channel::<SpawnerEvent>(100);
        let alive = Arc::clone(&self.alive);
        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(event) = classify_line(&line) {
                    if events_tx.send(event).await.is_err() {
                        return;
                    }
                } else if !line.trim().is_empty() {
                    warn!(line, "unclassified provider output line, counted as protocol error");
                }
            }
            let status = child.wait().await.ok();
            if let Some(pid) = pid {
                alive.lock().await.insert(pid, false);
            }
            let _ = events_tx
                .send(SpawnerEvent::Exit {
                    code: status.and_then(|s| s.code()),
                    #[cfg(unix)]
                    signal: status.and_then(|s| std::os::unix::process::ExitStatusExt::signal(&s)),
                    #[cfg(not(unix))]
                    signal: None,
                })
                .await;
        });

        Ok(LaunchedProcess {
            pid,
            events: events_rx,
            stdin: stdin_tx,
        })
    }

    #[instrument(skip(self))]
    async fn terminate(&self, pid: u32, graceful: bool) -> DispatchResult<()> {
        let nix_pid = Pid::from_raw(pid as i32);
        if graceful {
            kill(nix_pid, Signal::SIGTERM).ok();
            sleep(GRACEFUL_TIMEOUT).await;
            if self.is_alive(pid) {
                warn!(pid, "process still alive after SIGTERM grace period, sending SIGKILL");
                kill(nix_pid, Signal::SIGKILL)
                    .map_err(|e| DispatchError::Spawn(format!("SIGKILL failed for pid {pid}: {e}")))?;
            }
        } else {
            kill(nix_pid, Signal::SIGKILL)
                .map_err(|e| DispatchError::Spawn(format!("SIGKILL failed for pid {pid}: {e}")))?;
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_event_kinds() {
        assert!(matches!(
            classify_line(r#"{"type":"system","subtype":"init"}"#),
            Some(SpawnerEvent::System(_))
        ));
        assert!(matches!(
            classify_line(r#"{"type":"assistant","message":{}}"#),
            Some(SpawnerEvent::Assistant(_))
        ));
        assert!(matches!(
            classify_line(r#"{"type":"tool_use","name":"bash"}"#),
            Some(SpawnerEvent::ToolUse(_))
        ));
    }

    #[test]
    fn unrecognized_type_field_is_filtered_out() {
        assert!(classify_line(r#"{"type":"something-new"}"#).is_none());
    }

    #[test]
    fn non_json_line_is_filtered_out() {
        assert!(classify_line("not json at all").is_none());
    }
}
