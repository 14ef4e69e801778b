//! The process-provider contract (§6): spawn a CLI process that reads a
//! prompt on stdin and emits NDJSON events on stdout.
//!
//! This is the low-level seam `services::process_spawner` is built on top of —
//! it owns only "run this command, bridge its stdio", not any of the CLI
//! argument assembly or event-type classification, which are core per §4.3 and
//! live in the service itself. Separating the two lets tests swap in a fake
//! launcher while keeping the Spawner's own logic — including the bug-for-bug
//! *fixed* termination path — under test.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::domain::errors::DispatchResult;
use crate::domain::models::SessionMode;

/// One line of typed output from the provider process, per §4.3 point 3.
#[derive(Debug, Clone)]
pub enum SpawnerEvent {
    System(Value),
    Assistant(Value),
    ToolUse(Value),
    ToolResult(Value),
    Error(Value),
    /// Emitted exactly once, when the process terminates.
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// What to launch. CLI argument assembly per §4.3 point 1 happens in
/// `services::process_spawner`; this struct is the already-built command line.
#[derive(Debug, Clone)]
pub struct LaunchOpts {
    pub binary: String,
    pub args: Vec<String>,
    pub working_directory: String,
    /// Sent on stdin as the first message, never as a CLI argument.
    pub initial_prompt: String,
    pub mode: SessionMode,
}

/// A running process, handed back by `ProcessLauncher::launch`.
pub struct LaunchedProcess {
    /// The OS process id, when the launcher was able to obtain one. Always
    /// populated regardless of mode — it is `Session.pid` on the domain model
    /// that is mode-gated (only surfaced for `interactive` sessions, per §3),
    /// not this internal handle, which the Spawner needs for termination
    /// either way.
    pub pid: Option<u32>,
    /// Stream of parsed stdout events, terminated by exactly one `Exit`.
    pub events: mpsc::Receiver<SpawnerEvent>,
    /// Additional input may be written here while the session accepts it
    /// (`SessionStatus::Running`); closing the sender closes the child's
    /// stdin.
    pub stdin: mpsc::Sender<String>,
}

/// Forks a command and bridges its stdio. The real implementation uses
/// `tokio::process::Command`; a deterministic fake drives tests without ever
/// touching the OS process table.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, opts: LaunchOpts) -> DispatchResult<LaunchedProcess>;

    /// Sends a termination signal to `pid`. `graceful = true` sends SIGTERM
    /// and waits briefly before escalating to SIGKILL; `graceful = false`
    /// sends SIGKILL immediately.
    async fn terminate(&self, pid: u32, graceful: bool) -> DispatchResult<()>;

    /// Whether the OS still believes `pid` is alive. Used by the Session
    /// Manager's liveness verification for `interactive` sessions.
    fn is_alive(&self, pid: u32) -> bool;
}
