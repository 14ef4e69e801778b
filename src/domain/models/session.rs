//! Session: a handle to a live or ended external agent process.
//!
//! Kept the teacher's session-model shape — status enum, `update_status` with
//! timestamp side effects, builder constructor, dense `#[cfg(test)]` block —
//! but redesigned the content: the teacher's `Session` modeled a conversation
//! event log; this one models an OS process lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a session was spawned for live human interaction or as a
/// fire-and-forget headless run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Interactive,
    Headless,
}

/// Session lifecycle status, shared by the Session Manager and the Process
/// Spawner (the Spawner's status-transition table is authoritative; the
/// Session Manager enforces the same table).
///
/// ```text
/// starting → running | terminated
/// running  → suspended | terminating | terminated
/// suspended → running | terminated
/// terminating → terminated
/// terminated → (sink)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Suspended,
    Terminating,
    Terminated,
}

impl SessionStatus {
    #[must_use]
    pub const fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Starting => &[Self::Running, Self::Terminated],
            Self::Running => &[Self::Suspended, Self::Terminating, Self::Terminated],
            Self::Suspended => &[Self::Running, Self::Terminated],
            Self::Terminating => &[Self::Terminated],
            Self::Terminated => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Only `running` sessions accept injected input (§4.3's input-acceptability
    /// predicate).
    #[must_use]
    pub const fn accepts_input(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Only non-terminated sessions count toward the "at most one active
    /// session per entity" invariant.
    #[must_use]
    pub const fn is_active_for_invariant(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Suspended)
    }
}

/// A handle to a live or ended external process for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Dispatcher-owned identifier.
    pub id: Uuid,
    /// Opaque string owned by the LLM CLI provider; required to resume.
    pub provider_session_id: Option<String>,
    pub entity_id: Uuid,
    pub role: String,
    pub mode: SessionMode,
    /// Only set for `interactive` sessions.
    pub pid: Option<u32>,
    pub status: SessionStatus,
    pub working_directory: String,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<String>,
    /// Whether this session's terminal state is kept indefinitely (so
    /// `getPreviousSession` can still find it) rather than reaped after the
    /// 5s terminated-session retention window.
    pub persisted: bool,
}

impl Session {
    #[must_use]
    pub fn new(entity_id: Uuid, role: impl Into<String>, mode: SessionMode, working_directory: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_session_id: None,
            entity_id,
            role: role.into(),
            mode,
            pid: None,
            status: SessionStatus::Starting,
            working_directory: working_directory.into(),
            created_at: Utc::now(),
            ended_at: None,
            termination_reason: None,
            persisted: true,
        }
    }

    /// Checked transition per the authoritative status-transition table.
    ///
    /// # Errors
    /// Returns the attempted `(from, to)` pair when the transition is illegal.
    pub fn transition_to(&mut self, next: SessionStatus) -> Result<(), (SessionStatus, SessionStatus)> {
        if !self.status.can_transition_to(next) {
            return Err((self.status, next));
        }
        self.apply_status(next, None);
        Ok(())
    }

    /// Forces the session to `terminated` regardless of current status,
    /// recording `reason`. Used by liveness self-heal (a claimed-running
    /// session whose process is actually dead) and by exit-event handling
    /// while `starting`/`terminating` (§4.2: "an exit event received while in
    /// `starting` or `terminating` always forces `terminated`").
    ///
    /// An exit event observed while already `terminated` or `suspended` is
    /// idempotently ignored by the caller before this is invoked.
    pub fn force_terminated(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(session_id = %self.id, entity_id = %self.entity_id, reason = %reason, "forcing session to terminated");
        self.apply_status(SessionStatus::Terminated, Some(reason));
    }

    fn apply_status(&mut self, next: SessionStatus, reason: Option<String>) {
        self.status = next;
        if next == SessionStatus::Terminated {
            self.ended_at = Some(Utc::now());
            if reason.is_some() {
                self.termination_reason = reason;
            }
        }
    }

    #[must_use]
    pub const fn is_active_for_invariant(&self) -> bool {
        self.status.is_active_for_invariant()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(Uuid::new_v4(), "worker", SessionMode::Headless, "/tmp/wt")
    }

    #[test]
    fn new_session_starts_in_starting() {
        let s = session();
        assert_eq!(s.status, SessionStatus::Starting);
        assert!(s.is_active_for_invariant());
    }

    #[test]
    fn starting_to_running_allowed() {
        let mut s = session();
        s.transition_to(SessionStatus::Running).unwrap();
        assert_eq!(s.status, SessionStatus::Running);
        assert!(s.ended_at.is_none());
    }

    #[test]
    fn running_to_starting_rejected() {
        let mut s = session();
        s.transition_to(SessionStatus::Running).unwrap();
        assert!(s.transition_to(SessionStatus::Starting).is_err());
    }

    #[test]
    fn terminated_is_sink() {
        let mut s = session();
        s.transition_to(SessionStatus::Terminated).unwrap();
        assert!(s.transition_to(SessionStatus::Running).is_err());
        assert!(!s.is_active_for_invariant());
    }

    #[test]
    fn force_terminated_sets_reason_and_timestamp() {
        let mut s = session();
        s.transition_to(SessionStatus::Running).unwrap();
        s.force_terminated("Process no longer alive");
        assert_eq!(s.status, SessionStatus::Terminated);
        assert_eq!(
            s.termination_reason.as_deref(),
            Some("Process no longer alive")
        );
        assert!(s.ended_at.is_some());
    }

    #[test]
    fn only_running_accepts_input() {
        assert!(!SessionStatus::Starting.accepts_input());
        assert!(SessionStatus::Running.accepts_input());
        assert!(!SessionStatus::Suspended.accepts_input());
    }
}
