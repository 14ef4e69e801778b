//! Error taxonomy for the dispatch orchestrator.
//!
//! The four variant groups below correspond directly to the error classes the
//! core must distinguish: input errors are surfaced to the caller, environmental
//! errors are logged and counted but never abort a poll cycle, invariant
//! violations are logged at error level and self-healed rather than panicked on,
//! and protocol errors are counted per line by the process spawner.

use thiserror::Error;
use uuid::Uuid;

/// Errors the dispatch orchestrator's components can return.
#[derive(Debug, Error)]
pub enum DispatchError {
    // --- input errors: surfaced to the caller, never abort a poll cycle ---
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("entity already has an active session: {0}")]
    AlreadyActive(Uuid),

    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    // --- environmental errors: logged, per-item counted, not fatal ---
    #[error("failed to spawn provider process: {0}")]
    Spawn(String),

    #[error("filesystem operation failed: {0}")]
    Filesystem(#[source] std::io::Error),

    #[error("storage operation failed: {0}")]
    Storage(String),

    // --- invariant violations: logged at error level, self-healed ---
    #[error("invariant violation: {0}")]
    Invariant(String),

    // --- protocol errors: per-line skipped, counted ---
    #[error("malformed provider output: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used throughout the dispatch orchestrator.
pub type DispatchResult<T> = Result<T, DispatchError>;

impl DispatchError {
    /// True for the error classes §7 calls "environmental" — safe to retry,
    /// never an indication of a logic bug.
    #[must_use]
    pub const fn is_environmental(&self) -> bool {
        matches!(self, Self::Spawn(_) | Self::Filesystem(_) | Self::Storage(_))
    }

    /// True for the error classes §7 calls "input errors" — the caller passed
    /// something the core will never accept, retrying with the same args is
    /// pointless.
    #[must_use]
    pub const fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::InvalidArgument(_)
                | Self::AlreadyActive(_)
                | Self::IllegalTransition { .. }
        )
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        Self::Filesystem(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environmental_classification() {
        assert!(DispatchError::Spawn("x".into()).is_environmental());
        assert!(DispatchError::Storage("x".into()).is_environmental());
        assert!(!DispatchError::NotFound("x".into()).is_environmental());
    }

    #[test]
    fn input_error_classification() {
        assert!(DispatchError::NotFound("x".into()).is_input_error());
        assert!(DispatchError::AlreadyActive(Uuid::nil()).is_input_error());
        assert!(!DispatchError::Invariant("x".into()).is_input_error());
    }
}
