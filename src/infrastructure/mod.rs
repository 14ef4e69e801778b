//! Infrastructure layer
//!
//! Ambient concerns the dispatch orchestrator needs to run as a real
//! process, independent of the domain/service logic:
//! - Hierarchical configuration (figment: YAML + env)
//! - Structured logging, log rotation, secret scrubbing, audit trail

pub mod config;
pub mod logging;
