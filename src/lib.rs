//! Stoneforge — dispatch orchestrator for a fleet of external AI coding
//! agent processes.
//!
//! The core matches ready tasks to idle agents, spawns and supervises
//! external agent processes against isolated git worktrees, routes inbound
//! messages to the right agent or a batched triage session, drives
//! completed work through a merge pipeline, and reconciles state after
//! crashes and restarts. See `services::dispatch_daemon` for the poll cycle
//! that ties the other seven components together.

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;
