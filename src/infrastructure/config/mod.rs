//! Configuration management infrastructure
//!
//! Hierarchical configuration using figment:
//! - YAML file loading
//! - Environment variable overrides
//! - Configuration validation
//! - Type-safe config structs

mod loader;
mod stoneforge;

pub use loader::{ConfigError, ConfigLoader};
pub use stoneforge::{
    AgentPoolConfig, DaemonConfig, MergeConfig, SpawnerSettings, StoneforgeConfig, WorktreeSettings,
};
