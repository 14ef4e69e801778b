//! The serializable configuration shape for a `stoneforged` process,
//! deserialized by `ConfigLoader` and converted into the service-level
//! config structs (`DispatchDaemonConfig`, `SpawnerConfig`,
//! `MergePipelineConfig`) at startup.
//!
//! Kept as a plain, flat, all-seconds-as-integers struct rather than reusing
//! the service configs directly: the service configs use `std::time::Duration`
//! and `chrono::Duration`, neither of which round-trips through YAML as
//! cleanly as a `u64` field name ending in `_secs`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::models::{EntitySubkind, StewardFocus, WorkerKind};
use crate::infrastructure::logging::LogConfig;

/// Top-level configuration for a `stoneforged` process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StoneforgeConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub agent_pool: AgentPoolConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub worktree: WorktreeSettings,
    #[serde(default)]
    pub spawner: SpawnerSettings,
    #[serde(default)]
    pub logging: LogConfig,
}

impl Default for StoneforgeConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            agent_pool: AgentPoolConfig::default(),
            merge: MergeConfig::default(),
            worktree: WorktreeSettings::default(),
            spawner: SpawnerSettings::default(),
            logging: LogConfig::default(),
        }
    }
}

/// Mirrors `services::dispatch_daemon::DispatchDaemonConfig` (§4.1) in a
/// YAML/env-friendly shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DaemonConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub worker_availability_poll_enabled: bool,
    #[serde(default = "default_true")]
    pub inbox_poll_enabled: bool,
    #[serde(default = "default_true")]
    pub steward_trigger_poll_enabled: bool,
    #[serde(default = "default_true")]
    pub workflow_task_poll_enabled: bool,
    #[serde(default = "default_true")]
    pub orphan_recovery_enabled: bool,
    #[serde(default = "default_true")]
    pub closed_unmerged_reconciliation_enabled: bool,
    #[serde(default = "default_true")]
    pub stuck_merge_recovery_enabled: bool,
    /// `None` disables the max-session-duration reaper.
    #[serde(default)]
    pub max_session_duration_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub director_inbox_forwarding_enabled: bool,
    #[serde(default = "default_director_inbox_idle_threshold_secs")]
    pub director_inbox_idle_threshold_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            worker_availability_poll_enabled: true,
            inbox_poll_enabled: true,
            steward_trigger_poll_enabled: true,
            workflow_task_poll_enabled: true,
            orphan_recovery_enabled: true,
            closed_unmerged_reconciliation_enabled: true,
            stuck_merge_recovery_enabled: true,
            max_session_duration_secs: None,
            director_inbox_forwarding_enabled: true,
            director_inbox_idle_threshold_secs: default_director_inbox_idle_threshold_secs(),
        }
    }
}

/// Mirrors `services::agent_pool::AgentPool`'s per-`(role, subkind)` caps.
///
/// Caps are keyed by plain strings rather than `EntitySubkind` directly: that
/// enum is internally tagged for its domain-event use, which doesn't survive
/// round-tripping as a map key in every format figment merges (YAML, env).
/// `resolve()` parses the recognized keys into the real `EntitySubkind` the
/// `AgentPool` constructor wants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AgentPoolConfig {
    /// One of `director`, `ephemeral_worker`, `persistent_worker`,
    /// `merge_steward`, `health_steward`. Missing keys default to unlimited.
    #[serde(default)]
    pub caps: HashMap<String, usize>,
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self { caps: HashMap::new() }
    }
}

impl AgentPoolConfig {
    /// Parses the string-keyed caps into `EntitySubkind` keys, skipping (and
    /// logging) any key that doesn't match a recognized subkind name.
    #[must_use]
    pub fn resolve(&self) -> HashMap<EntitySubkind, usize> {
        self.caps
            .iter()
            .filter_map(|(key, &limit)| {
                let subkind = match key.as_str() {
                    "director" => EntitySubkind::Director,
                    "ephemeral_worker" => EntitySubkind::Worker(WorkerKind::Ephemeral),
                    "persistent_worker" => EntitySubkind::Worker(WorkerKind::Persistent),
                    "merge_steward" => EntitySubkind::Steward(StewardFocus::Merge),
                    "health_steward" => EntitySubkind::Steward(StewardFocus::Health),
                    other => {
                        tracing::warn!(key = other, "unrecognized agent_pool cap key, ignoring");
                        return None;
                    }
                };
                Some((subkind, limit))
            })
            .collect()
    }
}

/// Mirrors `services::merge_pipeline::MergePipelineConfig` (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MergeConfig {
    #[serde(default = "default_closed_unmerged_grace_period_secs")]
    pub closed_unmerged_grace_period_secs: i64,
    #[serde(default = "default_stuck_merge_recovery_grace_period_secs")]
    pub stuck_merge_recovery_grace_period_secs: i64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            closed_unmerged_grace_period_secs: default_closed_unmerged_grace_period_secs(),
            stuck_merge_recovery_grace_period_secs: default_stuck_merge_recovery_grace_period_secs(),
        }
    }
}

/// Mirrors the arguments `adapters::worktree_manager_git::GitWorktreeManager`
/// needs to resolve checkout paths (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorktreeSettings {
    #[serde(default = "default_repo_root")]
    pub repo_root: String,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
}

impl Default for WorktreeSettings {
    fn default() -> Self {
        Self {
            repo_root: default_repo_root(),
            workspace_root: default_workspace_root(),
        }
    }
}

/// Mirrors `services::process_spawner::SpawnerConfig` (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SpawnerSettings {
    #[serde(default = "default_binary_path")]
    pub binary_path: String,
}

impl Default for SpawnerSettings {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
        }
    }
}

const fn default_poll_interval_secs() -> u64 {
    5
}

const fn default_director_inbox_idle_threshold_secs() -> u64 {
    120
}

const fn default_closed_unmerged_grace_period_secs() -> i64 {
    120
}

const fn default_stuck_merge_recovery_grace_period_secs() -> i64 {
    600
}

fn default_repo_root() -> String {
    ".".to_string()
}

fn default_workspace_root() -> String {
    ".stoneforge/worktrees".to_string()
}

fn default_binary_path() -> String {
    "agent-cli".to_string()
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = StoneforgeConfig::default();
        assert_eq!(cfg.daemon.poll_interval_secs, 5);
        assert_eq!(cfg.daemon.director_inbox_idle_threshold_secs, 120);
        assert_eq!(cfg.merge.closed_unmerged_grace_period_secs, 120);
        assert_eq!(cfg.merge.stuck_merge_recovery_grace_period_secs, 600);
        assert!(cfg.daemon.max_session_duration_secs.is_none());
    }

    #[test]
    fn yaml_round_trip_overrides_nested_fields() {
        let yaml = r"
daemon:
  poll_interval_secs: 10
  inbox_poll_enabled: false
merge:
  stuck_merge_recovery_grace_period_secs: 900
";
        let merged: StoneforgeConfig = figment::Figment::new()
            .merge(figment::providers::Serialized::defaults(StoneforgeConfig::default()))
            .merge(figment::providers::Yaml::string(yaml))
            .extract()
            .expect("yaml should parse");

        assert_eq!(merged.daemon.poll_interval_secs, 10);
        assert!(!merged.daemon.inbox_poll_enabled);
        assert_eq!(merged.merge.stuck_merge_recovery_grace_period_secs, 900);
        // untouched nested field keeps its default
        assert!(merged.daemon.worker_availability_poll_enabled);
    }

    #[test]
    fn agent_pool_resolve_parses_known_keys_and_skips_unknown() {
        let mut caps = HashMap::new();
        caps.insert("ephemeral_worker".to_string(), 5);
        caps.insert("merge_steward".to_string(), 1);
        caps.insert("not_a_real_subkind".to_string(), 99);
        let cfg = AgentPoolConfig { caps };

        let resolved = cfg.resolve();
        assert_eq!(resolved.len(), 2);
        assert_eq!(
            resolved.get(&EntitySubkind::Worker(WorkerKind::Ephemeral)),
            Some(&5)
        );
        assert_eq!(
            resolved.get(&EntitySubkind::Steward(StewardFocus::Merge)),
            Some(&1)
        );
    }
}
