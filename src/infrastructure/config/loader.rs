use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use super::stoneforge::StoneforgeConfig;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid poll_interval_secs: {0}. Clamped range is [1, 60]")]
    InvalidPollInterval(u64),

    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("repo_root cannot be empty")]
    EmptyRepoRoot,

    #[error("workspace_root cannot be empty")]
    EmptyWorkspaceRoot,

    #[error("binary_path cannot be empty")]
    EmptyBinaryPath,
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. `.stoneforge/config.yaml` (project config)
    /// 3. `.stoneforge/local.yaml` (project local overrides, optional)
    /// 4. Environment variables (`STONEFORGE_` prefix, highest priority)
    ///
    /// Configuration is always project-local (pwd/.stoneforge/) to support
    /// multiple dispatchers per machine against different repos.
    pub fn load() -> Result<StoneforgeConfig> {
        let config: StoneforgeConfig = Figment::new()
            .merge(Serialized::defaults(StoneforgeConfig::default()))
            .merge(Yaml::file(".stoneforge/config.yaml"))
            .merge(Yaml::file(".stoneforge/local.yaml"))
            .merge(Env::prefixed("STONEFORGE_").split("__"))
            .extract()
            .context("failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, skipping the project/local
    /// YAML lookups `load()` does.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<StoneforgeConfig> {
        let config: StoneforgeConfig = Figment::new()
            .merge(Serialized::defaults(StoneforgeConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &StoneforgeConfig) -> Result<(), ConfigError> {
        if !(1..=60).contains(&config.daemon.poll_interval_secs) {
            return Err(ConfigError::InvalidPollInterval(config.daemon.poll_interval_secs));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        if config.worktree.repo_root.is_empty() {
            return Err(ConfigError::EmptyRepoRoot);
        }
        if config.worktree.workspace_root.is_empty() {
            return Err(ConfigError::EmptyWorkspaceRoot);
        }
        if config.spawner.binary_path.is_empty() {
            return Err(ConfigError::EmptyBinaryPath);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn default_config_is_valid() {
        let config = StoneforgeConfig::default();
        assert_eq!(config.daemon.poll_interval_secs, 5);
        assert_eq!(config.logging.level, "info");
        ConfigLoader::validate(&config).expect("default config should be valid");
    }

    #[test]
    fn validate_rejects_poll_interval_out_of_range() {
        let mut config = StoneforgeConfig::default();
        config.daemon.poll_interval_secs = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidPollInterval(0))
        ));

        config.daemon.poll_interval_secs = 61;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidPollInterval(61))
        ));
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut config = StoneforgeConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn validate_rejects_empty_paths() {
        let mut config = StoneforgeConfig::default();
        config.worktree.repo_root = String::new();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::EmptyRepoRoot)
        ));
    }

    #[test]
    fn hierarchical_merge_lets_override_file_win() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut base_file = NamedTempFile::new().unwrap();
        writeln!(base_file, "daemon:\n  poll_interval_secs: 5\n  inbox_poll_enabled: true").unwrap();
        base_file.flush().unwrap();

        let mut override_file = NamedTempFile::new().unwrap();
        writeln!(override_file, "daemon:\n  poll_interval_secs: 15").unwrap();
        override_file.flush().unwrap();

        let config: StoneforgeConfig = Figment::new()
            .merge(Serialized::defaults(StoneforgeConfig::default()))
            .merge(Yaml::file(base_file.path()))
            .merge(Yaml::file(override_file.path()))
            .extract()
            .unwrap();

        assert_eq!(config.daemon.poll_interval_secs, 15, "override file should win");
        assert!(
            config.daemon.inbox_poll_enabled,
            "base value should persist when not overridden"
        );
    }

    #[test]
    fn env_override_is_visible_to_figment() {
        unsafe {
            env::set_var("STONEFORGE_DAEMON__POLL_INTERVAL_SECS", "25");
        }
        let config: StoneforgeConfig = Figment::new()
            .merge(Serialized::defaults(StoneforgeConfig::default()))
            .merge(Env::prefixed("STONEFORGE_").split("__"))
            .extract()
            .unwrap();
        assert_eq!(config.daemon.poll_interval_secs, 25);
        unsafe {
            env::remove_var("STONEFORGE_DAEMON__POLL_INTERVAL_SECS");
        }
    }
}
