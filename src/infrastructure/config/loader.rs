//! Hierarchical configuration loading.
//!
//! Precedence, lowest to highest: programmatic defaults, the YAML file
//! under `~/.mcptools/config.yaml`, then `ZMCP_*` environment variables
//! (`__` separates nesting, e.g. `ZMCP_WORKER__POLL_INTERVAL_MS`).

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::models::Config;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_concurrent_jobs: {0}. Must be between 1 and 32")]
    InvalidMaxConcurrentJobs(usize),

    #[error("Invalid poll_interval_ms: {0}. Must be at least 100")]
    InvalidPollInterval(u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid stale threshold: {0}. Must be positive")]
    InvalidStaleMinutes(i64),

    #[error("Invalid dependency wait timeout: {0}. Must be at least 1000 ms")]
    InvalidWaitTimeout(u64),
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load() -> Result<Config> {
        let default_file = Self::default_config_file();
        Self::load_with_file(default_file.as_deref())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        Self::load_with_file(Some(path.as_ref()))
    }

    fn load_with_file(file: Option<&Path>) -> Result<Config> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(path) = file {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed("ZMCP_").split("__"))
            .extract()
            .context("failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn default_config_file() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".mcptools").join("config.yaml"))
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.worker.max_concurrent_jobs == 0 || config.worker.max_concurrent_jobs > 32 {
            return Err(ConfigError::InvalidMaxConcurrentJobs(
                config.worker.max_concurrent_jobs,
            ));
        }
        if config.worker.poll_interval_ms < 100 {
            return Err(ConfigError::InvalidPollInterval(
                config.worker.poll_interval_ms,
            ));
        }
        if !matches!(
            config.logging.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        if !matches!(config.logging.format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        if config.cleanup.agent_stale_minutes <= 0 || config.cleanup.room_inactive_minutes <= 0 {
            return Err(ConfigError::InvalidStaleMinutes(
                config.cleanup.agent_stale_minutes.min(config.cleanup.room_inactive_minutes),
            ));
        }
        if config.dependency_wait_timeout_ms < 1_000 {
            return Err(ConfigError::InvalidWaitTimeout(
                config.dependency_wait_timeout_ms,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_pass_validation() {
        let config = Config::default();
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "http_port: 9999\nworker:\n  max_concurrent_jobs: 4\n",
        )
        .unwrap();

        let config = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(config.http_port, 9999);
        assert_eq!(config.worker.max_concurrent_jobs, 4);
        // Untouched values keep their defaults
        assert_eq!(config.dashboard_port, 4270);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "worker:\n  max_concurrent_jobs: 0\n").unwrap();
        assert!(ConfigLoader::load_from_file(&path).is_err());

        std::fs::write(&path, "logging:\n  level: shouty\n").unwrap();
        assert!(ConfigLoader::load_from_file(&path).is_err());
    }
}
