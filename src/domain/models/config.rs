//! Runtime configuration model.
//!
//! Loaded hierarchically by the config loader: programmatic defaults, then
//! `config.yaml` under the data directory, then `ZMCP_*` environment
//! variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root data directory holding the database, knowledge files, and the
    /// dashboard discovery file.
    pub data_dir: PathBuf,
    pub http_host: String,
    pub http_port: u16,
    pub dashboard_port: u16,
    pub worker: WorkerConfig,
    pub cleanup: CleanupConfig,
    /// Default budget for dependency waits, milliseconds.
    pub dependency_wait_timeout_ms: u64,
    pub dashboard: DashboardConfig,
    pub logging: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            http_host: "127.0.0.1".to_string(),
            http_port: 4269,
            dashboard_port: 4270,
            worker: WorkerConfig::default(),
            cleanup: CleanupConfig::default(),
            dependency_wait_timeout_ms: 600_000,
            dashboard: DashboardConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl Config {
    /// Path of the embedded database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("zmcp.db")
    }

    /// Path of the dashboard discovery file.
    pub fn dashboard_discovery_path(&self) -> PathBuf {
        self.data_dir.join("dashboard.port")
    }

    /// Directory for knowledge store entities (sibling of the database).
    pub fn knowledge_dir(&self) -> PathBuf {
        self.data_dir.join("knowledge")
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcptools")
        .join("data")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_concurrent_jobs: usize,
    pub browser_pool_size: usize,
    pub job_timeout_seconds: i64,
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            browser_pool_size: 3,
            job_timeout_seconds: 3600,
            poll_interval_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub agent_stale_minutes: i64,
    pub room_inactive_minutes: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            agent_stale_minutes: 30,
            room_inactive_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub connection_check_interval_ms: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            connection_check_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// pretty | json
    pub format: String,
    /// When set, also log to a rolling daily file under this directory.
    pub log_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            log_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.http_port, 4269);
        assert_eq!(config.dashboard_port, 4270);
        assert_eq!(config.worker.max_concurrent_jobs, 2);
        assert_eq!(config.worker.poll_interval_ms, 15_000);
        assert_eq!(config.cleanup.agent_stale_minutes, 30);
        assert_eq!(config.cleanup.room_inactive_minutes, 60);
        assert_eq!(config.dependency_wait_timeout_ms, 600_000);
        assert_eq!(config.dashboard.max_reconnect_attempts, 10);
        assert!(config.data_dir.ends_with(".mcptools/data"));
    }

    #[test]
    fn test_derived_paths() {
        let mut config = Config::default();
        config.data_dir = PathBuf::from("/tmp/zmcp-test");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/zmcp-test/zmcp.db"));
        assert_eq!(
            config.dashboard_discovery_path(),
            PathBuf::from("/tmp/zmcp-test/dashboard.port")
        );
    }
}
