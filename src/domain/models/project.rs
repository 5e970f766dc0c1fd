//! Project registration record.
//!
//! A project is a registered workspace keyed by repository path. It owns
//! nothing; at most one project per path may be active or connected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Connected,
    Inactive,
    Disconnected,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Connected => "connected",
            Self::Inactive => "inactive",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "connected" => Some(Self::Connected),
            "inactive" => Some(Self::Inactive),
            "disconnected" => Some(Self::Disconnected),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Live statuses count toward the single-active-project-per-path rule.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Connected)
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub repository_path: String,
    pub server_type: String,
    pub server_pid: Option<i32>,
    pub server_port: Option<u16>,
    pub host: String,
    pub session_id: Option<String>,
    pub status: ProjectStatus,
    pub start_time: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Value,
    pub web_ui_enabled: bool,
    pub web_ui_port: Option<u16>,
    pub web_ui_host: String,
}

impl Project {
    pub fn new(name: impl Into<String>, repository_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            repository_path: repository_path.into(),
            server_type: "mcp".to_string(),
            server_pid: None,
            server_port: None,
            host: "127.0.0.1".to_string(),
            session_id: None,
            status: ProjectStatus::Active,
            start_time: now,
            last_heartbeat: now,
            end_time: None,
            metadata: Value::Object(serde_json::Map::new()),
            web_ui_enabled: false,
            web_ui_port: None,
            web_ui_host: "127.0.0.1".to_string(),
        }
    }
}
