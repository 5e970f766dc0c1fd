//! Agent domain model.
//!
//! An agent is a supervised long-running child process plus its persistent
//! record. The record outlives the process: reconciliation keeps the stored
//! status honest against the OS-visible pid.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Status of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Record persisted, child process not yet spawned
    Initializing,
    /// Child process is running
    Active,
    /// Child process is alive but between assignments
    Idle,
    /// Agent finished its work
    Completed,
    /// Agent was terminated (explicitly or by reconciliation)
    Terminated,
    /// Agent failed (spawn error or non-zero exit)
    Failed,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Initializing
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "initializing" => Some(Self::Initializing),
            "active" => Some(Self::Active),
            "idle" => Some(Self::Idle),
            "completed" => Some(Self::Completed),
            "terminated" => Some(Self::Terminated),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal statuses are sticky: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Terminated | Self::Failed)
    }

    pub fn valid_transitions(&self) -> &'static [AgentStatus] {
        match self {
            Self::Initializing => &[Self::Active, Self::Failed, Self::Terminated],
            Self::Active => &[
                Self::Idle,
                Self::Completed,
                Self::Terminated,
                Self::Failed,
            ],
            Self::Idle => &[
                Self::Active,
                Self::Completed,
                Self::Terminated,
                Self::Failed,
            ],
            Self::Completed | Self::Terminated | Self::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A supervised agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub agent_name: String,
    pub agent_type: Option<String>,
    pub repository_path: String,
    pub status: AgentStatus,
    /// Capability tags, free-form (e.g. "code", "tests", "docs")
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Agent ids this agent waits on before doing real work. May not
    /// contain this agent's own id nor form a cycle.
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    pub claude_pid: Option<i32>,
    pub convo_session_id: Option<String>,
    pub room_id: Option<Uuid>,
    #[serde(default)]
    pub agent_metadata: Value,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(agent_name: impl Into<String>, repository_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            agent_name: agent_name.into(),
            agent_type: None,
            repository_path: repository_path.into(),
            status: AgentStatus::Initializing,
            capabilities: Vec::new(),
            depends_on: Vec::new(),
            claude_pid: None,
            convo_session_id: None,
            room_id: None,
            agent_metadata: Value::Object(serde_json::Map::new()),
            created_at: now,
            last_heartbeat: now,
            updated_at: now,
        }
    }

    pub fn with_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn with_dependencies(mut self, depends_on: Vec<Uuid>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Seconds since the last heartbeat.
    pub fn heartbeat_age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_heartbeat).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses_are_sticky() {
        for status in [
            AgentStatus::Completed,
            AgentStatus::Terminated,
            AgentStatus::Failed,
        ] {
            assert!(status.is_terminal());
            assert!(status.valid_transitions().is_empty());
        }
    }

    #[test]
    fn test_initializing_to_active() {
        assert!(AgentStatus::Initializing.can_transition_to(AgentStatus::Active));
        assert!(!AgentStatus::Initializing.can_transition_to(AgentStatus::Idle));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            AgentStatus::Initializing,
            AgentStatus::Active,
            AgentStatus::Idle,
            AgentStatus::Completed,
            AgentStatus::Terminated,
            AgentStatus::Failed,
        ] {
            assert_eq!(AgentStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(AgentStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_new_agent_defaults() {
        let agent = Agent::new("builder-1", "/repo");
        assert_eq!(agent.status, AgentStatus::Initializing);
        assert!(agent.claude_pid.is_none());
        assert!(agent.depends_on.is_empty());
    }

    #[test]
    fn test_ids_are_sortable_by_creation() {
        let a = Agent::new("a", "/repo");
        // v7 ids only order across millisecond boundaries
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Agent::new("b", "/repo");
        assert!(a.id < b.id);
    }
}
