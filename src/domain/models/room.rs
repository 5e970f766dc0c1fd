//! Room and message models.
//!
//! A room is a named, ordered message log scoped to a repository path.
//! Messages are append-only; ordering is timestamp then insertion id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    /// Unique per repository_path.
    pub name: String,
    pub description: String,
    pub repository_path: String,
    #[serde(default)]
    pub room_metadata: Value,
    /// Soft-close flag; the row is kept and further sends are rejected.
    pub is_closed: bool,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn new(name: impl Into<String>, repository_path: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description: String::new(),
            repository_path: repository_path.into(),
            room_metadata: Value::Object(serde_json::Map::new()),
            is_closed: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Chat,
    System,
    Status,
    Progress,
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Chat
    }
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::System => "system",
            Self::Status => "status",
            Self::Progress => "progress",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "chat" => Some(Self::Chat),
            "system" => Some(Self::System),
            "status" => Some(Self::Status),
            "progress" => Some(Self::Progress),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub agent_name: String,
    pub message: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        room_id: Uuid,
        agent_name: impl Into<String>,
        message: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            room_id,
            agent_name: agent_name.into(),
            message: message.into(),
            message_type,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Active,
    Inactive,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub room_id: Uuid,
    pub agent_name: String,
    pub status: ParticipantStatus,
    pub joined_at: DateTime<Utc>,
}

/// Derive an orchestration room name: `orch-<kebab(objective[:40])>-<suffix6>`.
///
/// The suffix keeps names unique per repository even when two orchestrations
/// share an objective title.
pub fn orchestration_room_name(objective: &str, suffix: &str) -> String {
    let kebab: String = objective
        .chars()
        .take(40)
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let kebab = kebab.trim_matches('-');
    // Collapse runs of dashes left by punctuation/whitespace
    let mut collapsed = String::with_capacity(kebab.len());
    let mut prev_dash = false;
    for c in kebab.chars() {
        if c == '-' {
            if !prev_dash {
                collapsed.push('-');
            }
            prev_dash = true;
        } else {
            collapsed.push(c);
            prev_dash = false;
        }
    }
    let suffix6: String = suffix.chars().take(6).collect();
    format!("orch-{collapsed}-{suffix6}")
}
