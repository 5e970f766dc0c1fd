//! Objective domain model.
//!
//! Objectives are units of work with status, dependencies, and an optional
//! parent/child hierarchy. Dependencies live in `requirements.dependencies`
//! and are a separate relation from `parent_objective_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::requirements::Requirements;

/// Category of work an objective represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveType {
    Feature,
    BugFix,
    Refactor,
    Analysis,
    Testing,
    Documentation,
    Deployment,
    Setup,
    Maintenance,
    Optimization,
}

impl ObjectiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::BugFix => "bug_fix",
            Self::Refactor => "refactor",
            Self::Analysis => "analysis",
            Self::Testing => "testing",
            Self::Documentation => "documentation",
            Self::Deployment => "deployment",
            Self::Setup => "setup",
            Self::Maintenance => "maintenance",
            Self::Optimization => "optimization",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "feature" => Some(Self::Feature),
            "bug_fix" | "bugfix" => Some(Self::BugFix),
            "refactor" => Some(Self::Refactor),
            "analysis" => Some(Self::Analysis),
            "testing" => Some(Self::Testing),
            "documentation" => Some(Self::Documentation),
            "deployment" => Some(Self::Deployment),
            "setup" => Some(Self::Setup),
            "maintenance" => Some(Self::Maintenance),
            "optimization" => Some(Self::Optimization),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of an objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl Default for ObjectiveStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl ObjectiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" | "inprogress" => Some(Self::InProgress),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn valid_transitions(&self) -> &'static [ObjectiveStatus] {
        match self {
            Self::Pending => &[Self::InProgress, Self::Failed],
            Self::InProgress => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl std::fmt::Display for ObjectiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub id: Uuid,
    pub repository_path: String,
    pub objective_type: ObjectiveType,
    pub description: String,
    #[serde(default)]
    pub requirements: Requirements,
    pub status: ObjectiveStatus,
    pub priority: i32,
    pub assigned_agent_id: Option<Uuid>,
    pub parent_objective_id: Option<Uuid>,
    pub results: Option<Value>,
    /// Monotonic non-decreasing; reaches 100 exactly when completed.
    pub progress_percentage: Option<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Objective {
    pub fn new(
        repository_path: impl Into<String>,
        objective_type: ObjectiveType,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            repository_path: repository_path.into(),
            objective_type,
            description: description.into(),
            requirements: Requirements::default(),
            status: ObjectiveStatus::Pending,
            priority: 0,
            assigned_agent_id: None,
            parent_objective_id: None,
            results: None,
            progress_percentage: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_objective_id = Some(parent_id);
        self
    }

    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Dependency edges (objective ids), read from requirements.
    pub fn dependencies(&self) -> &[Uuid] {
        &self.requirements.dependencies
    }

    /// Estimated duration in minutes, used by execution planning. Falls
    /// back to a nominal hour when the analyzer supplied nothing.
    pub fn estimated_minutes(&self) -> u32 {
        self.requirements
            .complexity
            .as_ref()
            .map_or(60, |c| c.estimated_minutes.max(1))
    }
}
