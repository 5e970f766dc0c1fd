//! Plan domain model.
//!
//! A plan is a template that materializes objectives when executed. It owns
//! its sections and the objective templates therein; materialized
//! objectives link back through `requirements.plan_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Approved,
    InProgress,
    Completed,
}

impl Default for PlanStatus {
    fn default() -> Self {
        Self::Draft
    }
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Approved => "approved",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "approved" => Some(Self::Approved),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn valid_transitions(&self) -> &'static [PlanStatus] {
        match self {
            Self::Draft => &[Self::Approved],
            Self::Approved => &[Self::InProgress],
            Self::InProgress => &[Self::Completed],
            Self::Completed => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Template for one objective inside a section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveTemplate {
    pub description: String,
    pub objective_type: String,
    #[serde(default)]
    pub estimated_hours: f64,
    /// Indexes of sibling templates (within the plan) this one depends on.
    #[serde(default)]
    pub dependencies: Vec<usize>,
}

/// One section of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub section_type: String,
    pub title: String,
    pub description: String,
    pub agent_responsibility: String,
    #[serde(default)]
    pub estimated_hours: f64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub objective_templates: Vec<ObjectiveTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub repository_path: String,
    pub title: String,
    pub description: String,
    /// Free-text statement of the plan's objectives.
    pub objectives: String,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub metadata: Value,
    pub status: PlanStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(
        repository_path: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            repository_path: repository_path.into(),
            title: title.into(),
            description: description.into(),
            objectives: String::new(),
            sections: Vec::new(),
            metadata: Value::Object(serde_json::Map::new()),
            status: PlanStatus::Draft,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Total number of objective templates across all sections.
    pub fn template_count(&self) -> usize {
        self.sections
            .iter()
            .map(|s| s.objective_templates.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_status_ladder() {
        assert!(PlanStatus::Draft.can_transition_to(PlanStatus::Approved));
        assert!(PlanStatus::Approved.can_transition_to(PlanStatus::InProgress));
        assert!(PlanStatus::InProgress.can_transition_to(PlanStatus::Completed));
        assert!(!PlanStatus::Draft.can_transition_to(PlanStatus::Completed));
        assert!(PlanStatus::Completed.valid_transitions().is_empty());
    }

    #[test]
    fn test_template_count() {
        let mut plan = Plan::new("/repo", "Auth", "OAuth rollout");
        plan.sections.push(Section {
            id: Uuid::now_v7(),
            section_type: "implementation".into(),
            title: "Backend".into(),
            description: String::new(),
            agent_responsibility: "backend".into(),
            estimated_hours: 4.0,
            priority: 5,
            prerequisites: vec![],
            objective_templates: vec![
                ObjectiveTemplate {
                    description: "token endpoint".into(),
                    objective_type: "feature".into(),
                    estimated_hours: 2.0,
                    dependencies: vec![],
                },
                ObjectiveTemplate {
                    description: "refresh flow".into(),
                    objective_type: "feature".into(),
                    estimated_hours: 2.0,
                    dependencies: vec![0],
                },
            ],
        });
        assert_eq!(plan.template_count(), 2);
    }
}
