//! Typed view over the flexible `requirements` payload carried by
//! objectives.
//!
//! The payload is a sum of known shapes (plan linkage, dependency edges,
//! orchestration markers, specialization assignment, complexity analysis)
//! plus an open extensions bag. Access goes through this reader; callers
//! never mutate the bag in place.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Complexity analysis supplied by the external analyzer capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityAssessment {
    /// Qualitative bucket: "simple", "moderate", "complex"
    pub level: String,
    /// Model the plan phase should request for the architect
    pub recommended_model: String,
    /// Specialist agent types the objective needs
    #[serde(default)]
    pub required_specializations: Vec<String>,
    /// Rough duration estimate in minutes
    #[serde(default)]
    pub estimated_minutes: u32,
}

/// Structured requirements attached to an objective.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    /// Objective ids this objective depends on. Distinct from the
    /// parent/child hierarchy carried by `parent_objective_id`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Uuid>,

    /// Plan that materialized this objective, if any. `Some(None)` is
    /// represented by the tombstone marker below after plan deletion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<Uuid>,

    /// Section within the plan that this objective came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<Uuid>,

    /// Orchestration that owns this objective.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestration_id: Option<String>,

    /// Specialist agent type assigned to this objective by the plan phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialization: Option<String>,

    /// Complexity analysis recorded by the orchestrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<ComplexityAssessment>,

    /// Marker left behind when the owning plan is deleted. The objective
    /// survives but its plan linkage is a tombstone.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub plan_unlinked: bool,

    /// Open bag for shapes this version does not know about. Round-trips
    /// untouched.
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_orchestration(mut self, orchestration_id: impl Into<String>) -> Self {
        self.orchestration_id = Some(orchestration_id.into());
        self
    }

    pub fn with_specialization(mut self, specialization: impl Into<String>) -> Self {
        self.specialization = Some(specialization.into());
        self
    }

    /// Clear the plan linkage, leaving a tombstone.
    pub fn unlink_plan(&mut self) {
        self.plan_id = None;
        self.section_id = None;
        self.plan_unlinked = true;
    }

    /// Parse from a stored JSON string. Unknown fields land in the
    /// extensions bag rather than failing the row.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_round_trip_through_extensions() {
        let raw = r#"{"dependencies":[],"customFlag":true,"nested":{"a":1}}"#;
        let reqs = Requirements::from_json(raw).unwrap();
        assert_eq!(reqs.extensions.get("customFlag"), Some(&Value::Bool(true)));

        let back = reqs.to_json();
        let reparsed = Requirements::from_json(&back).unwrap();
        assert_eq!(reparsed.extensions.get("customFlag"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_empty_string_parses_to_default() {
        let reqs = Requirements::from_json("").unwrap();
        assert!(reqs.dependencies.is_empty());
        assert!(reqs.plan_id.is_none());
    }

    #[test]
    fn test_unlink_plan_leaves_tombstone() {
        let mut reqs = Requirements::new();
        reqs.plan_id = Some(Uuid::now_v7());
        reqs.section_id = Some(Uuid::now_v7());
        reqs.unlink_plan();
        assert!(reqs.plan_id.is_none());
        assert!(reqs.section_id.is_none());
        assert!(reqs.plan_unlinked);

        let json = reqs.to_json();
        assert!(json.contains("plan_unlinked"));
    }

    #[test]
    fn test_dependency_list_serializes() {
        let dep = Uuid::now_v7();
        let reqs = Requirements::new().with_dependencies(vec![dep]);
        let parsed = Requirements::from_json(&reqs.to_json()).unwrap();
        assert_eq!(parsed.dependencies, vec![dep]);
    }
}
