//! Default complexity analyzer.
//!
//! The real decomposition intelligence is an external capability; this
//! deterministic keyword heuristic keeps orchestrations runnable without
//! it and gives tests a stable fixture.

use async_trait::async_trait;

use crate::domain::error::CoreError;
use crate::domain::models::ComplexityAssessment;
use crate::domain::ports::ComplexityAnalyzer;

pub struct HeuristicComplexityAnalyzer;

const BACKEND_HINTS: &[&str] = &[
    "api", "endpoint", "server", "database", "auth", "oauth", "login", "backend", "queue",
];
const FRONTEND_HINTS: &[&str] = &["ui", "frontend", "page", "component", "form", "dashboard"];
const TESTING_HINTS: &[&str] = &["test", "coverage", "regression"];
const DOCS_HINTS: &[&str] = &["document", "docs", "readme", "guide"];
const DEVOPS_HINTS: &[&str] = &["deploy", "pipeline", "docker", "kubernetes", "ci"];

#[async_trait]
impl ComplexityAnalyzer for HeuristicComplexityAnalyzer {
    async fn analyze(&self, objective: &str) -> Result<ComplexityAssessment, CoreError> {
        let lowered = objective.to_lowercase();
        let mut specializations = vec!["architect".to_string()];

        let mut add_if = |hints: &[&str], specialization: &str| {
            if hints.iter().any(|hint| lowered.contains(hint)) {
                specializations.push(specialization.to_string());
            }
        };
        add_if(BACKEND_HINTS, "backend");
        add_if(FRONTEND_HINTS, "frontend");
        add_if(TESTING_HINTS, "testing");
        add_if(DOCS_HINTS, "documentation");
        add_if(DEVOPS_HINTS, "devops");

        // Something has to do the work even when no hint matches.
        if specializations.len() == 1 {
            specializations.push("implementer".to_string());
        }

        let worker_count = specializations.len() - 1;
        let words = objective.split_whitespace().count();
        let (level, minutes) = match (worker_count, words) {
            (1, 0..=12) => ("simple", 30),
            (1..=2, _) => ("moderate", 90),
            _ => ("complex", 240),
        };

        Ok(ComplexityAssessment {
            level: level.to_string(),
            recommended_model: if level == "complex" {
                "claude-opus-4".to_string()
            } else {
                "claude-sonnet-4".to_string()
            },
            required_specializations: specializations,
            estimated_minutes: minutes,
        })
    }
}
