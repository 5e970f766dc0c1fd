//! Plan lifecycle: draft → approved → in_progress → completed, plus
//! objective materialization and unlink-on-delete tombstones.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::error::CoreError;
use crate::domain::models::{ObjectiveType, Plan, PlanStatus, Requirements};
use crate::domain::ports::{ObjectiveRepository, PlanRepository};

use super::objective_service::{CreateObjectiveRequest, ObjectiveService};

pub struct PlanService {
    plans: Arc<dyn PlanRepository>,
    objective_repo: Arc<dyn ObjectiveRepository>,
    objectives: Arc<ObjectiveService>,
}

impl PlanService {
    pub fn new(
        plans: Arc<dyn PlanRepository>,
        objective_repo: Arc<dyn ObjectiveRepository>,
        objectives: Arc<ObjectiveService>,
    ) -> Self {
        Self {
            plans,
            objective_repo,
            objectives,
        }
    }

    pub async fn create(&self, plan: Plan) -> Result<Plan, CoreError> {
        self.plans.insert(plan.clone()).await?;
        Ok(plan)
    }

    pub async fn get(&self, plan_id: Uuid) -> Result<Option<Plan>, CoreError> {
        Ok(self.plans.get(plan_id).await?)
    }

    pub async fn list(&self, repository_path: &str) -> Result<Vec<Plan>, CoreError> {
        Ok(self.plans.list(repository_path).await?)
    }

    pub async fn approve(&self, plan_id: Uuid) -> Result<Plan, CoreError> {
        self.transition(plan_id, PlanStatus::Approved).await
    }

    pub async fn complete(&self, plan_id: Uuid) -> Result<Plan, CoreError> {
        let mut plan = self.transition(plan_id, PlanStatus::Completed).await?;
        plan.completed_at = Some(Utc::now());
        self.plans.update(plan.clone()).await?;
        Ok(plan)
    }

    /// Execute an approved plan: move it to `in_progress` and materialize
    /// one objective per template, wiring template-index dependencies to
    /// the created objective ids.
    pub async fn execute(&self, plan_id: Uuid) -> Result<Vec<Uuid>, CoreError> {
        let mut plan = self.transition(plan_id, PlanStatus::InProgress).await?;
        plan.started_at = Some(Utc::now());
        self.plans.update(plan.clone()).await?;

        // Flatten templates in section order; dependency indexes are
        // global across the plan.
        let mut created: Vec<Uuid> = Vec::new();
        let mut pending_edges: Vec<(Uuid, Vec<usize>)> = Vec::new();

        for section in &plan.sections {
            for template in &section.objective_templates {
                let objective_type = ObjectiveType::from_str(&template.objective_type)
                    .unwrap_or(ObjectiveType::Feature);

                let mut requirements = Requirements::new();
                requirements.plan_id = Some(plan.id);
                requirements.section_id = Some(section.id);

                let objective = self
                    .objectives
                    .create(CreateObjectiveRequest {
                        repository_path: plan.repository_path.clone(),
                        objective_type,
                        description: template.description.clone(),
                        priority: Some(section.priority),
                        requirements: Some(requirements),
                        parent_objective_id: None,
                    })
                    .await?;

                if !template.dependencies.is_empty() {
                    pending_edges.push((objective.id, template.dependencies.clone()));
                }
                created.push(objective.id);
            }
        }

        // Second pass: resolve index-based dependencies now that every
        // sibling exists.
        let index_to_id: HashMap<usize, Uuid> =
            created.iter().enumerate().map(|(i, &id)| (i, id)).collect();
        for (objective_id, indexes) in pending_edges {
            let dependencies: Vec<Uuid> = indexes
                .iter()
                .filter_map(|index| index_to_id.get(index).copied())
                .filter(|&dep| dep != objective_id)
                .collect();
            if dependencies.is_empty() {
                continue;
            }
            if let Some(objective) = self.objective_repo.get(objective_id).await? {
                let mut requirements = objective.requirements.clone();
                requirements.dependencies = dependencies;
                self.objectives
                    .update_fields(objective_id, None, Some(requirements), None)
                    .await?;
            }
        }

        Ok(created)
    }

    /// Delete a plan. Materialized objectives survive with their plan
    /// linkage replaced by a tombstone.
    pub async fn delete(&self, plan_id: Uuid) -> Result<bool, CoreError> {
        let linked = self.objective_repo.find_by_plan(plan_id).await?;
        for mut objective in linked {
            objective.requirements.unlink_plan();
            // Straight to the repository: unlinking must work on
            // terminal objectives too.
            self.objective_repo.update(objective).await?;
        }
        Ok(self.plans.delete(plan_id).await?)
    }

    async fn transition(&self, plan_id: Uuid, to: PlanStatus) -> Result<Plan, CoreError> {
        let mut plan = self
            .plans
            .get(plan_id)
            .await?
            .ok_or_else(|| CoreError::not_found("plan", plan_id))?;
        if !plan.status.can_transition_to(to) {
            return Err(CoreError::IllegalTransition {
                entity: "plan",
                id: plan_id.to_string(),
                from: plan.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        plan.status = to;
        self.plans.update(plan.clone()).await?;
        Ok(plan)
    }
}
