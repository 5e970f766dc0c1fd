//! Objective service: creation, guarded status transitions, assignment,
//! hierarchical breakdown, auto-assignment, and execution planning.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::error::CoreError;
use crate::domain::models::{Objective, ObjectiveStatus, ObjectiveType, Requirements};
use crate::domain::ports::ObjectiveRepository;

use super::dependency_graph::{critical_path, detect_cycle, topological_sort};
use super::event_bus::{EventBus, EventPayload};

/// How many pending objectives `auto_assign` hands out per call.
const AUTO_ASSIGN_BATCH: i64 = 3;

#[derive(Debug, Clone)]
pub struct CreateObjectiveRequest {
    pub repository_path: String,
    pub objective_type: ObjectiveType,
    pub description: String,
    pub priority: Option<i32>,
    pub requirements: Option<Requirements>,
    pub parent_objective_id: Option<Uuid>,
}

/// One child in a breakdown request.
#[derive(Debug, Clone)]
pub struct BreakdownItem {
    pub description: String,
    pub objective_type: ObjectiveType,
    pub priority: Option<i32>,
    pub estimated_minutes: Option<u32>,
}

/// Output of `execution_plan`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub objectives: Vec<Objective>,
    /// Stable topological order, ties broken by priority desc then age.
    pub execution_order: Vec<Uuid>,
    /// id → dependency ids, restricted to the supplied set.
    pub dependencies: HashMap<Uuid, Vec<Uuid>>,
    pub critical_path: Vec<Uuid>,
    pub estimated_duration_minutes: u64,
    pub risk_assessment: String,
}

pub struct ObjectiveService {
    objectives: Arc<dyn ObjectiveRepository>,
    bus: Arc<EventBus>,
}

impl ObjectiveService {
    pub fn new(objectives: Arc<dyn ObjectiveRepository>, bus: Arc<EventBus>) -> Self {
        Self { objectives, bus }
    }

    pub async fn create(&self, request: CreateObjectiveRequest) -> Result<Objective, CoreError> {
        let mut objective = Objective::new(
            request.repository_path.clone(),
            request.objective_type,
            request.description,
        );
        if let Some(priority) = request.priority {
            objective.priority = priority;
        }
        if let Some(requirements) = request.requirements {
            objective.requirements = requirements;
        }
        if let Some(parent_id) = request.parent_objective_id {
            // The parent must exist; a dangling parent would orphan the tree.
            self.require(parent_id).await?;
            objective.parent_objective_id = Some(parent_id);
        }

        self.ensure_acyclic(&objective).await?;
        self.objectives.insert(objective.clone()).await?;

        self.bus.emit(EventPayload::ObjectiveCreated {
            objective: objective.clone(),
            repository_path: request.repository_path,
        });
        Ok(objective)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Objective>, CoreError> {
        Ok(self.objectives.get(id).await?)
    }

    /// Assign an agent and move the objective to `in_progress`.
    pub async fn assign(&self, id: Uuid, agent_id: Uuid) -> Result<Objective, CoreError> {
        let mut objective = self.require(id).await?;
        let previous = objective.status;

        match previous {
            ObjectiveStatus::Pending => {
                objective.assigned_agent_id = Some(agent_id);
                objective.status = ObjectiveStatus::InProgress;
            }
            ObjectiveStatus::InProgress => {
                // Reassignment while running is a pending-level field update.
                objective.assigned_agent_id = Some(agent_id);
            }
            _ => return Err(self.illegal(&objective, ObjectiveStatus::InProgress)),
        }

        self.objectives.update(objective.clone()).await?;
        self.emit_update(&objective, Some(previous));
        Ok(objective)
    }

    /// Complete an in-progress objective. Sets progress to 100 and emits
    /// both `objective_update` and `objective_completed`.
    pub async fn complete(
        &self,
        id: Uuid,
        results: Option<Value>,
    ) -> Result<Objective, CoreError> {
        let mut objective = self.require(id).await?;
        let previous = objective.status;
        if !previous.can_transition_to(ObjectiveStatus::Completed) {
            return Err(self.illegal(&objective, ObjectiveStatus::Completed));
        }

        objective.status = ObjectiveStatus::Completed;
        objective.progress_percentage = Some(100);
        objective.results = results.clone();
        self.objectives.update(objective.clone()).await?;

        self.emit_update(&objective, Some(previous));
        self.bus.emit(EventPayload::ObjectiveCompleted {
            objective_id: objective.id,
            completed_by: objective.assigned_agent_id,
            results: results.unwrap_or(Value::Null),
            repository_path: objective.repository_path.clone(),
        });
        Ok(objective)
    }

    /// Fail an objective with a reason. Allowed from pending (never
    /// started) and in-progress states.
    pub async fn fail(&self, id: Uuid, reason: &str) -> Result<Objective, CoreError> {
        let mut objective = self.require(id).await?;
        let previous = objective.status;
        if !previous.can_transition_to(ObjectiveStatus::Failed) {
            return Err(self.illegal(&objective, ObjectiveStatus::Failed));
        }

        objective.status = ObjectiveStatus::Failed;
        objective.results = Some(json!({ "error": reason }));
        self.objectives.update(objective.clone()).await?;
        self.emit_update(&objective, Some(previous));
        Ok(objective)
    }

    /// Field updates that do not change status: priority, requirements,
    /// assigned agent. Rejected on terminal objectives.
    pub async fn update_fields(
        &self,
        id: Uuid,
        priority: Option<i32>,
        requirements: Option<Requirements>,
        assigned_agent_id: Option<Uuid>,
    ) -> Result<Objective, CoreError> {
        let mut objective = self.require(id).await?;
        if objective.status.is_terminal() {
            return Err(self.illegal(&objective, objective.status));
        }

        if let Some(priority) = priority {
            objective.priority = priority;
        }
        if let Some(requirements) = requirements {
            objective.requirements = requirements;
            self.ensure_acyclic(&objective).await?;
        }
        if let Some(agent_id) = assigned_agent_id {
            objective.assigned_agent_id = Some(agent_id);
        }

        self.objectives.update(objective.clone()).await?;
        self.emit_update(&objective, None);
        Ok(objective)
    }

    /// Record progress. Monotonic: a lower report leaves the stored value
    /// untouched. Emits `objective_update` either way.
    pub async fn report_progress(&self, id: Uuid, progress: u8) -> Result<Objective, CoreError> {
        let mut objective = self.require(id).await?;
        if objective.status.is_terminal() {
            return Ok(objective);
        }

        let stored = objective.progress_percentage.unwrap_or(0);
        let effective = stored.max(progress.min(100));
        objective.progress_percentage = Some(effective);
        self.objectives.update(objective.clone()).await?;
        self.emit_update(&objective, None);
        Ok(objective)
    }

    /// Delete an objective and, cascading, all of its descendants.
    pub async fn delete(&self, id: Uuid) -> Result<u64, CoreError> {
        let mut removed = 0;
        let children = self.objectives.find_children(id).await?;
        for child in children {
            removed += Box::pin(self.delete(child.id)).await?;
        }
        if self.objectives.delete(id).await? {
            removed += 1;
        }
        Ok(removed)
    }

    /// Create children under a parent, inheriting repository path and
    /// (when omitted) priority.
    pub async fn breakdown(
        &self,
        parent_id: Uuid,
        items: Vec<BreakdownItem>,
    ) -> Result<Vec<Objective>, CoreError> {
        let parent = self.require(parent_id).await?;
        let mut children = Vec::with_capacity(items.len());

        for item in items {
            let mut requirements = Requirements::new();
            requirements.orchestration_id = parent.requirements.orchestration_id.clone();
            if let Some(minutes) = item.estimated_minutes {
                requirements.complexity = Some(crate::domain::models::ComplexityAssessment {
                    level: "planned".to_string(),
                    recommended_model: String::new(),
                    required_specializations: Vec::new(),
                    estimated_minutes: minutes,
                });
            }

            let child = self
                .create(CreateObjectiveRequest {
                    repository_path: parent.repository_path.clone(),
                    objective_type: item.objective_type,
                    description: item.description,
                    priority: Some(item.priority.unwrap_or(parent.priority)),
                    requirements: Some(requirements),
                    parent_objective_id: Some(parent_id),
                })
                .await?;
            children.push(child);
        }
        Ok(children)
    }

    /// Assign up to three pending objectives to an agent, best first.
    pub async fn auto_assign(
        &self,
        repository_path: &str,
        agent_id: Uuid,
        objective_types: Option<&[ObjectiveType]>,
    ) -> Result<Vec<Objective>, CoreError> {
        let pending = self
            .objectives
            .find_pending(repository_path, objective_types, AUTO_ASSIGN_BATCH)
            .await?;

        let mut assigned = Vec::with_capacity(pending.len());
        for objective in pending {
            assigned.push(self.assign(objective.id, agent_id).await?);
        }
        Ok(assigned)
    }

    /// Build an execution plan over a set of objectives: stable
    /// topological order, dependency edges, critical path, duration and a
    /// coarse risk note. Fails with `Cycle` when the graph loops.
    pub async fn execution_plan(&self, ids: &[Uuid]) -> Result<ExecutionPlan, CoreError> {
        let mut objectives = Vec::with_capacity(ids.len());
        for &id in ids {
            objectives.push(self.require(id).await?);
        }

        let by_id: HashMap<Uuid, &Objective> = objectives.iter().map(|o| (o.id, o)).collect();
        let graph: HashMap<Uuid, Vec<Uuid>> = objectives
            .iter()
            .map(|o| {
                let deps = o
                    .dependencies()
                    .iter()
                    .copied()
                    .filter(|dep| by_id.contains_key(dep))
                    .collect();
                (o.id, deps)
            })
            .collect();

        if let Some(cycle) = detect_cycle(&graph) {
            return Err(CoreError::Cycle(cycle));
        }

        // Ties break by priority desc then created_at asc; the rank
        // tuple maps that to "lower is better".
        let rank = |id: Uuid| {
            let objective = by_id[&id];
            (-i64::from(objective.priority), objective.created_at)
        };
        let execution_order = topological_sort(&graph, rank)
            .ok_or_else(|| CoreError::Cycle(ids.to_vec()))?;

        let weight = |id: Uuid| u64::from(by_id[&id].estimated_minutes());
        let (critical, critical_minutes) = critical_path(&graph, &execution_order, weight);

        let independent = graph.values().filter(|deps| deps.is_empty()).count();
        let risk_assessment = if critical.len() > objectives.len() / 2 && objectives.len() > 2 {
            "high: most objectives are serialized on one chain".to_string()
        } else if independent == objectives.len() {
            "low: all objectives are independent".to_string()
        } else {
            "moderate: mixed dependency fan-out".to_string()
        };

        Ok(ExecutionPlan {
            objectives,
            execution_order,
            dependencies: graph,
            critical_path: critical,
            // Independent chains run in parallel; the critical path is
            // the wall-clock floor.
            estimated_duration_minutes: critical_minutes,
            risk_assessment,
        })
    }

    pub async fn list(
        &self,
        repository_path: &str,
        status: Option<ObjectiveStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<crate::domain::ports::Page<Objective>, CoreError> {
        Ok(self
            .objectives
            .list(repository_path, status, limit, offset)
            .await?)
    }

    async fn require(&self, id: Uuid) -> Result<Objective, CoreError> {
        self.objectives
            .get(id)
            .await?
            .ok_or_else(|| CoreError::not_found("objective", id))
    }

    /// Reject a dependency set that would close a cycle through the
    /// stored graph.
    async fn ensure_acyclic(&self, objective: &Objective) -> Result<(), CoreError> {
        if objective.dependencies().is_empty() {
            return Ok(());
        }
        if objective.dependencies().contains(&objective.id) {
            return Err(CoreError::Cycle(vec![objective.id]));
        }

        // Walk the dependency closure reachable from this objective.
        let mut graph: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        graph.insert(objective.id, objective.dependencies().to_vec());
        let mut frontier: Vec<Uuid> = objective.dependencies().to_vec();
        while let Some(id) = frontier.pop() {
            if graph.contains_key(&id) {
                continue;
            }
            let deps = match self.objectives.get(id).await? {
                Some(dep) => dep.dependencies().to_vec(),
                None => Vec::new(),
            };
            frontier.extend(deps.iter().copied());
            graph.insert(id, deps);
        }

        if let Some(cycle) = detect_cycle(&graph) {
            return Err(CoreError::Cycle(cycle));
        }
        Ok(())
    }

    fn illegal(&self, objective: &Objective, to: ObjectiveStatus) -> CoreError {
        CoreError::IllegalTransition {
            entity: "objective",
            id: objective.id.to_string(),
            from: objective.status.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }

    fn emit_update(&self, objective: &Objective, previous_status: Option<ObjectiveStatus>) {
        self.bus.emit(EventPayload::ObjectiveUpdate {
            objective_id: objective.id,
            previous_status,
            new_status: objective.status,
            assigned_agent_id: objective.assigned_agent_id,
            progress_percentage: objective.progress_percentage,
            repository_path: objective.repository_path.clone(),
            metadata: json!({}),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::{DatabaseConnection, ObjectiveRepositoryImpl};
    use crate::services::event_bus::EventKind;

    async fn setup() -> (ObjectiveService, Arc<EventBus>) {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let bus = Arc::new(EventBus::new());
        let service = ObjectiveService::new(
            Arc::new(ObjectiveRepositoryImpl::new(db.pool().clone())),
            Arc::clone(&bus),
        );
        (service, bus)
    }

    fn request(description: &str) -> CreateObjectiveRequest {
        CreateObjectiveRequest {
            repository_path: "/r".to_string(),
            objective_type: ObjectiveType::Feature,
            description: description.to_string(),
            priority: None,
            requirements: None,
            parent_objective_id: None,
        }
    }

    #[tokio::test]
    async fn test_lifecycle_happy_path() {
        let (service, bus) = setup().await;
        let (_id, mut completed_rx) =
            bus.subscribe(EventKind::ObjectiveCompleted, None).unwrap();

        let objective = service.create(request("do it")).await.unwrap();
        let agent = Uuid::now_v7();
        let assigned = service.assign(objective.id, agent).await.unwrap();
        assert_eq!(assigned.status, ObjectiveStatus::InProgress);

        let done = service
            .complete(objective.id, Some(json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(done.status, ObjectiveStatus::Completed);
        assert_eq!(done.progress_percentage, Some(100));

        let event = completed_rx.recv().await.unwrap();
        match event.payload {
            EventPayload::ObjectiveCompleted {
                objective_id,
                completed_by,
                ..
            } => {
                assert_eq!(objective_id, objective.id);
                assert_eq!(completed_by, Some(agent));
            }
            _ => panic!("wrong payload"),
        }
    }

    #[tokio::test]
    async fn test_pending_cannot_complete_directly() {
        let (service, _bus) = setup().await;
        let objective = service.create(request("x")).await.unwrap();
        let err = service.complete(objective.id, None).await.unwrap_err();
        assert_eq!(err.kind(), "illegal_transition");
    }

    #[tokio::test]
    async fn test_terminal_transitions_rejected() {
        let (service, _bus) = setup().await;
        let objective = service.create(request("x")).await.unwrap();
        service.assign(objective.id, Uuid::now_v7()).await.unwrap();
        service.complete(objective.id, None).await.unwrap();

        assert_eq!(
            service.fail(objective.id, "too late").await.unwrap_err().kind(),
            "illegal_transition"
        );
        assert_eq!(
            service
                .update_fields(objective.id, Some(9), None, None)
                .await
                .unwrap_err()
                .kind(),
            "illegal_transition"
        );
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let (service, _bus) = setup().await;
        let objective = service.create(request("x")).await.unwrap();
        service.assign(objective.id, Uuid::now_v7()).await.unwrap();

        service.report_progress(objective.id, 40).await.unwrap();
        let after_lower = service.report_progress(objective.id, 30).await.unwrap();
        assert_eq!(after_lower.progress_percentage, Some(40));

        let after_higher = service.report_progress(objective.id, 55).await.unwrap();
        assert_eq!(after_higher.progress_percentage, Some(55));
    }

    #[tokio::test]
    async fn test_dependency_cycle_rejected() {
        let (service, _bus) = setup().await;
        let a = service.create(request("a")).await.unwrap();
        let mut req_b = request("b");
        req_b.requirements = Some(Requirements::new().with_dependencies(vec![a.id]));
        let b = service.create(req_b).await.unwrap();

        // a -> b would close the loop b -> a
        let err = service
            .update_fields(
                a.id,
                None,
                Some(Requirements::new().with_dependencies(vec![b.id])),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cycle");
    }

    #[tokio::test]
    async fn test_breakdown_inherits_path_and_priority() {
        let (service, _bus) = setup().await;
        let mut parent_request = request("parent");
        parent_request.priority = Some(8);
        let parent = service.create(parent_request).await.unwrap();

        let children = service
            .breakdown(
                parent.id,
                vec![
                    BreakdownItem {
                        description: "child one".to_string(),
                        objective_type: ObjectiveType::Analysis,
                        priority: None,
                        estimated_minutes: Some(30),
                    },
                    BreakdownItem {
                        description: "child two".to_string(),
                        objective_type: ObjectiveType::Testing,
                        priority: Some(2),
                        estimated_minutes: None,
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(children.len(), 2);
        assert_eq!(children[0].parent_objective_id, Some(parent.id));
        assert_eq!(children[0].repository_path, "/r");
        assert_eq!(children[0].priority, 8, "inherits parent priority");
        assert_eq!(children[1].priority, 2, "explicit priority wins");
    }

    #[tokio::test]
    async fn test_delete_cascades_to_descendants() {
        let (service, _bus) = setup().await;
        let parent = service.create(request("parent")).await.unwrap();
        let children = service
            .breakdown(
                parent.id,
                vec![BreakdownItem {
                    description: "child".to_string(),
                    objective_type: ObjectiveType::Feature,
                    priority: None,
                    estimated_minutes: None,
                }],
            )
            .await
            .unwrap();
        let grandchildren = service
            .breakdown(
                children[0].id,
                vec![BreakdownItem {
                    description: "grandchild".to_string(),
                    objective_type: ObjectiveType::Feature,
                    priority: None,
                    estimated_minutes: None,
                }],
            )
            .await
            .unwrap();

        let removed = service.delete(parent.id).await.unwrap();
        assert_eq!(removed, 3);
        assert!(service.get(grandchildren[0].id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auto_assign_caps_at_three_best_first() {
        let (service, _bus) = setup().await;
        for (name, priority) in [("p1", 1), ("p9", 9), ("p5", 5), ("p7", 7)] {
            let mut r = request(name);
            r.priority = Some(priority);
            service.create(r).await.unwrap();
        }

        let agent = Uuid::now_v7();
        let assigned = service.auto_assign("/r", agent, None).await.unwrap();
        assert_eq!(assigned.len(), 3);
        let names: Vec<&str> = assigned.iter().map(|o| o.description.as_str()).collect();
        assert_eq!(names, vec!["p9", "p7", "p5"]);
        for objective in &assigned {
            assert_eq!(objective.status, ObjectiveStatus::InProgress);
            assert_eq!(objective.assigned_agent_id, Some(agent));
        }
    }

    #[tokio::test]
    async fn test_execution_plan_orders_and_detects_cycles() {
        let (service, _bus) = setup().await;
        let a = service.create(request("a")).await.unwrap();
        let mut req_b = request("b");
        req_b.requirements = Some(Requirements::new().with_dependencies(vec![a.id]));
        let b = service.create(req_b).await.unwrap();
        let mut req_c = request("c");
        req_c.requirements = Some(Requirements::new().with_dependencies(vec![b.id]));
        let c = service.create(req_c).await.unwrap();

        let plan = service.execution_plan(&[c.id, a.id, b.id]).await.unwrap();
        assert_eq!(plan.execution_order, vec![a.id, b.id, c.id]);
        assert_eq!(plan.critical_path, vec![a.id, b.id, c.id]);
        assert_eq!(plan.estimated_duration_minutes, 180);
    }
}
