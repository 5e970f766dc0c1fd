//! The orchestration engine: a phased workflow state machine.
//!
//! An orchestration runs research → plan → execute → monitor → cleanup
//! over one master objective. Research and monitor may be skipped per
//! request; plan, execute, and cleanup are mandatory. Phases advance on
//! event-bus conditions, never wall-clock polling; cleanup is best-effort
//! and runs even after a failure.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::domain::error::CoreError;
use crate::domain::models::{
    AgentStatus, ObjectiveStatus, ObjectiveType, ComplexityAssessment, Requirements,
};
use crate::domain::ports::{ComplexityAnalyzer, KnowledgeEntity, KnowledgeStore};

use super::agent_service::{AgentService, ClaudeConfig, CreateAgentRequest};
use super::dependency_waiter::{DependencyWaiter, WaitOptions};
use super::event_bus::{
    EventBus, EventFilter, EventKind, EventPayload, OrchestrationEventPhase,
    OrchestrationEventStatus, ProgressContextType,
};
use super::objective_service::{BreakdownItem, CreateObjectiveRequest, ObjectiveService};
use super::progress_tracker::{ContextKey, ProgressTracker};
use super::project_service::ProjectService;
use super::room_service::RoomService;

/// Research phase wait budget: ten minutes.
const RESEARCH_TIMEOUT_MS: u64 = 600_000;

/// Terminal orchestrations are evicted from memory after five minutes.
const EVICTION_DELAY_MS: u64 = 300_000;

/// Default monitor budget: one hour.
const MONITOR_BUDGET_MS: u64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Research,
    Plan,
    Execute,
    Monitor,
    Cleanup,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Monitor => "monitor",
            Self::Cleanup => "cleanup",
        }
    }

    /// Plan, execute, and cleanup can never be skipped.
    pub fn is_mandatory(&self) -> bool {
        matches!(self, Self::Plan | Self::Execute | Self::Cleanup)
    }

    fn event_phase(self) -> OrchestrationEventPhase {
        match self {
            Self::Research | Self::Plan => OrchestrationEventPhase::Planning,
            Self::Execute => OrchestrationEventPhase::Execution,
            Self::Monitor => OrchestrationEventPhase::Monitoring,
            Self::Cleanup => OrchestrationEventPhase::Completion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Pending,
    Skipped,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub state: PhaseState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub outputs: Value,
    pub error: Option<String>,
}

impl PhaseRecord {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            state: PhaseState::Pending,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            outputs: Value::Null,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestrationRequest {
    pub title: String,
    pub objective: String,
    pub repository_path: String,
    pub skip_research: bool,
    pub skip_monitor: bool,
    /// Monitor budget override, milliseconds.
    pub max_monitor_ms: Option<u64>,
}

/// Shared mutable state of one orchestration.
#[derive(Debug)]
pub struct OrchestrationState {
    pub id: String,
    pub repository_path: String,
    pub title: String,
    pub status: OrchestrationStatus,
    pub phases: Vec<PhaseRecord>,
    pub master_objective_id: Option<Uuid>,
    pub room_name: Option<String>,
    pub spawned_agents: Vec<Uuid>,
    /// specialist agent id → its assigned sub-objective.
    pub specialist_objectives: HashMap<Uuid, Uuid>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl OrchestrationState {
    fn phase_mut(&mut self, phase: Phase) -> &mut PhaseRecord {
        self.phases
            .iter_mut()
            .find(|record| record.phase == phase)
            .expect("phase record exists for every phase")
    }

    fn current_phase(&self) -> Phase {
        self.phases
            .iter()
            .find(|record| record.state == PhaseState::Running)
            .map_or(Phase::Cleanup, |record| record.phase)
    }
}

struct ActiveOrchestration {
    state: Arc<Mutex<OrchestrationState>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

/// Final report returned by `run`.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationReport {
    pub orchestration_id: String,
    pub success: bool,
    pub status: OrchestrationStatus,
    pub master_objective_id: Option<Uuid>,
    pub room_name: Option<String>,
    pub spawned_agents: Vec<Uuid>,
    pub duration_ms: u64,
    pub phases: Vec<PhaseRecord>,
}

pub struct Orchestrator {
    agents: Arc<AgentService>,
    objectives: Arc<ObjectiveService>,
    rooms: Arc<RoomService>,
    projects: Arc<ProjectService>,
    waiter: Arc<DependencyWaiter>,
    tracker: Arc<ProgressTracker>,
    analyzer: Arc<dyn ComplexityAnalyzer>,
    knowledge: Arc<dyn KnowledgeStore>,
    bus: Arc<EventBus>,
    /// Shared with eviction tasks.
    active: Arc<Mutex<HashMap<String, Arc<ActiveOrchestration>>>>,
    /// Eviction delay override for tests.
    eviction_delay_ms: u64,
    /// The program specialists are spawned from.
    agent_program: String,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agents: Arc<AgentService>,
        objectives: Arc<ObjectiveService>,
        rooms: Arc<RoomService>,
        projects: Arc<ProjectService>,
        waiter: Arc<DependencyWaiter>,
        tracker: Arc<ProgressTracker>,
        analyzer: Arc<dyn ComplexityAnalyzer>,
        knowledge: Arc<dyn KnowledgeStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            agents,
            objectives,
            rooms,
            projects,
            waiter,
            tracker,
            analyzer,
            knowledge,
            bus,
            active: Arc::new(Mutex::new(HashMap::new())),
            eviction_delay_ms: EVICTION_DELAY_MS,
            agent_program: "claude".to_string(),
        }
    }

    /// Override the spawned program (tests use a stub binary).
    pub fn with_agent_program(mut self, program: impl Into<String>) -> Self {
        self.agent_program = program.into();
        self
    }

    pub fn with_eviction_delay_ms(mut self, delay_ms: u64) -> Self {
        self.eviction_delay_ms = delay_ms;
        self
    }

    /// Start an orchestration in the background and return its id.
    pub async fn start(
        self: &Arc<Self>,
        request: OrchestrationRequest,
    ) -> Result<String, CoreError> {
        let handle = self.register(&request).await;
        let id = {
            let state = handle.state.lock().await;
            state.id.clone()
        };
        let this = Arc::clone(self);
        let task_id = id.clone();
        tokio::spawn(async move {
            let _ = this.drive(task_id, request).await;
        });
        Ok(id)
    }

    /// Run an orchestration to completion and return the report.
    pub async fn run(
        self: &Arc<Self>,
        request: OrchestrationRequest,
    ) -> Result<OrchestrationReport, CoreError> {
        let handle = self.register(&request).await;
        let id = {
            let state = handle.state.lock().await;
            state.id.clone()
        };
        self.drive(id, request).await
    }

    /// Cancel an orchestration: terminate every recorded agent, fail the
    /// current phase, emit the failure pair, and mark the orchestration
    /// cancelled. Idempotent.
    pub async fn cancel_orchestration(&self, orchestration_id: &str) -> Result<(), CoreError> {
        let handle = {
            let active = self.active.lock().await;
            active.get(orchestration_id).cloned()
        }
        .ok_or_else(|| CoreError::not_found("orchestration", orchestration_id))?;

        let (agents_to_stop, repository_path, phase, agent_count, totals) = {
            let mut state = handle.state.lock().await;
            if state.status.is_terminal() {
                return Ok(());
            }
            let phase = state.current_phase();
            state.phase_mut(phase).state = PhaseState::Failed;
            state.phase_mut(phase).error = Some("orchestration cancelled".to_string());
            state.status = OrchestrationStatus::Cancelled;
            state.ended_at = Some(Utc::now());
            (
                state.spawned_agents.clone(),
                state.repository_path.clone(),
                phase,
                state.spawned_agents.len(),
                (0, state.specialist_objectives.len()),
            )
        };

        let _ = handle.cancel_tx.send(true);
        for agent_id in agents_to_stop {
            if let Err(e) = self.agents.terminate(agent_id).await {
                tracing::warn!(agent = %agent_id, error = %e, "cancel: terminate failed");
            }
        }

        self.emit_update(
            orchestration_id,
            &repository_path,
            phase.event_phase(),
            OrchestrationEventStatus::Failed,
            agent_count,
            totals.0,
            totals.1,
        );
        let duration_ms = {
            let state = handle.state.lock().await;
            (Utc::now() - state.started_at).num_milliseconds().max(0) as u64
        };
        self.bus.emit(EventPayload::OrchestrationCompleted {
            orchestration_id: orchestration_id.to_string(),
            success: false,
            duration_ms,
            final_results: json!({ "cancelled": true }),
            repository_path,
        });

        self.schedule_eviction(orchestration_id.to_string());
        Ok(())
    }

    /// Ids of orchestrations still held in memory (including recently
    /// terminal ones awaiting eviction).
    pub async fn active_ids(&self) -> Vec<String> {
        self.active.lock().await.keys().cloned().collect()
    }

    /// Snapshot of an active orchestration's state.
    pub async fn status(&self, orchestration_id: &str) -> Option<OrchestrationReport> {
        let handle = {
            let active = self.active.lock().await;
            active.get(orchestration_id).cloned()
        }?;
        let state = handle.state.lock().await;
        Some(Self::report_from(&state))
    }

    async fn register(&self, request: &OrchestrationRequest) -> Arc<ActiveOrchestration> {
        let id = format!("orch_{}", Uuid::now_v7().simple());
        let mut phases = Vec::new();
        for phase in [
            Phase::Research,
            Phase::Plan,
            Phase::Execute,
            Phase::Monitor,
            Phase::Cleanup,
        ] {
            let mut record = PhaseRecord::new(phase);
            let skip = (phase == Phase::Research && request.skip_research)
                || (phase == Phase::Monitor && request.skip_monitor);
            if skip && !phase.is_mandatory() {
                record.state = PhaseState::Skipped;
            }
            phases.push(record);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = Arc::new(ActiveOrchestration {
            state: Arc::new(Mutex::new(OrchestrationState {
                id: id.clone(),
                repository_path: request.repository_path.clone(),
                title: request.title.clone(),
                status: OrchestrationStatus::Pending,
                phases,
                master_objective_id: None,
                room_name: None,
                spawned_agents: Vec::new(),
                specialist_objectives: HashMap::new(),
                started_at: Utc::now(),
                ended_at: None,
            })),
            cancel_tx,
            cancel_rx,
        });

        self.active.lock().await.insert(id, Arc::clone(&handle));
        handle
    }

    /// The phase driver. Runs every non-skipped phase in order; a failure
    /// stops the pipeline but cleanup still runs.
    async fn drive(
        self: &Arc<Self>,
        id: String,
        request: OrchestrationRequest,
    ) -> Result<OrchestrationReport, CoreError> {
        let handle = {
            let active = self.active.lock().await;
            active
                .get(&id)
                .cloned()
                .ok_or_else(|| CoreError::not_found("orchestration", &id))?
        };

        {
            let mut state = handle.state.lock().await;
            state.status = OrchestrationStatus::Running;
        }

        // Workspace registration and coordination room precede the phases.
        let setup = self.setup(&id, &request, &handle).await;
        let analysis = match setup {
            Ok(analysis) => analysis,
            Err(e) => {
                return self.finish_failed(&id, &handle, &request, e).await;
            }
        };

        let mut failure: Option<CoreError> = None;
        for phase in [Phase::Research, Phase::Plan, Phase::Execute, Phase::Monitor] {
            if self.cancelled(&handle).await {
                break;
            }
            let skipped = {
                let state = handle.state.lock().await;
                state
                    .phases
                    .iter()
                    .any(|r| r.phase == phase && r.state == PhaseState::Skipped)
            };
            if skipped {
                continue;
            }

            self.begin_phase(&id, &handle, &request, phase).await;
            let outcome = match phase {
                Phase::Research => self.research_phase(&id, &request, &handle, &analysis).await,
                Phase::Plan => self.plan_phase(&id, &request, &handle, &analysis).await,
                Phase::Execute => self.execute_phase(&id, &request, &handle, &analysis).await,
                Phase::Monitor => self.monitor_phase(&id, &request, &handle).await,
                Phase::Cleanup => unreachable!("cleanup runs after the loop"),
            };

            if self.cancelled(&handle).await {
                // Cancellation already recorded the phase failure and
                // emitted the terminal pair.
                break;
            }
            match outcome {
                Ok(outputs) => self.end_phase(&id, &handle, &request, phase, outputs).await,
                Err(e) => {
                    self.fail_phase(&id, &handle, &request, phase, &e).await;
                    failure = Some(e);
                    break;
                }
            }
        }

        // Cleanup is best-effort and runs regardless of the outcome.
        if !self.cancelled(&handle).await {
            self.begin_phase(&id, &handle, &request, Phase::Cleanup).await;
            match self.cleanup_phase(&id, &request, &handle, failure.as_ref()).await {
                Ok(outputs) => {
                    self.end_phase(&id, &handle, &request, Phase::Cleanup, outputs)
                        .await;
                }
                Err(e) => {
                    tracing::warn!(orchestration = %id, error = %e, "cleanup phase failed");
                    self.fail_phase(&id, &handle, &request, Phase::Cleanup, &e).await;
                }
            }
        }

        if self.cancelled(&handle).await {
            // Cancellation already emitted its terminal pair.
            let state = handle.state.lock().await;
            return Ok(Self::report_from(&state));
        }

        match failure {
            Some(e) => self.finish_failed(&id, &handle, &request, e).await,
            None => self.finish_completed(&id, &handle, &request).await,
        }
    }

    /// Register the project, create the coordination room, create the
    /// master objective, and run complexity analysis.
    async fn setup(
        &self,
        id: &str,
        request: &OrchestrationRequest,
        handle: &Arc<ActiveOrchestration>,
    ) -> Result<ComplexityAssessment, CoreError> {
        self.projects
            .register(&request.title, &request.repository_path)
            .await?;

        let room = self
            .rooms
            .create_orchestration_room(&request.repository_path, &request.objective)
            .await?;

        let analysis = self.analyzer.analyze(&request.objective).await?;

        let mut requirements = Requirements::new().with_orchestration(id.to_string());
        requirements.complexity = Some(analysis.clone());
        let master = self
            .objectives
            .create(CreateObjectiveRequest {
                repository_path: request.repository_path.clone(),
                objective_type: ObjectiveType::Feature,
                description: request.objective.clone(),
                priority: Some(10),
                requirements: Some(requirements),
                parent_objective_id: None,
            })
            .await?;

        let mut state = handle.state.lock().await;
        state.master_objective_id = Some(master.id);
        state.room_name = Some(room.name);
        Ok(analysis)
    }

    /// Research: one researcher agent on an analysis objective, awaited
    /// through the dependency waiter.
    async fn research_phase(
        &self,
        id: &str,
        request: &OrchestrationRequest,
        handle: &Arc<ActiveOrchestration>,
        analysis: &ComplexityAssessment,
    ) -> Result<Value, CoreError> {
        let objective = self
            .objectives
            .create(CreateObjectiveRequest {
                repository_path: request.repository_path.clone(),
                objective_type: ObjectiveType::Analysis,
                description: format!("Research phase: {}", request.objective),
                priority: Some(10),
                requirements: Some(Requirements::new().with_orchestration(id.to_string())),
                parent_objective_id: None,
            })
            .await?;

        let agent = self
            .spawn_specialist(id, request, handle, "researcher", &analysis.recommended_model)
            .await?;
        self.objectives.assign(objective.id, agent).await?;

        let result = self
            .waiter
            .wait_for_agent_dependencies(
                &[agent],
                &request.repository_path,
                WaitOptions {
                    timeout_ms: RESEARCH_TIMEOUT_MS,
                    wait_for_any_failure: true,
                    cancel: Some(handle.cancel_rx.clone()),
                },
            )
            .await?;

        if !result.success {
            let _ = self.objectives.fail(objective.id, &result.message).await;
            if result.timed_out.is_empty() {
                return Err(CoreError::ChildSpawn(format!(
                    "research agent {agent} failed: {}",
                    result.message
                )));
            }
            return Err(CoreError::Timeout {
                what: format!("research agent {agent}"),
                waited_ms: result.wait_duration_ms,
            });
        }

        // The researcher's process is gone; close out its objective.
        if let Some(current) = self.objectives.get(objective.id).await? {
            if !current.status.is_terminal() {
                self.objectives
                    .complete(objective.id, Some(json!({ "research_agent": agent })))
                    .await?;
            }
        }

        Ok(json!({
            "research_agent_id": agent,
            "research_objective_id": objective.id,
        }))
    }

    /// Plan: an architect on the master objective, plus materialized
    /// sub-objectives for each required specialization.
    async fn plan_phase(
        &self,
        id: &str,
        request: &OrchestrationRequest,
        handle: &Arc<ActiveOrchestration>,
        analysis: &ComplexityAssessment,
    ) -> Result<Value, CoreError> {
        let master_id = {
            let state = handle.state.lock().await;
            state
                .master_objective_id
                .ok_or_else(|| CoreError::not_found("objective", "master"))?
        };

        let architect = self
            .spawn_specialist(id, request, handle, "architect", &analysis.recommended_model)
            .await?;
        self.objectives.assign(master_id, architect).await?;

        let specializations: Vec<String> = analysis
            .required_specializations
            .iter()
            .filter(|s| s.as_str() != "architect")
            .cloned()
            .collect();

        let items = specializations
            .iter()
            .map(|specialization| BreakdownItem {
                description: format!("{} work for: {}", specialization, request.objective),
                objective_type: ObjectiveType::Feature,
                priority: None,
                estimated_minutes: Some(analysis.estimated_minutes.max(1)),
            })
            .collect();
        let children = self.objectives.breakdown(master_id, items).await?;

        // Stamp each child with its specialization so execute can match
        // agents to objectives.
        let mut sub_ids = Vec::with_capacity(children.len());
        for (child, specialization) in children.iter().zip(&specializations) {
            let requirements = {
                let mut r = child.requirements.clone();
                r.specialization = Some(specialization.clone());
                r.orchestration_id = Some(id.to_string());
                r
            };
            self.objectives
                .update_fields(child.id, None, Some(requirements), None)
                .await?;
            sub_ids.push(child.id);
        }

        Ok(json!({
            "planner_agent_id": architect,
            "sub_objective_ids": sub_ids,
        }))
    }

    /// Execute: one specialist per non-architect specialization, assigned
    /// its sub-objective. Does not block; monitor supervises.
    async fn execute_phase(
        &self,
        id: &str,
        request: &OrchestrationRequest,
        handle: &Arc<ActiveOrchestration>,
        analysis: &ComplexityAssessment,
    ) -> Result<Value, CoreError> {
        let master_id = {
            let state = handle.state.lock().await;
            state
                .master_objective_id
                .ok_or_else(|| CoreError::not_found("objective", "master"))?
        };

        // Sub-objectives materialized by the plan phase, keyed by their
        // specialization stamp.
        let children = {
            let mut by_specialization = HashMap::new();
            let page = self
                .objectives
                .list(&request.repository_path, None, 500, 0)
                .await?;
            for objective in page.data {
                if objective.parent_objective_id == Some(master_id) {
                    if let Some(ref specialization) = objective.requirements.specialization {
                        by_specialization.insert(specialization.clone(), objective.id);
                    }
                }
            }
            by_specialization
        };

        let mut execution_agents = Vec::new();
        for specialization in analysis
            .required_specializations
            .iter()
            .filter(|s| s.as_str() != "architect")
        {
            let agent = self
                .spawn_specialist(id, request, handle, specialization, &analysis.recommended_model)
                .await?;
            execution_agents.push(agent);

            if let Some(&objective_id) = children.get(specialization) {
                self.objectives.assign(objective_id, agent).await?;
                let mut state = handle.state.lock().await;
                state.specialist_objectives.insert(agent, objective_id);
            }
        }

        Ok(json!({ "execution_agents": execution_agents }))
    }

    /// Monitor: watch specialist objectives and agents through the bus,
    /// aggregate progress, and report at most once a second.
    async fn monitor_phase(
        &self,
        id: &str,
        request: &OrchestrationRequest,
        handle: &Arc<ActiveOrchestration>,
    ) -> Result<Value, CoreError> {
        let specialist_objectives = {
            let state = handle.state.lock().await;
            state.specialist_objectives.clone()
        };
        let total = specialist_objectives.len();
        let agent_ids: HashSet<Uuid> = specialist_objectives.keys().copied().collect();
        let objective_to_agent: HashMap<Uuid, Uuid> = specialist_objectives
            .iter()
            .map(|(&agent, &objective)| (objective, agent))
            .collect();

        let (subscription, mut rx) = self.bus.subscribe_many(
            &[
                EventKind::ObjectiveCompleted,
                EventKind::ObjectiveUpdate,
                EventKind::AgentTerminated,
                EventKind::AgentStatusChange,
            ],
            Some(EventFilter::for_repository(&request.repository_path)),
        )?;

        let mut progress: HashMap<Uuid, f64> = agent_ids.iter().map(|&a| (a, 0.0)).collect();
        let mut live_agents = agent_ids.clone();
        let mut terminal_objectives: HashSet<Uuid> = HashSet::new();
        let mut completed_objectives: HashSet<Uuid> = HashSet::new();

        // Catch up with anything that settled before we subscribed; the
        // store write precedes every terminal emit, so subscribe-then-scan
        // observes each transition at least once.
        self.monitor_catchup(
            &specialist_objectives,
            &mut progress,
            &mut live_agents,
            &mut terminal_objectives,
            &mut completed_objectives,
        )
        .await?;

        let budget_ms = request.max_monitor_ms.unwrap_or(MONITOR_BUDGET_MS);
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_millis(budget_ms);
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cancel_rx = handle.cancel_rx.clone();

        let key = ContextKey::new(
            id.to_string(),
            ProgressContextType::Orchestration,
            request.repository_path.clone(),
        );

        while terminal_objectives.len() < total {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match event.payload {
                        EventPayload::ObjectiveUpdate {
                            objective_id,
                            assigned_agent_id,
                            progress_percentage,
                            new_status,
                            ..
                        } => {
                            if let Some(agent) = objective_to_agent.get(&objective_id) {
                                if let Some(pct) = progress_percentage {
                                    let entry = progress.entry(*agent).or_insert(0.0);
                                    *entry = entry.max(f64::from(pct));
                                }
                                if new_status == ObjectiveStatus::Failed {
                                    terminal_objectives.insert(objective_id);
                                    live_agents.remove(agent);
                                }
                            } else if let Some(agent) = assigned_agent_id {
                                if agent_ids.contains(&agent) {
                                    if let Some(pct) = progress_percentage {
                                        let entry = progress.entry(agent).or_insert(0.0);
                                        *entry = entry.max(f64::from(pct));
                                    }
                                }
                            }
                        }
                        EventPayload::ObjectiveCompleted { objective_id, .. } => {
                            if let Some(agent) = objective_to_agent.get(&objective_id) {
                                terminal_objectives.insert(objective_id);
                                completed_objectives.insert(objective_id);
                                progress.insert(*agent, 100.0);
                                live_agents.remove(agent);
                            }
                        }
                        EventPayload::AgentTerminated { agent_id, final_status, reason, .. } => {
                            if agent_ids.contains(&agent_id) {
                                live_agents.remove(&agent_id);
                                if let Some(&objective_id) =
                                    specialist_objectives.get(&agent_id)
                                {
                                    // Close the loop for agents that never
                                    // reported completion themselves.
                                    if !terminal_objectives.contains(&objective_id) {
                                        if final_status == AgentStatus::Completed {
                                            let _ = self
                                                .objectives
                                                .complete(objective_id, None)
                                                .await;
                                        } else {
                                            let why = reason
                                                .unwrap_or_else(|| "agent exited".to_string());
                                            let _ = self
                                                .objectives
                                                .fail(objective_id, &why)
                                                .await;
                                        }
                                    }
                                }
                            }
                        }
                        EventPayload::AgentStatusChange { agent_id, new_status, .. } => {
                            if agent_ids.contains(&agent_id) && new_status.is_terminal() {
                                live_agents.remove(&agent_id);
                                if let Some(&objective_id) =
                                    specialist_objectives.get(&agent_id)
                                {
                                    if !terminal_objectives.contains(&objective_id) {
                                        if new_status == AgentStatus::Completed {
                                            let _ = self
                                                .objectives
                                                .complete(objective_id, None)
                                                .await;
                                        } else {
                                            let _ = self
                                                .objectives
                                                .fail(objective_id, "agent exited")
                                                .await;
                                        }
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                }
                _ = ticker.tick() => {
                    // The tick doubles as a consistency re-scan so a
                    // transition that raced the subscription can never
                    // stall the monitor.
                    self.monitor_catchup(
                        &specialist_objectives,
                        &mut progress,
                        &mut live_agents,
                        &mut terminal_objectives,
                        &mut completed_objectives,
                    )
                    .await?;
                    let value = compute_progress(
                        &progress,
                        live_agents.len(),
                        completed_objectives.len(),
                        total,
                    );
                    self.tracker
                        .report_context_progress(&key, None, value, None)
                        .await;
                    self.emit_update(
                        id,
                        &request.repository_path,
                        OrchestrationEventPhase::Monitoring,
                        OrchestrationEventStatus::InProgress,
                        agent_ids.len(),
                        completed_objectives.len(),
                        total,
                    );
                }
                () = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(orchestration = %id, "monitor budget exhausted");
                    break;
                }
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.bus.unsubscribe(subscription);

        let value = compute_progress(
            &progress,
            live_agents.len(),
            completed_objectives.len(),
            total,
        );
        self.tracker
            .report_context_progress(&key, None, value, None)
            .await;

        Ok(json!({
            "total_objectives": total,
            "completed_objectives": completed_objectives.len(),
            "failed_objectives": terminal_objectives.len() - completed_objectives.len(),
        }))
    }

    /// Reconcile monitor bookkeeping against the store: settle specialist
    /// objectives whose agent already reached a terminal state, and adopt
    /// any objective transitions that happened outside the subscription.
    async fn monitor_catchup(
        &self,
        specialist_objectives: &HashMap<Uuid, Uuid>,
        progress: &mut HashMap<Uuid, f64>,
        live_agents: &mut HashSet<Uuid>,
        terminal_objectives: &mut HashSet<Uuid>,
        completed_objectives: &mut HashSet<Uuid>,
    ) -> Result<(), CoreError> {
        for (&agent, &objective_id) in specialist_objectives {
            if terminal_objectives.contains(&objective_id) {
                continue;
            }

            if let Some(objective) = self.objectives.get(objective_id).await? {
                if let Some(pct) = objective.progress_percentage {
                    let entry = progress.entry(agent).or_insert(0.0);
                    *entry = entry.max(f64::from(pct));
                }
                if objective.status.is_terminal() {
                    terminal_objectives.insert(objective_id);
                    live_agents.remove(&agent);
                    if objective.status == ObjectiveStatus::Completed {
                        completed_objectives.insert(objective_id);
                        progress.insert(agent, 100.0);
                    }
                    continue;
                }
            }

            let agent_record = self.agents.get(agent).await?;
            if let Some(agent_record) = agent_record {
                if agent_record.status.is_terminal() {
                    live_agents.remove(&agent);
                    let settled = if agent_record.status == AgentStatus::Completed {
                        self.objectives.complete(objective_id, None).await
                    } else {
                        self.objectives.fail(objective_id, "agent exited").await
                    };
                    match settled {
                        Ok(objective) => {
                            terminal_objectives.insert(objective_id);
                            if objective.status == ObjectiveStatus::Completed {
                                completed_objectives.insert(objective_id);
                                progress.insert(agent, 100.0);
                            }
                        }
                        Err(e) => {
                            tracing::debug!(
                                objective = %objective_id,
                                error = %e,
                                "monitor settle skipped"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Cleanup: persist a closing summary in the knowledge store. Never
    /// terminates still-active agents.
    async fn cleanup_phase(
        &self,
        id: &str,
        request: &OrchestrationRequest,
        handle: &Arc<ActiveOrchestration>,
        failure: Option<&CoreError>,
    ) -> Result<Value, CoreError> {
        let (agent_count, objective_count) = {
            let state = handle.state.lock().await;
            (state.spawned_agents.len(), state.specialist_objectives.len())
        };

        let summary = match failure {
            Some(e) => format!(
                "Orchestration {id} for {:?} failed: {e}. {agent_count} agents spawned, \
                 {objective_count} specialist objectives.",
                request.title
            ),
            None => format!(
                "Orchestration {id} for {:?} completed. {agent_count} agents spawned, \
                 {objective_count} specialist objectives.",
                request.title
            ),
        };

        self.knowledge
            .store_entity(KnowledgeEntity::new(
                request.repository_path.clone(),
                "orchestration_summary",
                request.title.clone(),
                summary,
            ))
            .await?;
        Ok(json!({ "summary_stored": true }))
    }

    async fn spawn_specialist(
        &self,
        id: &str,
        request: &OrchestrationRequest,
        handle: &Arc<ActiveOrchestration>,
        agent_type: &str,
        model: &str,
    ) -> Result<Uuid, CoreError> {
        let room_name = {
            let state = handle.state.lock().await;
            state.room_name.clone()
        };
        let room_id = match room_name {
            Some(ref name) => self
                .rooms
                .get_room(&request.repository_path, name)
                .await?
                .map(|room| room.id),
            None => None,
        };

        let prompt = format!(
            "You are the {agent_type} specialist for orchestration {id}.\n\
             Objective: {}\nCoordinate through your assigned room.",
            request.objective
        );
        let agent = self
            .agents
            .create_agent(CreateAgentRequest {
                agent_name: format!("{agent_type}-{}", &id[id.len().saturating_sub(6)..]),
                repository_path: request.repository_path.clone(),
                objective_description: request.objective.clone(),
                agent_type: Some(agent_type.to_string()),
                capabilities: vec![agent_type.to_string()],
                depends_on: vec![],
                metadata: Some(json!({ "orchestration_id": id })),
                auto_create_room: false,
                room_id,
                claude_config: ClaudeConfig {
                    prompt,
                    model: Some(model.to_string()),
                    session_id: None,
                    environment_vars: HashMap::new(),
                    program: self.agent_program.clone(),
                },
            })
            .await?;

        if let Some(ref name) = room_name {
            let _ = self
                .rooms
                .join(&request.repository_path, name, &agent.agent_name)
                .await;
        }

        let mut state = handle.state.lock().await;
        state.spawned_agents.push(agent.id);
        Ok(agent.id)
    }

    async fn begin_phase(
        &self,
        id: &str,
        handle: &Arc<ActiveOrchestration>,
        request: &OrchestrationRequest,
        phase: Phase,
    ) {
        let (agent_count, completed, total) = {
            let mut state = handle.state.lock().await;
            let record = state.phase_mut(phase);
            record.state = PhaseState::Running;
            record.started_at = Some(Utc::now());
            (
                state.spawned_agents.len(),
                0,
                state.specialist_objectives.len(),
            )
        };
        self.emit_update(
            id,
            &request.repository_path,
            phase.event_phase(),
            OrchestrationEventStatus::Started,
            agent_count,
            completed,
            total,
        );
    }

    async fn end_phase(
        &self,
        id: &str,
        handle: &Arc<ActiveOrchestration>,
        request: &OrchestrationRequest,
        phase: Phase,
        outputs: Value,
    ) {
        let (agent_count, total) = {
            let mut state = handle.state.lock().await;
            let record = state.phase_mut(phase);
            record.state = PhaseState::Completed;
            record.ended_at = Some(Utc::now());
            record.duration_ms = record
                .started_at
                .map(|s| (Utc::now() - s).num_milliseconds().max(0) as u64);
            record.outputs = outputs;
            (state.spawned_agents.len(), state.specialist_objectives.len())
        };
        self.emit_update(
            id,
            &request.repository_path,
            phase.event_phase(),
            OrchestrationEventStatus::Completed,
            agent_count,
            0,
            total,
        );
    }

    async fn fail_phase(
        &self,
        id: &str,
        handle: &Arc<ActiveOrchestration>,
        request: &OrchestrationRequest,
        phase: Phase,
        error: &CoreError,
    ) {
        let (agent_count, total) = {
            let mut state = handle.state.lock().await;
            let record = state.phase_mut(phase);
            record.state = PhaseState::Failed;
            record.ended_at = Some(Utc::now());
            record.duration_ms = record
                .started_at
                .map(|s| (Utc::now() - s).num_milliseconds().max(0) as u64);
            record.error = Some(error.to_string());
            (state.spawned_agents.len(), state.specialist_objectives.len())
        };
        self.emit_update(
            id,
            &request.repository_path,
            phase.event_phase(),
            OrchestrationEventStatus::Failed,
            agent_count,
            0,
            total,
        );
    }

    async fn finish_completed(
        &self,
        id: &str,
        handle: &Arc<ActiveOrchestration>,
        request: &OrchestrationRequest,
    ) -> Result<OrchestrationReport, CoreError> {
        let (master, agent_count, total) = {
            let mut state = handle.state.lock().await;
            state.status = OrchestrationStatus::Completed;
            state.ended_at = Some(Utc::now());
            (
                state.master_objective_id,
                state.spawned_agents.len(),
                state.specialist_objectives.len(),
            )
        };

        if let Some(master_id) = master {
            if let Some(objective) = self.objectives.get(master_id).await? {
                if !objective.status.is_terminal() {
                    let _ = self
                        .objectives
                        .complete(master_id, Some(json!({ "orchestration_id": id })))
                        .await;
                }
            }
        }

        let key = ContextKey::new(
            id.to_string(),
            ProgressContextType::Orchestration,
            request.repository_path.clone(),
        );
        self.tracker
            .report_context_progress(&key, None, 100.0, None)
            .await;
        self.emit_update(
            id,
            &request.repository_path,
            OrchestrationEventPhase::Completion,
            OrchestrationEventStatus::Completed,
            agent_count,
            total,
            total,
        );

        let report = {
            let state = handle.state.lock().await;
            Self::report_from(&state)
        };
        self.bus.emit(EventPayload::OrchestrationCompleted {
            orchestration_id: id.to_string(),
            success: true,
            duration_ms: report.duration_ms,
            final_results: json!({ "phases": report.phases }),
            repository_path: request.repository_path.clone(),
        });

        self.schedule_eviction(id.to_string());
        Ok(report)
    }

    async fn finish_failed(
        &self,
        id: &str,
        handle: &Arc<ActiveOrchestration>,
        request: &OrchestrationRequest,
        error: CoreError,
    ) -> Result<OrchestrationReport, CoreError> {
        let (agent_count, total) = {
            let mut state = handle.state.lock().await;
            state.status = OrchestrationStatus::Failed;
            state.ended_at = Some(Utc::now());
            (state.spawned_agents.len(), state.specialist_objectives.len())
        };

        self.emit_update(
            id,
            &request.repository_path,
            OrchestrationEventPhase::Completion,
            OrchestrationEventStatus::Failed,
            agent_count,
            0,
            total,
        );

        let report = {
            let state = handle.state.lock().await;
            Self::report_from(&state)
        };
        self.bus.emit(EventPayload::OrchestrationCompleted {
            orchestration_id: id.to_string(),
            success: false,
            duration_ms: report.duration_ms,
            final_results: json!({ "error": error.to_string() }),
            repository_path: request.repository_path.clone(),
        });

        self.schedule_eviction(id.to_string());
        Ok(report)
    }

    async fn cancelled(&self, handle: &Arc<ActiveOrchestration>) -> bool {
        let state = handle.state.lock().await;
        state.status == OrchestrationStatus::Cancelled
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_update(
        &self,
        id: &str,
        repository_path: &str,
        phase: OrchestrationEventPhase,
        status: OrchestrationEventStatus,
        agent_count: usize,
        completed_objectives: usize,
        total_objectives: usize,
    ) {
        self.bus.emit(EventPayload::OrchestrationUpdate {
            orchestration_id: id.to_string(),
            phase,
            status,
            agent_count,
            completed_objectives,
            total_objectives,
            repository_path: repository_path.to_string(),
            metadata: json!({}),
        });
    }

    fn report_from(state: &OrchestrationState) -> OrchestrationReport {
        let ended = state.ended_at.unwrap_or_else(Utc::now);
        OrchestrationReport {
            orchestration_id: state.id.clone(),
            success: state.status == OrchestrationStatus::Completed,
            status: state.status,
            master_objective_id: state.master_objective_id,
            room_name: state.room_name.clone(),
            spawned_agents: state.spawned_agents.clone(),
            duration_ms: (ended - state.started_at).num_milliseconds().max(0) as u64,
            phases: state.phases.clone(),
        }
    }

    fn schedule_eviction(&self, id: String) {
        let delay = self.eviction_delay_ms;
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            active.lock().await.remove(&id);
        });
    }
}

/// Orchestration progress: average of specialist reports while any
/// specialist is live, otherwise completed/total. Always clamped.
pub fn compute_progress(
    specialist_progress: &HashMap<Uuid, f64>,
    live_agents: usize,
    completed: usize,
    total: usize,
) -> f64 {
    let value = if live_agents > 0 && !specialist_progress.is_empty() {
        specialist_progress.values().sum::<f64>() / specialist_progress.len() as f64
    } else if total == 0 {
        0.0
    } else {
        100.0 * completed as f64 / total as f64
    };
    value.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mandatory_phases() {
        assert!(Phase::Plan.is_mandatory());
        assert!(Phase::Execute.is_mandatory());
        assert!(Phase::Cleanup.is_mandatory());
        assert!(!Phase::Research.is_mandatory());
        assert!(!Phase::Monitor.is_mandatory());
    }

    #[test]
    fn test_compute_progress_active_average() {
        let mut progress = HashMap::new();
        progress.insert(Uuid::now_v7(), 40.0);
        progress.insert(Uuid::now_v7(), 80.0);
        assert!((compute_progress(&progress, 2, 0, 2) - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_compute_progress_completed_ratio_when_idle() {
        let progress = HashMap::new();
        assert!((compute_progress(&progress, 0, 1, 2) - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_compute_progress_zero_objectives() {
        let progress = HashMap::new();
        assert!(compute_progress(&progress, 0, 0, 0).abs() < f64::EPSILON);
    }
}
