//! Agent lifecycle: create → active → completed/terminated/failed,
//! liveness reconciliation against the OS pid, session continuation, and
//! the stale-agent / stale-room cleanup policies.

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::error::CoreError;
use crate::domain::models::{Agent, AgentStatus, MessageType, ParticipantStatus};
use crate::domain::ports::{
    AgentFilter, AgentRepository, Page, ProcessControl, ProcessSignal, RoomRepository, SpawnSpec,
};
use crate::infrastructure::process::process_title;

use super::dependency_graph::detect_cycle;
use super::event_bus::{EventBus, EventPayload};
use super::room_service::{CreateRoomRequest, RoomService};

/// Grace period between SIGTERM and SIGKILL on termination.
const TERMINATE_GRACE_SECS: u64 = 5;

/// Reconciliation must observe every non-terminal agent at least this
/// often.
pub const RECONCILE_INTERVAL_SECS: u64 = 10;

/// Spawn parameters for the agent's child process.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClaudeConfig {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub environment_vars: HashMap<String, String>,
    /// Executable to spawn; the runtime only cares about lifecycle.
    #[serde(default = "default_program")]
    pub program: String,
}

fn default_program() -> String {
    "claude".to_string()
}

#[derive(Debug, Clone)]
pub struct CreateAgentRequest {
    pub agent_name: String,
    pub repository_path: String,
    pub objective_description: String,
    pub agent_type: Option<String>,
    pub capabilities: Vec<String>,
    pub depends_on: Vec<Uuid>,
    pub metadata: Option<Value>,
    pub auto_create_room: bool,
    pub room_id: Option<Uuid>,
    pub claude_config: ClaudeConfig,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AgentCleanupSummary {
    pub examined: usize,
    pub terminated_agents: usize,
    pub rooms_closed: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RoomCleanupSummary {
    pub examined: usize,
    pub rooms_closed: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ComprehensiveCleanupSummary {
    pub agents: AgentCleanupSummary,
    pub rooms: RoomCleanupSummary,
}

#[derive(Debug, Clone)]
pub struct StaleAgentOptions {
    pub stale_minutes: i64,
    pub dry_run: bool,
    pub include_room_cleanup: bool,
    pub notify_participants: bool,
}

#[derive(Debug, Clone)]
pub struct StaleRoomOptions {
    pub inactive_minutes: i64,
    pub dry_run: bool,
    pub notify_participants: bool,
    pub delete_empty_rooms: bool,
    pub delete_no_active_participants: bool,
    pub delete_no_recent_messages: bool,
}

pub struct AgentService {
    agents: Arc<dyn AgentRepository>,
    rooms: Arc<dyn RoomRepository>,
    room_service: Arc<RoomService>,
    process: Arc<dyn ProcessControl>,
    bus: Arc<EventBus>,
}

impl AgentService {
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        rooms: Arc<dyn RoomRepository>,
        room_service: Arc<RoomService>,
        process: Arc<dyn ProcessControl>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            agents,
            rooms,
            room_service,
            process,
            bus,
        }
    }

    /// Create and spawn an agent. The record is persisted as
    /// `initializing` first so a spawn failure leaves an auditable row in
    /// `failed`.
    pub async fn create_agent(&self, request: CreateAgentRequest) -> Result<Agent, CoreError> {
        self.validate_dependencies(&request.depends_on, None).await?;

        let mut agent = Agent::new(request.agent_name.clone(), request.repository_path.clone());
        agent.agent_type = request.agent_type.clone();
        agent.capabilities = request.capabilities.clone();
        agent.depends_on = request.depends_on.clone();
        agent.convo_session_id = request.claude_config.session_id.clone();

        let mut metadata = match request.metadata {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        metadata.insert(
            "objective_description".to_string(),
            Value::String(request.objective_description.clone()),
        );
        // The spawn config is stored so a session can be re-opened later.
        metadata.insert(
            "claude_config".to_string(),
            serde_json::to_value(&request.claude_config)
                .map_err(|e| CoreError::InvalidRequest(e.to_string()))?,
        );
        agent.agent_metadata = Value::Object(metadata);

        if let Some(room_id) = request.room_id {
            agent.room_id = Some(room_id);
        } else if request.auto_create_room {
            let room = self
                .room_service
                .create_room(CreateRoomRequest {
                    name: format!("agent-{}", request.agent_name),
                    description: format!("Coordination room for agent {}", request.agent_name),
                    repository_path: request.repository_path.clone(),
                    metadata: None,
                })
                .await;
            match room {
                Ok(room) => agent.room_id = Some(room.id),
                Err(CoreError::AlreadyExists(_)) => {
                    agent.room_id = self
                        .room_service
                        .get_room(
                            &request.repository_path,
                            &format!("agent-{}", request.agent_name),
                        )
                        .await?
                        .map(|r| r.id);
                }
                Err(e) => return Err(e),
            }
        }

        self.agents.insert(agent.clone()).await?;
        self.spawn_for(&mut agent, &request.claude_config, None).await?;
        Ok(agent)
    }

    /// Move an agent to `terminated`, delivering SIGTERM and escalating
    /// to SIGKILL after a five second grace period. Idempotent on
    /// terminal agents.
    pub async fn terminate(&self, agent_id: Uuid) -> Result<Agent, CoreError> {
        let mut agent = self.require(agent_id).await?;
        if agent.status.is_terminal() {
            return Ok(agent);
        }

        let previous = agent.status;
        agent.status = AgentStatus::Terminated;
        agent.updated_at = Utc::now();
        self.agents.update(agent.clone()).await?;

        if let Some(pid) = agent.claude_pid {
            self.process.signal(pid, ProcessSignal::Terminate);
            let process = Arc::clone(&self.process);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(TERMINATE_GRACE_SECS)).await;
                if process.is_alive(pid) {
                    tracing::warn!(pid, "agent outlived SIGTERM grace, escalating to SIGKILL");
                    process.signal(pid, ProcessSignal::Kill);
                }
            });
        }

        self.emit_status_change(&agent, previous);
        self.bus.emit(EventPayload::AgentTerminated {
            agent_id: agent.id,
            final_status: AgentStatus::Terminated,
            reason: Some("terminated by request".to_string()),
            repository_path: agent.repository_path.clone(),
        });
        Ok(agent)
    }

    /// Re-open an agent in a terminal or idle state: respawn the child
    /// with the stored conversation session and return to `active`.
    pub async fn continue_agent_session(
        &self,
        agent_id: Uuid,
        additional_instructions: Option<&str>,
        new_objective_description: Option<&str>,
        preserve_context: bool,
        update_metadata: Option<Value>,
    ) -> Result<Agent, CoreError> {
        let mut agent = self.require(agent_id).await?;
        if agent.status == AgentStatus::Active || agent.status == AgentStatus::Initializing {
            return Err(CoreError::IllegalTransition {
                entity: "agent",
                id: agent_id.to_string(),
                from: agent.status.as_str().to_string(),
                to: AgentStatus::Active.as_str().to_string(),
            });
        }

        let mut config = self.stored_claude_config(&agent)?;
        if let Some(objective) = new_objective_description {
            config.prompt = objective.to_string();
        }
        if let Some(extra) = additional_instructions {
            config.prompt = format!("{}\n\n{extra}", config.prompt);
        }
        config.session_id = if preserve_context {
            agent.convo_session_id.clone()
        } else {
            None
        };

        if let Some(Value::Object(update)) = update_metadata {
            if let Value::Object(ref mut existing) = agent.agent_metadata {
                for (key, value) in update {
                    existing.insert(key, value);
                }
            }
        }

        // Terminal statuses are sticky for external transitions; resuming
        // is the one sanctioned path back, and it goes through a fresh
        // spawn. Reset to initializing so activation can land.
        agent.status = AgentStatus::Initializing;
        agent.claude_pid = None;
        agent.updated_at = Utc::now();
        self.agents.update(agent.clone()).await?;

        self.spawn_for(&mut agent, &config, Some(&config.prompt)).await?;
        self.bus.emit(EventPayload::AgentResumed {
            agent_id: agent.id,
            repository_path: agent.repository_path.clone(),
        });
        Ok(agent)
    }

    pub async fn heartbeat(&self, agent_id: Uuid) -> Result<(), CoreError> {
        Ok(self.agents.update_heartbeat(agent_id).await?)
    }

    pub async fn get(&self, agent_id: Uuid) -> Result<Option<Agent>, CoreError> {
        Ok(self.agents.get(agent_id).await?)
    }

    /// Ordered by `last_heartbeat` descending.
    pub async fn list_agents(&self, filter: AgentFilter) -> Result<Page<Agent>, CoreError> {
        Ok(self.agents.list(filter).await?)
    }

    /// One reconciliation pass: any active/idle agent whose pid is gone
    /// transitions to `terminated`. Returns how many were corrected.
    pub async fn reconcile_once(&self) -> Result<usize, CoreError> {
        let mut corrected = 0;
        for mut agent in self.agents.find_non_terminal().await? {
            let Some(pid) = agent.claude_pid else {
                continue;
            };
            if matches!(agent.status, AgentStatus::Active | AgentStatus::Idle)
                && !self.process.is_alive(pid)
            {
                let previous = agent.status;
                agent.status = AgentStatus::Terminated;
                agent.updated_at = Utc::now();
                self.agents.update(agent.clone()).await?;

                self.emit_status_change(&agent, previous);
                self.bus.emit(EventPayload::AgentTerminated {
                    agent_id: agent.id,
                    final_status: AgentStatus::Terminated,
                    reason: Some("process exit observed".to_string()),
                    repository_path: agent.repository_path.clone(),
                });
                corrected += 1;
            }
        }
        Ok(corrected)
    }

    /// Keep the store honest against supervisor exit reports: when a
    /// child exits, persist the final status, then emit
    /// `agent_status_change`. The write-before-emit order means any
    /// subscriber that snapshots the store after subscribing can never
    /// miss a terminal transition.
    pub fn spawn_exit_listener(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let subscription = self
            .bus
            .subscribe(super::event_bus::EventKind::AgentTerminated, None);
        tokio::spawn(async move {
            let Ok((_id, mut rx)) = subscription else {
                return;
            };
            while let Some(event) = rx.recv().await {
                let EventPayload::AgentTerminated {
                    agent_id,
                    final_status,
                    ..
                } = event.payload
                else {
                    continue;
                };
                match self.agents.get(agent_id).await {
                    Ok(Some(mut agent)) if !agent.status.is_terminal() => {
                        let previous = agent.status;
                        agent.status = final_status;
                        agent.updated_at = Utc::now();
                        if let Err(e) = self.agents.update(agent.clone()).await {
                            tracing::warn!(agent = %agent_id, error = %e, "exit record failed");
                            continue;
                        }
                        self.emit_status_change(&agent, previous);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(agent = %agent_id, error = %e, "exit listener read failed");
                    }
                }
            }
        })
    }

    /// Run reconciliation forever on the contract interval.
    pub fn spawn_reconciler(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(RECONCILE_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.reconcile_once().await {
                    Ok(0) => {}
                    Ok(corrected) => {
                        tracing::info!(corrected, "reconciliation corrected dead agents");
                    }
                    Err(e) => tracing::warn!(error = %e, "reconciliation pass failed"),
                }
            }
        })
    }

    /// Terminate agents whose heartbeat is older than the threshold,
    /// optionally closing their rooms with a notification.
    pub async fn cleanup_stale_agents(
        &self,
        options: StaleAgentOptions,
    ) -> Result<AgentCleanupSummary, CoreError> {
        let cutoff = Utc::now() - Duration::minutes(options.stale_minutes);
        let stale = self.agents.find_stale(cutoff).await?;

        let mut summary = AgentCleanupSummary {
            examined: stale.len(),
            dry_run: options.dry_run,
            ..AgentCleanupSummary::default()
        };

        for agent in stale {
            if options.dry_run {
                summary.terminated_agents += 1;
                continue;
            }

            self.terminate(agent.id).await?;
            summary.terminated_agents += 1;

            if options.include_room_cleanup {
                if let Some(room_id) = agent.room_id {
                    if let Some(room) = self.rooms.get(room_id).await? {
                        let reason = options.notify_participants.then(|| {
                            format!(
                                "Agent {} was cleaned up after {} minutes without a heartbeat",
                                agent.agent_name, options.stale_minutes
                            )
                        });
                        self.room_service
                            .close_room(&room.repository_path, &room.name, reason.as_deref())
                            .await?;
                        summary.rooms_closed += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Close rooms that qualify under the enabled predicates.
    pub async fn cleanup_stale_rooms(
        &self,
        options: StaleRoomOptions,
    ) -> Result<RoomCleanupSummary, CoreError> {
        let rooms = self.rooms.list_all().await?;
        let mut summary = RoomCleanupSummary {
            examined: rooms.len(),
            dry_run: options.dry_run,
            ..RoomCleanupSummary::default()
        };
        let message_cutoff = Utc::now() - Duration::minutes(options.inactive_minutes);

        for room in rooms {
            if room.is_closed {
                continue;
            }

            let mut qualifies = false;
            if options.delete_empty_rooms {
                let messages = self.rooms.list_messages(room.id, Some(1)).await?;
                qualifies |= messages.is_empty();
            }
            if !qualifies && options.delete_no_active_participants {
                let participants = self.rooms.list_participants(room.id).await?;
                qualifies |= !participants
                    .iter()
                    .any(|p| p.status == ParticipantStatus::Active);
            }
            if !qualifies && options.delete_no_recent_messages {
                let last = self.rooms.last_message_at(room.id).await?;
                qualifies |= last.is_none_or(|ts| ts < message_cutoff);
            }

            if !qualifies {
                continue;
            }
            if options.dry_run {
                summary.rooms_closed += 1;
                continue;
            }

            let reason = options
                .notify_participants
                .then(|| "Room closed by inactivity cleanup".to_string());
            self.room_service
                .close_room(&room.repository_path, &room.name, reason.as_deref())
                .await?;
            summary.rooms_closed += 1;
        }
        Ok(summary)
    }

    pub async fn run_comprehensive_cleanup(
        &self,
        agent_options: StaleAgentOptions,
        room_options: StaleRoomOptions,
    ) -> Result<ComprehensiveCleanupSummary, CoreError> {
        let agents = self.cleanup_stale_agents(agent_options).await?;
        let rooms = self.cleanup_stale_rooms(room_options).await?;
        Ok(ComprehensiveCleanupSummary { agents, rooms })
    }

    /// Send a status message into the agent's room, if it has one.
    pub async fn post_status(&self, agent: &Agent, body: &str) -> Result<(), CoreError> {
        let Some(room_id) = agent.room_id else {
            return Ok(());
        };
        let Some(room) = self.rooms.get(room_id).await? else {
            return Ok(());
        };
        self.room_service
            .send_message(
                &room.repository_path,
                &room.name,
                &agent.agent_name,
                body,
                MessageType::Status,
            )
            .await?;
        Ok(())
    }

    async fn spawn_for(
        &self,
        agent: &mut Agent,
        config: &ClaudeConfig,
        prompt_override: Option<&str>,
    ) -> Result<(), CoreError> {
        let project = agent
            .repository_path
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or("project");
        let title = process_title(agent.agent_type.as_deref(), project, agent.id);

        let mut args = vec![
            "-p".to_string(),
            prompt_override.unwrap_or(&config.prompt).to_string(),
        ];
        if let Some(ref model) = config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(ref session_id) = config.session_id {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }

        let mut env = config.environment_vars.clone();
        env.insert(
            "ZMCP_AGENT_TYPE".to_string(),
            agent.agent_type.clone().unwrap_or_default(),
        );
        env.insert("ZMCP_AGENT_ID".to_string(), agent.id.to_string());
        env.insert(
            "ZMCP_PROJECT_CONTEXT".to_string(),
            agent.repository_path.clone(),
        );
        env.insert("ZMCP_PROCESS_TITLE".to_string(), title.clone());

        let spec = SpawnSpec {
            program: config.program.clone(),
            args,
            env,
            title,
            cwd: Some(std::path::PathBuf::from(&agent.repository_path)),
        };

        match self.process.spawn(spec).await {
            Ok(pid) => {
                let previous = agent.status;
                // Conditional: a child that exited before activation has
                // already been recorded terminal by the exit listener,
                // and that status must stick.
                let activated = self.agents.mark_active(agent.id, pid).await?;
                if let Some(fresh) = self.agents.get(agent.id).await? {
                    *agent = fresh;
                } else {
                    agent.claude_pid = Some(pid);
                    agent.status = AgentStatus::Active;
                }
                if activated {
                    self.emit_status_change(agent, previous);
                }
                self.bus.emit(EventPayload::AgentSpawned {
                    agent: agent.clone(),
                    repository_path: agent.repository_path.clone(),
                });
                Ok(())
            }
            Err(e) => {
                let previous = agent.status;
                agent.status = AgentStatus::Failed;
                agent.updated_at = Utc::now();
                self.agents.update(agent.clone()).await?;

                self.emit_status_change(agent, previous);
                self.bus.emit(EventPayload::SystemError {
                    error: e.to_string(),
                    context: format!("spawning agent {}", agent.agent_name),
                    repository_path: Some(agent.repository_path.clone()),
                });
                Err(e)
            }
        }
    }

    fn stored_claude_config(&self, agent: &Agent) -> Result<ClaudeConfig, CoreError> {
        agent
            .agent_metadata
            .get("claude_config")
            .cloned()
            .and_then(|raw| serde_json::from_value(raw).ok())
            .ok_or_else(|| {
                CoreError::InvalidRequest(format!(
                    "agent {} has no stored spawn configuration",
                    agent.id
                ))
            })
    }

    /// Reject `depends_on` sets that reference the agent itself or close
    /// a cycle through stored agents.
    async fn validate_dependencies(
        &self,
        depends_on: &[Uuid],
        self_id: Option<Uuid>,
    ) -> Result<(), CoreError> {
        if depends_on.is_empty() {
            return Ok(());
        }
        if let Some(id) = self_id {
            if depends_on.contains(&id) {
                return Err(CoreError::Cycle(vec![id]));
            }
        }

        let anchor = self_id.unwrap_or_else(Uuid::now_v7);
        let mut graph: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        graph.insert(anchor, depends_on.to_vec());

        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut frontier = depends_on.to_vec();
        while let Some(id) = frontier.pop() {
            if !seen.insert(id) {
                continue;
            }
            let deps = match self.agents.get(id).await? {
                Some(agent) => agent.depends_on,
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

    async fn require(&self, agent_id: Uuid) -> Result<Agent, CoreError> {
        self.agents
            .get(agent_id)
            .await?
            .ok_or_else(|| CoreError::not_found("agent", agent_id))
    }

    fn emit_status_change(&self, agent: &Agent, previous: AgentStatus) {
        if previous == agent.status {
            return;
        }
        self.bus.emit(EventPayload::AgentStatusChange {
            agent_id: agent.id,
            previous_status: previous,
            new_status: agent.status,
            repository_path: agent.repository_path.clone(),
            metadata: json!({}),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::{
        AgentRepositoryImpl, DatabaseConnection, RoomRepositoryImpl,
    };
    use crate::services::event_bus::EventKind;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// In-memory stand-in for the process supervisor.
    struct FakeProcess {
        next_pid: Mutex<i32>,
        alive: Mutex<HashSet<i32>>,
        signals: Mutex<Vec<(i32, ProcessSignal)>>,
        fail_spawn: bool,
    }

    impl FakeProcess {
        fn new() -> Self {
            Self {
                next_pid: Mutex::new(1000),
                alive: Mutex::new(HashSet::new()),
                signals: Mutex::new(Vec::new()),
                fail_spawn: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail_spawn: true,
                ..Self::new()
            }
        }

        fn kill(&self, pid: i32) {
            self.alive.lock().unwrap().remove(&pid);
        }
    }

    #[async_trait]
    impl ProcessControl for FakeProcess {
        async fn spawn(&self, _spec: SpawnSpec) -> Result<i32, CoreError> {
            if self.fail_spawn {
                return Err(CoreError::ChildSpawn("no such binary".to_string()));
            }
            let mut next = self.next_pid.lock().unwrap();
            *next += 1;
            self.alive.lock().unwrap().insert(*next);
            Ok(*next)
        }

        fn is_alive(&self, pid: i32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }

        fn signal(&self, pid: i32, signal: ProcessSignal) {
            self.signals.lock().unwrap().push((pid, signal));
            if signal == ProcessSignal::Kill || signal == ProcessSignal::Terminate {
                self.kill(pid);
            }
        }
    }

    struct Fixture {
        service: Arc<AgentService>,
        process: Arc<FakeProcess>,
        bus: Arc<EventBus>,
        agents: Arc<AgentRepositoryImpl>,
    }

    async fn setup_with(process: FakeProcess) -> Fixture {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let agents = Arc::new(AgentRepositoryImpl::new(db.pool().clone()));
        let rooms = Arc::new(RoomRepositoryImpl::new(db.pool().clone()));
        let bus = Arc::new(EventBus::new());
        let room_service = Arc::new(RoomService::new(rooms.clone(), Arc::clone(&bus)));
        let process = Arc::new(process);
        let service = Arc::new(AgentService::new(
            agents.clone(),
            rooms,
            room_service,
            process.clone(),
            Arc::clone(&bus),
        ));
        Fixture {
            service,
            process,
            bus,
            agents,
        }
    }

    async fn setup() -> Fixture {
        setup_with(FakeProcess::new()).await
    }

    fn request(name: &str) -> CreateAgentRequest {
        CreateAgentRequest {
            agent_name: name.to_string(),
            repository_path: "/r".to_string(),
            objective_description: "build it".to_string(),
            agent_type: Some("backend".to_string()),
            capabilities: vec![],
            depends_on: vec![],
            metadata: None,
            auto_create_room: false,
            room_id: None,
            claude_config: ClaudeConfig {
                prompt: "do the work".to_string(),
                model: None,
                session_id: None,
                environment_vars: HashMap::new(),
                program: "claude".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_create_agent_spawns_and_activates() {
        let fixture = setup().await;
        let (_id, mut rx) = fixture.bus.subscribe(EventKind::AgentSpawned, None).unwrap();

        let agent = fixture.service.create_agent(request("builder")).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Active);
        assert!(agent.claude_pid.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_agent_failed() {
        let fixture = setup_with(FakeProcess::failing()).await;
        let (_id, mut rx) = fixture.bus.subscribe(EventKind::SystemError, None).unwrap();

        let err = fixture.service.create_agent(request("doomed")).await.unwrap_err();
        assert_eq!(err.kind(), "child_spawn");
        assert!(rx.recv().await.is_some());

        let page = fixture
            .service
            .list_agents(AgentFilter {
                status: Some(AgentStatus::Failed),
                ..AgentFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_signals() {
        let fixture = setup().await;
        let agent = fixture.service.create_agent(request("worker")).await.unwrap();

        let first = fixture.service.terminate(agent.id).await.unwrap();
        assert_eq!(first.status, AgentStatus::Terminated);
        let signals = fixture.process.signals.lock().unwrap().clone();
        assert!(signals
            .iter()
            .any(|(pid, sig)| *pid == agent.claude_pid.unwrap()
                && *sig == ProcessSignal::Terminate));

        let second = fixture.service.terminate(agent.id).await.unwrap();
        assert_eq!(second.status, AgentStatus::Terminated);
    }

    #[tokio::test]
    async fn test_dependency_chain_accepted() {
        let fixture = setup().await;
        let a = fixture.service.create_agent(request("a")).await.unwrap();
        let b = fixture
            .service
            .create_agent(CreateAgentRequest {
                depends_on: vec![a.id],
                ..request("b")
            })
            .await
            .unwrap();
        let c = fixture
            .service
            .create_agent(CreateAgentRequest {
                depends_on: vec![a.id, b.id],
                ..request("c")
            })
            .await
            .unwrap();
        assert_eq!(c.depends_on, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_reconciliation_terminates_dead_agents() {
        let fixture = setup().await;
        let agent = fixture.service.create_agent(request("mortal")).await.unwrap();
        let (_id, mut rx) = fixture
            .bus
            .subscribe(EventKind::AgentTerminated, None)
            .unwrap();

        fixture.process.kill(agent.claude_pid.unwrap());
        let corrected = fixture.service.reconcile_once().await.unwrap();
        assert_eq!(corrected, 1);

        let event = rx.recv().await.unwrap();
        match event.payload {
            EventPayload::AgentTerminated { reason, .. } => {
                assert_eq!(reason.as_deref(), Some("process exit observed"));
            }
            _ => panic!("wrong payload"),
        }

        let stored = fixture.service.get(agent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AgentStatus::Terminated);

        // A second pass finds nothing to correct
        assert_eq!(fixture.service.reconcile_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_continue_session_resumes_terminated_agent() {
        let fixture = setup().await;
        let agent = fixture.service.create_agent(request("phoenix")).await.unwrap();
        fixture.service.terminate(agent.id).await.unwrap();
        let (_id, mut rx) = fixture.bus.subscribe(EventKind::AgentResumed, None).unwrap();

        let resumed = fixture
            .service
            .continue_agent_session(agent.id, Some("pick up where you left off"), None, true, None)
            .await
            .unwrap();
        assert_eq!(resumed.status, AgentStatus::Active);
        assert_ne!(resumed.claude_pid, agent.claude_pid);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_continue_active_agent_rejected() {
        let fixture = setup().await;
        let agent = fixture.service.create_agent(request("busy")).await.unwrap();
        let err = fixture
            .service
            .continue_agent_session(agent.id, None, None, true, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "illegal_transition");
    }

    #[tokio::test]
    async fn test_cleanup_stale_agents_scenario() {
        let fixture = setup().await;
        let agent = fixture.service.create_agent(request("sleeper")).await.unwrap();

        // Age the heartbeat past the threshold
        let mut stored = fixture.agents.get(agent.id).await.unwrap().unwrap();
        stored.last_heartbeat = Utc::now() - Duration::minutes(31);
        fixture.agents.update(stored).await.unwrap();

        let dry = fixture
            .service
            .cleanup_stale_agents(StaleAgentOptions {
                stale_minutes: 30,
                dry_run: true,
                include_room_cleanup: false,
                notify_participants: false,
            })
            .await
            .unwrap();
        assert_eq!(dry.terminated_agents, 1);
        assert_eq!(
            fixture.service.get(agent.id).await.unwrap().unwrap().status,
            AgentStatus::Active,
            "dry run must not touch the agent"
        );

        let real = fixture
            .service
            .cleanup_stale_agents(StaleAgentOptions {
                stale_minutes: 30,
                dry_run: false,
                include_room_cleanup: false,
                notify_participants: false,
            })
            .await
            .unwrap();
        assert_eq!(real.terminated_agents, 1);
        assert_eq!(
            fixture.service.get(agent.id).await.unwrap().unwrap().status,
            AgentStatus::Terminated
        );
    }

    #[tokio::test]
    async fn test_auto_created_room_is_recorded() {
        let fixture = setup().await;
        let mut with_room = request("social");
        with_room.auto_create_room = true;
        let agent = fixture.service.create_agent(with_room).await.unwrap();
        assert!(agent.room_id.is_some());
    }
}
