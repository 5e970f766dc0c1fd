//! Shared fixture for integration tests: the full service stack over an
//! in-memory store, with stub agent binaries spawned through the real
//! process supervisor.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use zmcp::domain::ports::KnowledgeStore;
use zmcp::infrastructure::database::{
    AgentRepositoryImpl, DatabaseConnection, ObjectiveRepositoryImpl, ProjectRepositoryImpl,
    RoomRepositoryImpl, ScrapeJobRepositoryImpl,
};
use zmcp::infrastructure::knowledge::MemoryKnowledgeStore;
use zmcp::infrastructure::process::ProcessSupervisor;
use zmcp::services::complexity::HeuristicComplexityAnalyzer;
use zmcp::services::{
    AgentService, DependencyWaiter, EventBus, JobQueueService, ObjectiveService, Orchestrator,
    ProgressTracker, ProjectService, RoomService,
};

pub struct Stack {
    pub bus: Arc<EventBus>,
    pub agents: Arc<AgentService>,
    pub agent_repo: Arc<AgentRepositoryImpl>,
    pub objectives: Arc<ObjectiveService>,
    pub rooms: Arc<RoomService>,
    pub projects: Arc<ProjectService>,
    pub waiter: Arc<DependencyWaiter>,
    pub tracker: Arc<ProgressTracker>,
    pub orchestrator: Arc<Orchestrator>,
    pub queue: Arc<JobQueueService>,
    pub job_repo: Arc<ScrapeJobRepositoryImpl>,
    pub knowledge: Arc<MemoryKnowledgeStore>,
    pub supervisor: Arc<ProcessSupervisor>,
    /// Repository path used by the tests; a real directory because it is
    /// also the spawn cwd.
    pub repo_path: String,
    exit_listener: tokio::task::JoinHandle<()>,
    _db: DatabaseConnection,
    tempdir: tempfile::TempDir,
}

pub fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

impl Stack {
    /// Build the stack with orchestrated agents running the given shell
    /// body (e.g. "exit 0" or "sleep 30").
    pub async fn with_agent_script(body: &str) -> Self {
        let tempdir = tempfile::tempdir().unwrap();
        let program = write_stub(tempdir.path(), "agent.sh", body);

        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let bus = Arc::new(EventBus::new());
        let agent_repo = Arc::new(AgentRepositoryImpl::new(db.pool().clone()));
        let objective_repo = Arc::new(ObjectiveRepositoryImpl::new(db.pool().clone()));
        let project_repo = Arc::new(ProjectRepositoryImpl::new(db.pool().clone()));
        let room_repo = Arc::new(RoomRepositoryImpl::new(db.pool().clone()));
        let job_repo = Arc::new(ScrapeJobRepositoryImpl::new(db.pool().clone()));

        let supervisor = Arc::new(ProcessSupervisor::new(Arc::clone(&bus)));
        let rooms = Arc::new(RoomService::new(room_repo.clone(), Arc::clone(&bus)));
        let projects = Arc::new(ProjectService::new(project_repo, Arc::clone(&bus)));
        let objectives = Arc::new(ObjectiveService::new(
            objective_repo.clone(),
            Arc::clone(&bus),
        ));
        let agents = Arc::new(AgentService::new(
            agent_repo.clone(),
            room_repo,
            Arc::clone(&rooms),
            supervisor.clone(),
            Arc::clone(&bus),
        ));
        let waiter = Arc::new(DependencyWaiter::new(
            agent_repo.clone(),
            objective_repo,
            Arc::clone(&bus),
        ));
        let tracker = Arc::new(ProgressTracker::new(Arc::clone(&bus)));
        let knowledge = Arc::new(MemoryKnowledgeStore::new());

        let orchestrator = Arc::new(
            Orchestrator::new(
                Arc::clone(&agents),
                Arc::clone(&objectives),
                Arc::clone(&rooms),
                Arc::clone(&projects),
                Arc::clone(&waiter),
                Arc::clone(&tracker),
                Arc::new(HeuristicComplexityAnalyzer),
                Arc::clone(&knowledge) as Arc<dyn KnowledgeStore>,
                Arc::clone(&bus),
            )
            .with_agent_program(program.to_string_lossy().as_ref())
            .with_eviction_delay_ms(60_000),
        );

        let queue = Arc::new(JobQueueService::new(job_repo.clone(), Arc::clone(&bus)));
        let exit_listener = Arc::clone(&agents).spawn_exit_listener();
        let repo_path = tempdir.path().to_string_lossy().to_string();

        Self {
            bus,
            agents,
            agent_repo,
            objectives,
            rooms,
            projects,
            waiter,
            tracker,
            orchestrator,
            queue,
            job_repo,
            knowledge,
            supervisor,
            repo_path,
            exit_listener,
            _db: db,
            tempdir,
        }
    }

    /// Write another executable stub and return its path.
    pub fn stub_script(&self, name: &str, body: &str) -> PathBuf {
        write_stub(self.tempdir.path(), name, body)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.exit_listener.abort();
    }
}
