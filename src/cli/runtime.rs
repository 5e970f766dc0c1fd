//! Runtime assembly: wire the store, event bus, services, supervisor,
//! and dispatcher from one configuration.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::domain::models::Config;
use crate::domain::ports::{KnowledgeStore, PageFetcher};
use crate::infrastructure::database::{
    AgentRepositoryImpl, DatabaseConnection, ObjectiveRepositoryImpl, PlanRepositoryImpl,
    ProjectRepositoryImpl, RoomRepositoryImpl, ScrapeJobRepositoryImpl,
};
use crate::infrastructure::knowledge::FileKnowledgeStore;
use crate::infrastructure::process::ProcessSupervisor;
use crate::infrastructure::scraping::HttpFetcher;
use crate::services::complexity::HeuristicComplexityAnalyzer;
use crate::services::{
    AgentService, DependencyWaiter, EventBus, JobQueueService, ObjectiveService, Orchestrator,
    PlanService, ProgressTracker, ProjectService, RequestDispatcher, RoomService,
};

pub struct Runtime {
    pub config: Config,
    pub db: DatabaseConnection,
    pub bus: Arc<EventBus>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub agents: Arc<AgentService>,
    pub objectives: Arc<ObjectiveService>,
    pub rooms: Arc<RoomService>,
    pub projects: Arc<ProjectService>,
    pub plans: Arc<PlanService>,
    pub waiter: Arc<DependencyWaiter>,
    pub tracker: Arc<ProgressTracker>,
    pub orchestrator: Arc<Orchestrator>,
    pub queue: Arc<JobQueueService>,
    pub job_repo: Arc<ScrapeJobRepositoryImpl>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub dispatcher: Arc<RequestDispatcher>,
    exit_listener: tokio::task::JoinHandle<()>,
}

impl Runtime {
    pub async fn init(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

        let database_url = format!("sqlite:{}", config.database_path().display());
        let db = DatabaseConnection::new(&database_url)
            .await
            .context("connecting to database")?;
        db.migrate().await.context("running migrations")?;

        let bus = Arc::new(EventBus::new());

        let agent_repo = Arc::new(AgentRepositoryImpl::new(db.pool().clone()));
        let objective_repo = Arc::new(ObjectiveRepositoryImpl::new(db.pool().clone()));
        let plan_repo = Arc::new(PlanRepositoryImpl::new(db.pool().clone()));
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
        let plans = Arc::new(PlanService::new(
            plan_repo,
            objective_repo.clone(),
            Arc::clone(&objectives),
        ));
        let agents = Arc::new(AgentService::new(
            agent_repo.clone(),
            room_repo,
            Arc::clone(&rooms),
            supervisor.clone(),
            Arc::clone(&bus),
        ));
        let waiter = Arc::new(DependencyWaiter::new(
            agent_repo,
            objective_repo,
            Arc::clone(&bus),
        ));
        let tracker = Arc::new(ProgressTracker::new(Arc::clone(&bus)));
        let knowledge: Arc<dyn KnowledgeStore> =
            Arc::new(FileKnowledgeStore::new(config.knowledge_dir()));

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&agents),
            Arc::clone(&objectives),
            Arc::clone(&rooms),
            Arc::clone(&projects),
            Arc::clone(&waiter),
            Arc::clone(&tracker),
            Arc::new(HeuristicComplexityAnalyzer),
            knowledge,
            Arc::clone(&bus),
        ));

        let queue = Arc::new(JobQueueService::new(job_repo.clone(), Arc::clone(&bus)));
        let fetcher: Arc<dyn PageFetcher> = Arc::new(
            HttpFetcher::new(30).context("building http fetcher")?,
        );

        let dispatcher = Arc::new(RequestDispatcher::new(
            Arc::clone(&orchestrator),
            Arc::clone(&agents),
            Arc::clone(&objectives),
            config.cleanup.clone(),
        ));

        // Keeps stored agent statuses honest against child exits.
        let exit_listener = Arc::clone(&agents).spawn_exit_listener();

        Ok(Self {
            config,
            db,
            bus,
            supervisor,
            agents,
            objectives,
            rooms,
            projects,
            plans,
            waiter,
            tracker,
            orchestrator,
            queue,
            job_repo,
            fetcher,
            dispatcher,
            exit_listener,
        })
    }

    /// Graceful shutdown: cancel active orchestrations, close the bus to
    /// new subscriptions, and give handlers a bounded drain window.
    pub async fn shutdown(&self) {
        for id in self.orchestrator.active_ids().await {
            if let Err(e) = self.orchestrator.cancel_orchestration(&id).await {
                tracing::debug!(orchestration = %id, error = %e, "shutdown cancel");
            }
        }
        self.bus.close();
        // Drain: give subscribers up to five seconds to let go.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        self.exit_listener.abort();
        while self.bus.subscriber_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        self.db.close().await;
    }
}
