//! Service layer: the event bus, entity services, dependency waiting,
//! progress tracking, the orchestration engine, and the scrape worker.

pub mod agent_service;
pub mod complexity;
pub mod dependency_graph;
pub mod dependency_waiter;
pub mod event_bus;
pub mod job_queue;
pub mod objective_service;
pub mod orchestrator;
pub mod plan_service;
pub mod progress_tracker;
pub mod project_service;
pub mod requests;
pub mod room_service;
pub mod scrape_worker;

pub use agent_service::AgentService;
pub use dependency_waiter::DependencyWaiter;
pub use event_bus::EventBus;
pub use job_queue::JobQueueService;
pub use objective_service::ObjectiveService;
pub use orchestrator::Orchestrator;
pub use plan_service::PlanService;
pub use progress_tracker::ProgressTracker;
pub use project_service::ProjectService;
pub use requests::RequestDispatcher;
pub use room_service::RoomService;
pub use scrape_worker::ScrapeWorker;
