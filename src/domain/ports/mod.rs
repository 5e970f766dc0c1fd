//! Ports: trait contracts between the service layer and everything that
//! touches the outside world (store, child processes, knowledge store,
//! complexity analysis, page fetching).

pub mod capabilities;
pub mod repositories;

pub use capabilities::{
    ComplexityAnalyzer, FetchedPage, KnowledgeEntity, KnowledgeStore, PageFetcher,
    ProcessControl, ProcessSignal, SpawnSpec,
};
pub use repositories::{
    AgentFilter, AgentRepository, ObjectiveRepository, Page, PlanRepository, ProjectRepository,
    RoomRepository, ScrapeJobRepository,
};
