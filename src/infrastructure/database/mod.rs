//! SQLite-backed repositories and the connection pool.

pub mod agent_repo;
pub mod connection;
pub mod objective_repo;
pub mod plan_repo;
pub mod project_repo;
pub mod room_repo;
pub(crate) mod row;
pub mod scrape_job_repo;

pub use agent_repo::AgentRepositoryImpl;
pub use connection::DatabaseConnection;
pub use objective_repo::ObjectiveRepositoryImpl;
pub use plan_repo::PlanRepositoryImpl;
pub use project_repo::ProjectRepositoryImpl;
pub use room_repo::RoomRepositoryImpl;
pub use scrape_job_repo::ScrapeJobRepositoryImpl;
