//! Entity models for the orchestration runtime.

pub mod agent;
pub mod config;
pub mod objective;
pub mod plan;
pub mod project;
pub mod requirements;
pub mod room;
pub mod scrape_job;

pub use agent::{Agent, AgentStatus};
pub use config::{CleanupConfig, Config, DashboardConfig, LogConfig, WorkerConfig};
pub use objective::{Objective, ObjectiveStatus, ObjectiveType};
pub use plan::{ObjectiveTemplate, Plan, PlanStatus, Section};
pub use project::{Project, ProjectStatus};
pub use requirements::{ComplexityAssessment, Requirements};
pub use room::{
    orchestration_room_name, Message, MessageType, Participant, ParticipantStatus, Room,
};
pub use scrape_job::{ScrapeJob, ScrapeJobData, ScrapeJobStatus};
