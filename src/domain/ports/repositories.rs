//! Repository contracts over the embedded store.
//!
//! Implementations live in `infrastructure::database`. All methods are
//! scoped so that the service layer never needs raw SQL, and so tests can
//! substitute in-memory fakes where useful.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::error::DatabaseError;
use crate::domain::models::{
    Agent, AgentStatus, Message, Objective, ObjectiveStatus, ObjectiveType, Participant, Plan,
    Project, Room, ScrapeJob,
};

/// One page of a listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            total: 0,
            has_more: false,
        }
    }
}

/// Filter for agent listings.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub repository_path: Option<String>,
    pub status: Option<AgentStatus>,
    pub limit: i64,
    pub offset: i64,
}

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn insert(&self, project: Project) -> Result<(), DatabaseError>;
    async fn get(&self, id: Uuid) -> Result<Option<Project>, DatabaseError>;
    /// All registrations for a path, newest first.
    async fn find_by_repository_path(&self, path: &str) -> Result<Vec<Project>, DatabaseError>;
    /// The at-most-one project in a live status for a path.
    async fn find_live_by_repository_path(
        &self,
        path: &str,
    ) -> Result<Option<Project>, DatabaseError>;
    async fn update(&self, project: Project) -> Result<(), DatabaseError>;
    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn insert(&self, agent: Agent) -> Result<(), DatabaseError>;
    async fn get(&self, id: Uuid) -> Result<Option<Agent>, DatabaseError>;
    async fn update(&self, agent: Agent) -> Result<(), DatabaseError>;
    /// Record a successful spawn: set `active` and the pid, but only if
    /// the agent has not already reached a terminal state (a fast child
    /// exit can be reaped before activation lands). Returns whether the
    /// activation took effect.
    async fn mark_active(&self, id: Uuid, pid: i32) -> Result<bool, DatabaseError>;
    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError>;
    /// Ordered by `last_heartbeat` descending.
    async fn list(&self, filter: AgentFilter) -> Result<Page<Agent>, DatabaseError>;
    /// Agents in `active` or `idle`, optionally scoped to a path.
    async fn find_active_agents(
        &self,
        repository_path: Option<&str>,
    ) -> Result<Vec<Agent>, DatabaseError>;
    /// Agents in any non-terminal status (reconciliation scan).
    async fn find_non_terminal(&self) -> Result<Vec<Agent>, DatabaseError>;
    /// Active/idle agents whose heartbeat is older than the cutoff.
    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Agent>, DatabaseError>;
    async fn update_heartbeat(&self, id: Uuid) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait ObjectiveRepository: Send + Sync {
    async fn insert(&self, objective: Objective) -> Result<(), DatabaseError>;
    async fn get(&self, id: Uuid) -> Result<Option<Objective>, DatabaseError>;
    async fn update(&self, objective: Objective) -> Result<(), DatabaseError>;
    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError>;
    async fn list(
        &self,
        repository_path: &str,
        status: Option<ObjectiveStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Page<Objective>, DatabaseError>;
    /// Direct children in the breakdown hierarchy.
    async fn find_children(&self, parent_id: Uuid) -> Result<Vec<Objective>, DatabaseError>;
    /// Pending objectives for assignment, ordered priority desc then
    /// created_at asc.
    async fn find_pending(
        &self,
        repository_path: &str,
        objective_types: Option<&[ObjectiveType]>,
        limit: i64,
    ) -> Result<Vec<Objective>, DatabaseError>;
    /// Objectives this one depends on (resolved from
    /// `requirements.dependencies`).
    async fn get_dependencies(&self, id: Uuid) -> Result<Vec<Objective>, DatabaseError>;
    /// Objectives that depend on this one.
    async fn get_dependents(&self, id: Uuid) -> Result<Vec<Objective>, DatabaseError>;
    /// Objectives whose requirements carry the given plan id.
    async fn find_by_plan(&self, plan_id: Uuid) -> Result<Vec<Objective>, DatabaseError>;
}

#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn insert(&self, plan: Plan) -> Result<(), DatabaseError>;
    async fn get(&self, id: Uuid) -> Result<Option<Plan>, DatabaseError>;
    async fn update(&self, plan: Plan) -> Result<(), DatabaseError>;
    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError>;
    async fn list(&self, repository_path: &str) -> Result<Vec<Plan>, DatabaseError>;
}

#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn insert(&self, room: Room) -> Result<(), DatabaseError>;
    async fn get(&self, id: Uuid) -> Result<Option<Room>, DatabaseError>;
    async fn find_by_name(
        &self,
        repository_path: &str,
        name: &str,
    ) -> Result<Option<Room>, DatabaseError>;
    async fn update(&self, room: Room) -> Result<(), DatabaseError>;
    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError>;
    async fn list(&self, repository_path: &str) -> Result<Vec<Room>, DatabaseError>;
    async fn list_all(&self) -> Result<Vec<Room>, DatabaseError>;

    async fn append_message(&self, message: Message) -> Result<(), DatabaseError>;
    /// Ascending by timestamp then insertion id.
    async fn list_messages(
        &self,
        room_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, DatabaseError>;
    async fn last_message_at(&self, room_id: Uuid)
        -> Result<Option<DateTime<Utc>>, DatabaseError>;

    async fn upsert_participant(&self, participant: Participant) -> Result<bool, DatabaseError>;
    async fn list_participants(&self, room_id: Uuid) -> Result<Vec<Participant>, DatabaseError>;
}

#[async_trait]
pub trait ScrapeJobRepository: Send + Sync {
    async fn insert(&self, job: ScrapeJob) -> Result<(), DatabaseError>;
    async fn get(&self, id: Uuid) -> Result<Option<ScrapeJob>, DatabaseError>;
    async fn update(&self, job: ScrapeJob) -> Result<(), DatabaseError>;
    /// Most recent job for a source, if any.
    async fn find_by_source(&self, source_id: &str) -> Result<Option<ScrapeJob>, DatabaseError>;
    /// Atomically claim the best pending job: lowest priority value,
    /// earliest created, not locked. The transaction is the serialization
    /// point; at most one worker sees a given job.
    async fn lock_next_pending(
        &self,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<ScrapeJob>, DatabaseError>;
    /// Running jobs whose lease has lapsed.
    async fn find_expired_locks(&self) -> Result<Vec<ScrapeJob>, DatabaseError>;
    /// Reset expired leases back to pending; returns the jobs touched.
    async fn reset_expired_locks(&self) -> Result<Vec<ScrapeJob>, DatabaseError>;
    async fn mark_completed(&self, id: Uuid, result: Value) -> Result<(), DatabaseError>;
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;
    async fn cancel(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError>;
    /// Rehydrate a failed job to pending, clearing lease and run markers.
    async fn retry(&self, id: Uuid) -> Result<ScrapeJob, DatabaseError>;
    async fn force_unlock(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError>;
    /// Persist scraped page count.
    async fn update_progress(&self, id: Uuid, pages_scraped: u32) -> Result<(), DatabaseError>;
    /// Heartbeat: bump `updated_at` only.
    async fn touch(&self, id: Uuid) -> Result<(), DatabaseError>;
    /// Delete terminal jobs older than the given number of days.
    async fn cleanup_old_jobs(&self, days: i64) -> Result<u64, DatabaseError>;
    async fn list(
        &self,
        status: Option<crate::domain::models::ScrapeJobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Page<ScrapeJob>, DatabaseError>;
}
