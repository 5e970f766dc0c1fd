//! External capability contracts.
//!
//! These are the narrow seams to collaborators the core does not own:
//! child process control, the knowledge store, complexity analysis, and
//! the crawler's page fetcher.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::domain::error::CoreError;
use crate::domain::models::ComplexityAssessment;

/// Signals the supervisor can deliver to a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Interrupt,
    Terminate,
    Quit,
    Kill,
}

/// Everything needed to spawn one supervised child.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment entries merged over the parent environment.
    pub env: HashMap<String, String>,
    /// Deterministic process title, observable via `ps`.
    pub title: String,
    pub cwd: Option<PathBuf>,
}

/// Child process control seam. The production implementation is the
/// `ProcessSupervisor`; tests use an in-memory fake.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Spawn the child and return its pid. Failure is a `ChildSpawn`.
    async fn spawn(&self, spec: SpawnSpec) -> Result<i32, CoreError>;

    /// Signal-0 style liveness probe. Must not block longer than 500 ms.
    fn is_alive(&self, pid: i32) -> bool;

    /// Deliver a signal to a child. Unknown pids are a no-op.
    fn signal(&self, pid: i32, signal: ProcessSignal);
}

/// An entity written to the knowledge store.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KnowledgeEntity {
    pub id: Uuid,
    pub repository_path: String,
    pub entity_type: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl KnowledgeEntity {
    pub fn new(
        repository_path: impl Into<String>,
        entity_type: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            repository_path: repository_path.into(),
            entity_type: entity_type.into(),
            title: title.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Narrow capability over the vector/knowledge-graph store. The store's
/// indices are opaque to the core.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn store_entity(&self, entity: KnowledgeEntity) -> Result<(), CoreError>;
    async fn semantic_search(
        &self,
        repository_path: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntity>, CoreError>;
}

/// Complexity analysis capability. The decomposition intelligence is
/// external; the orchestrator only consumes its stable output shape.
#[async_trait]
pub trait ComplexityAnalyzer: Send + Sync {
    async fn analyze(&self, objective: &str) -> Result<ComplexityAssessment, CoreError>;
}

/// One fetched page, as seen by the scrape worker.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub content: String,
    /// Candidate links for the crawl frontier.
    pub links: Vec<String>,
}

/// The crawler's page fetcher. Browser automation and HTML conversion are
/// behind this seam; the core only drives the crawl loop and the queue.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, CoreError>;
}
