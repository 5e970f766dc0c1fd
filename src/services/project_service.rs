//! Project registry: single live registration per repository path,
//! heartbeats, and status change notifications.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::error::CoreError;
use crate::domain::models::{Project, ProjectStatus};
use crate::domain::ports::ProjectRepository;

use super::event_bus::{EventBus, EventPayload};

pub struct ProjectService {
    projects: Arc<dyn ProjectRepository>,
    bus: Arc<EventBus>,
}

/// Result of a registration attempt.
#[derive(Debug, Clone)]
pub struct Registration {
    pub project: Project,
    /// False when an existing live registration was returned instead.
    pub created: bool,
}

impl ProjectService {
    pub fn new(projects: Arc<dyn ProjectRepository>, bus: Arc<EventBus>) -> Self {
        Self { projects, bus }
    }

    /// Register a workspace. At most one project per path may be live;
    /// registering a second returns the existing one untouched.
    pub async fn register(
        &self,
        name: &str,
        repository_path: &str,
    ) -> Result<Registration, CoreError> {
        if let Some(existing) = self
            .projects
            .find_live_by_repository_path(repository_path)
            .await?
        {
            return Ok(Registration {
                project: existing,
                created: false,
            });
        }

        let mut project = Project::new(name, repository_path);
        project.server_pid = i32::try_from(std::process::id()).ok();
        self.projects.insert(project.clone()).await?;

        self.bus.emit(EventPayload::ProjectRegistered {
            project: project.clone(),
            repository_path: repository_path.to_string(),
        });
        Ok(Registration {
            project,
            created: true,
        })
    }

    pub async fn heartbeat(&self, project_id: Uuid) -> Result<(), CoreError> {
        let mut project = self.require(project_id).await?;
        project.last_heartbeat = Utc::now();
        self.projects.update(project.clone()).await?;

        self.bus.emit(EventPayload::ProjectHeartbeat {
            project_id,
            repository_path: project.repository_path,
        });
        Ok(())
    }

    pub async fn set_status(
        &self,
        project_id: Uuid,
        new_status: ProjectStatus,
    ) -> Result<Project, CoreError> {
        let mut project = self.require(project_id).await?;
        let previous_status = project.status;
        if previous_status == new_status {
            return Ok(project);
        }

        project.status = new_status;
        if !new_status.is_live() {
            project.end_time = Some(Utc::now());
        }
        self.projects.update(project.clone()).await?;

        self.bus.emit(EventPayload::ProjectStatusChange {
            project_id,
            previous_status,
            new_status,
            repository_path: project.repository_path.clone(),
        });
        if new_status == ProjectStatus::Disconnected {
            self.bus.emit(EventPayload::ProjectDisconnected {
                project_id,
                repository_path: project.repository_path.clone(),
            });
        }
        Ok(project)
    }

    pub async fn find_by_path(&self, repository_path: &str) -> Result<Vec<Project>, CoreError> {
        Ok(self.projects.find_by_repository_path(repository_path).await?)
    }

    async fn require(&self, project_id: Uuid) -> Result<Project, CoreError> {
        self.projects
            .get(project_id)
            .await?
            .ok_or_else(|| CoreError::not_found("project", project_id))
    }
}
