//! SQLite implementation of `ProjectRepository`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::error::DatabaseError;
use crate::domain::models::{Project, ProjectStatus};
use crate::domain::ports::ProjectRepository;

use super::row::{parse_json, parse_status, parse_ts, parse_ts_opt, parse_uuid, to_rfc3339};

pub struct ProjectRepositoryImpl {
    pool: SqlitePool,
}

const PROJECT_COLUMNS: &str = "id, name, repository_path, server_type, server_pid, server_port, \
     host, session_id, status, start_time, last_heartbeat, end_time, metadata, web_ui_enabled, \
     web_ui_port, web_ui_host";

impl ProjectRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_project(row: &SqliteRow) -> Result<Project, DatabaseError> {
        let id: String = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let metadata: String = row.try_get("metadata")?;
        let start_time: String = row.try_get("start_time")?;
        let last_heartbeat: String = row.try_get("last_heartbeat")?;
        let end_time: Option<String> = row.try_get("end_time")?;
        let server_pid: Option<i64> = row.try_get("server_pid")?;
        let server_port: Option<i64> = row.try_get("server_port")?;
        let web_ui_port: Option<i64> = row.try_get("web_ui_port")?;
        let web_ui_enabled: i64 = row.try_get("web_ui_enabled")?;

        Ok(Project {
            id: parse_uuid("projects.id", &id)?,
            name: row.try_get("name")?,
            repository_path: row.try_get("repository_path")?,
            server_type: row.try_get("server_type")?,
            server_pid: server_pid.map(|v| v as i32),
            server_port: server_port.map(|v| v as u16),
            host: row.try_get("host")?,
            session_id: row.try_get("session_id")?,
            status: parse_status("projects.status", &status, ProjectStatus::from_str)?,
            start_time: parse_ts("projects.start_time", &start_time)?,
            last_heartbeat: parse_ts("projects.last_heartbeat", &last_heartbeat)?,
            end_time: parse_ts_opt("projects.end_time", end_time.as_deref())?,
            metadata: parse_json("projects.metadata", &metadata)?,
            web_ui_enabled: web_ui_enabled != 0,
            web_ui_port: web_ui_port.map(|v| v as u16),
            web_ui_host: row.try_get("web_ui_host")?,
        })
    }
}

#[async_trait]
impl ProjectRepository for ProjectRepositoryImpl {
    async fn insert(&self, project: Project) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO projects (id, name, repository_path, server_type, server_pid, \
             server_port, host, session_id, status, start_time, last_heartbeat, end_time, \
             metadata, web_ui_enabled, web_ui_port, web_ui_host) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(project.id.to_string())
        .bind(&project.name)
        .bind(&project.repository_path)
        .bind(&project.server_type)
        .bind(project.server_pid.map(i64::from))
        .bind(project.server_port.map(i64::from))
        .bind(&project.host)
        .bind(&project.session_id)
        .bind(project.status.as_str())
        .bind(to_rfc3339(project.start_time))
        .bind(to_rfc3339(project.last_heartbeat))
        .bind(project.end_time.map(to_rfc3339))
        .bind(project.metadata.to_string())
        .bind(i64::from(project.web_ui_enabled))
        .bind(project.web_ui_port.map(i64::from))
        .bind(&project.web_ui_host)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Project>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_project).transpose()
    }

    async fn find_by_repository_path(&self, path: &str) -> Result<Vec<Project>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE repository_path = ? \
             ORDER BY start_time DESC"
        ))
        .bind(path)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_project).collect()
    }

    async fn find_live_by_repository_path(
        &self,
        path: &str,
    ) -> Result<Option<Project>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects \
             WHERE repository_path = ? AND status IN ('active', 'connected') \
             ORDER BY start_time DESC LIMIT 1"
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_project).transpose()
    }

    async fn update(&self, project: Project) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE projects SET name = ?, repository_path = ?, server_type = ?, server_pid = ?, \
             server_port = ?, host = ?, session_id = ?, status = ?, start_time = ?, \
             last_heartbeat = ?, end_time = ?, metadata = ?, web_ui_enabled = ?, \
             web_ui_port = ?, web_ui_host = ? WHERE id = ?",
        )
        .bind(&project.name)
        .bind(&project.repository_path)
        .bind(&project.server_type)
        .bind(project.server_pid.map(i64::from))
        .bind(project.server_port.map(i64::from))
        .bind(&project.host)
        .bind(&project.session_id)
        .bind(project.status.as_str())
        .bind(to_rfc3339(project.start_time))
        .bind(to_rfc3339(Utc::now()))
        .bind(project.end_time.map(to_rfc3339))
        .bind(project.metadata.to_string())
        .bind(i64::from(project.web_ui_enabled))
        .bind(project.web_ui_port.map(i64::from))
        .bind(&project.web_ui_host)
        .bind(project.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::DatabaseConnection;

    async fn setup() -> ProjectRepositoryImpl {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        ProjectRepositoryImpl::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_round_trip() {
        let repo = setup().await;
        let project = Project::new("demo", "/r");
        repo.insert(project.clone()).await.unwrap();

        let loaded = repo.get(project.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "demo");
        assert_eq!(loaded.status, ProjectStatus::Active);
        assert!(!loaded.web_ui_enabled);
    }

    #[tokio::test]
    async fn test_find_live_skips_inactive() {
        let repo = setup().await;
        let mut old = Project::new("old", "/r");
        old.status = ProjectStatus::Disconnected;
        let live = Project::new("live", "/r");
        repo.insert(old).await.unwrap();
        repo.insert(live.clone()).await.unwrap();

        let found = repo.find_live_by_repository_path("/r").await.unwrap();
        assert_eq!(found.unwrap().id, live.id);
        assert!(repo
            .find_live_by_repository_path("/other")
            .await
            .unwrap()
            .is_none());
    }
}
