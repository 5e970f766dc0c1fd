//! SQLite implementation of `PlanRepository`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::error::DatabaseError;
use crate::domain::models::{Plan, PlanStatus};
use crate::domain::ports::PlanRepository;

use super::row::{parse_json, parse_status, parse_ts, parse_ts_opt, parse_uuid, to_rfc3339};

pub struct PlanRepositoryImpl {
    pool: SqlitePool,
}

const PLAN_COLUMNS: &str = "id, repository_path, title, description, objectives, sections, \
     metadata, status, started_at, completed_at, created_at, updated_at";

impl PlanRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_plan(row: &SqliteRow) -> Result<Plan, DatabaseError> {
        let id: String = row.try_get("id")?;
        let sections: String = row.try_get("sections")?;
        let metadata: String = row.try_get("metadata")?;
        let status: String = row.try_get("status")?;
        let started_at: Option<String> = row.try_get("started_at")?;
        let completed_at: Option<String> = row.try_get("completed_at")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Plan {
            id: parse_uuid("plans.id", &id)?,
            repository_path: row.try_get("repository_path")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            objectives: row.try_get("objectives")?,
            sections: parse_json("plans.sections", &sections)?,
            metadata: parse_json("plans.metadata", &metadata)?,
            status: parse_status("plans.status", &status, PlanStatus::from_str)?,
            started_at: parse_ts_opt("plans.started_at", started_at.as_deref())?,
            completed_at: parse_ts_opt("plans.completed_at", completed_at.as_deref())?,
            created_at: parse_ts("plans.created_at", &created_at)?,
            updated_at: parse_ts("plans.updated_at", &updated_at)?,
        })
    }
}

#[async_trait]
impl PlanRepository for PlanRepositoryImpl {
    async fn insert(&self, plan: Plan) -> Result<(), DatabaseError> {
        let sections = serde_json::to_string(&plan.sections)
            .map_err(|e| DatabaseError::ParseError(e.to_string()))?;

        sqlx::query(
            "INSERT INTO plans (id, repository_path, title, description, objectives, sections, \
             metadata, status, started_at, completed_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(plan.id.to_string())
        .bind(&plan.repository_path)
        .bind(&plan.title)
        .bind(&plan.description)
        .bind(&plan.objectives)
        .bind(sections)
        .bind(plan.metadata.to_string())
        .bind(plan.status.as_str())
        .bind(plan.started_at.map(to_rfc3339))
        .bind(plan.completed_at.map(to_rfc3339))
        .bind(to_rfc3339(plan.created_at))
        .bind(to_rfc3339(plan.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Plan>, DatabaseError> {
        let row = sqlx::query(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_plan).transpose()
    }

    async fn update(&self, plan: Plan) -> Result<(), DatabaseError> {
        let sections = serde_json::to_string(&plan.sections)
            .map_err(|e| DatabaseError::ParseError(e.to_string()))?;

        sqlx::query(
            "UPDATE plans SET repository_path = ?, title = ?, description = ?, objectives = ?, \
             sections = ?, metadata = ?, status = ?, started_at = ?, completed_at = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(&plan.repository_path)
        .bind(&plan.title)
        .bind(&plan.description)
        .bind(&plan.objectives)
        .bind(sections)
        .bind(plan.metadata.to_string())
        .bind(plan.status.as_str())
        .bind(plan.started_at.map(to_rfc3339))
        .bind(plan.completed_at.map(to_rfc3339))
        .bind(to_rfc3339(Utc::now()))
        .bind(plan.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM plans WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, repository_path: &str) -> Result<Vec<Plan>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE repository_path = ? ORDER BY created_at DESC"
        ))
        .bind(repository_path)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_plan).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ObjectiveTemplate, Section};
    use crate::infrastructure::database::DatabaseConnection;

    async fn setup() -> PlanRepositoryImpl {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        PlanRepositoryImpl::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_sections_round_trip() {
        let repo = setup().await;
        let mut plan = Plan::new("/r", "Auth", "OAuth rollout");
        plan.sections.push(Section {
            id: Uuid::now_v7(),
            section_type: "implementation".into(),
            title: "Backend".into(),
            description: "token handling".into(),
            agent_responsibility: "backend".into(),
            estimated_hours: 3.0,
            priority: 5,
            prerequisites: vec![],
            objective_templates: vec![ObjectiveTemplate {
                description: "token endpoint".into(),
                objective_type: "feature".into(),
                estimated_hours: 2.0,
                dependencies: vec![],
            }],
        });

        repo.insert(plan.clone()).await.unwrap();
        let loaded = repo.get(plan.id).await.unwrap().unwrap();
        assert_eq!(loaded.sections.len(), 1);
        assert_eq!(loaded.sections[0].objective_templates.len(), 1);
        assert_eq!(loaded.status, PlanStatus::Draft);
    }
}
