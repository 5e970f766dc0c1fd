//! SQLite implementation of `ObjectiveRepository`.
//!
//! Dependency edges live inside the `requirements` JSON. Reverse lookups
//! narrow candidates with a LIKE filter and verify against the parsed
//! dependency list, so a stray substring match never fabricates an edge.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::error::DatabaseError;
use crate::domain::models::{Objective, ObjectiveStatus, ObjectiveType, Requirements};
use crate::domain::ports::{ObjectiveRepository, Page};

use super::row::{parse_json, parse_status, parse_ts, parse_uuid, parse_uuid_opt, to_rfc3339};

pub struct ObjectiveRepositoryImpl {
    pool: SqlitePool,
}

const OBJECTIVE_COLUMNS: &str = "id, repository_path, objective_type, description, requirements, \
     status, priority, assigned_agent_id, parent_objective_id, results, progress_percentage, \
     created_at, updated_at";

impl ObjectiveRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_objective(row: &SqliteRow) -> Result<Objective, DatabaseError> {
        let id: String = row.try_get("id")?;
        let objective_type: String = row.try_get("objective_type")?;
        let requirements: String = row.try_get("requirements")?;
        let status: String = row.try_get("status")?;
        let assigned: Option<String> = row.try_get("assigned_agent_id")?;
        let parent: Option<String> = row.try_get("parent_objective_id")?;
        let results: Option<String> = row.try_get("results")?;
        let progress: Option<i64> = row.try_get("progress_percentage")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Objective {
            id: parse_uuid("objectives.id", &id)?,
            repository_path: row.try_get("repository_path")?,
            objective_type: parse_status(
                "objectives.objective_type",
                &objective_type,
                ObjectiveType::from_str,
            )?,
            description: row.try_get("description")?,
            requirements: Requirements::from_json(&requirements).map_err(|e| {
                DatabaseError::ParseError(format!("objectives.requirements: {e}"))
            })?,
            status: parse_status("objectives.status", &status, ObjectiveStatus::from_str)?,
            priority: row.try_get::<i64, _>("priority")? as i32,
            assigned_agent_id: parse_uuid_opt("objectives.assigned_agent_id", assigned.as_deref())?,
            parent_objective_id: parse_uuid_opt(
                "objectives.parent_objective_id",
                parent.as_deref(),
            )?,
            results: results
                .as_deref()
                .map(|raw| parse_json("objectives.results", raw))
                .transpose()?,
            progress_percentage: progress
                .map(|p| {
                    u8::try_from(p).map_err(|_| {
                        DatabaseError::ParseError(format!(
                            "objectives.progress_percentage: out of range {p}"
                        ))
                    })
                })
                .transpose()?,
            created_at: parse_ts("objectives.created_at", &created_at)?,
            updated_at: parse_ts("objectives.updated_at", &updated_at)?,
        })
    }

    fn bind_objective<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        objective: &'q Objective,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        query
            .bind(&objective.repository_path)
            .bind(objective.objective_type.as_str())
            .bind(&objective.description)
            .bind(objective.requirements.to_json())
            .bind(objective.status.as_str())
            .bind(i64::from(objective.priority))
            .bind(objective.assigned_agent_id.map(|id| id.to_string()))
            .bind(objective.parent_objective_id.map(|id| id.to_string()))
            .bind(objective.results.as_ref().map(ToString::to_string))
            .bind(objective.progress_percentage.map(i64::from))
    }
}

#[async_trait]
impl ObjectiveRepository for ObjectiveRepositoryImpl {
    async fn insert(&self, objective: Objective) -> Result<(), DatabaseError> {
        let query = sqlx::query(
            "INSERT INTO objectives (repository_path, objective_type, description, requirements, \
             status, priority, assigned_agent_id, parent_objective_id, results, \
             progress_percentage, id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        );
        Self::bind_objective(query, &objective)
            .bind(objective.id.to_string())
            .bind(to_rfc3339(objective.created_at))
            .bind(to_rfc3339(objective.updated_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Objective>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {OBJECTIVE_COLUMNS} FROM objectives WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_objective).transpose()
    }

    async fn update(&self, objective: Objective) -> Result<(), DatabaseError> {
        let query = sqlx::query(
            "UPDATE objectives SET repository_path = ?, objective_type = ?, description = ?, \
             requirements = ?, status = ?, priority = ?, assigned_agent_id = ?, \
             parent_objective_id = ?, results = ?, progress_percentage = ?, updated_at = ? \
             WHERE id = ?",
        );
        Self::bind_objective(query, &objective)
            .bind(to_rfc3339(Utc::now()))
            .bind(objective.id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM objectives WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(
        &self,
        repository_path: &str,
        status: Option<ObjectiveStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Page<Objective>, DatabaseError> {
        let mut where_clause = String::from(" WHERE repository_path = ?");
        if status.is_some() {
            where_clause.push_str(" AND status = ?");
        }

        let count_sql = format!("SELECT COUNT(*) AS n FROM objectives{where_clause}");
        let mut count_query = sqlx::query(&count_sql).bind(repository_path);
        if let Some(s) = status {
            count_query = count_query.bind(s.as_str());
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.try_get("n")?;

        let limit = if limit > 0 { limit } else { 50 };
        let sql = format!(
            "SELECT {OBJECTIVE_COLUMNS} FROM objectives{where_clause} \
             ORDER BY priority DESC, created_at ASC LIMIT ? OFFSET ?"
        );
        let mut query = sqlx::query(&sql).bind(repository_path);
        if let Some(s) = status {
            query = query.bind(s.as_str());
        }
        let rows = query.bind(limit).bind(offset).fetch_all(&self.pool).await?;

        let data = rows
            .iter()
            .map(Self::row_to_objective)
            .collect::<Result<Vec<_>, _>>()?;
        let has_more = offset + (data.len() as i64) < total;

        Ok(Page {
            data,
            total,
            has_more,
        })
    }

    async fn find_children(&self, parent_id: Uuid) -> Result<Vec<Objective>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT {OBJECTIVE_COLUMNS} FROM objectives WHERE parent_objective_id = ? \
             ORDER BY created_at ASC"
        ))
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_objective).collect()
    }

    async fn find_pending(
        &self,
        repository_path: &str,
        objective_types: Option<&[ObjectiveType]>,
        limit: i64,
    ) -> Result<Vec<Objective>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT {OBJECTIVE_COLUMNS} FROM objectives \
             WHERE repository_path = ? AND status = 'pending' \
             ORDER BY priority DESC, created_at ASC"
        ))
        .bind(repository_path)
        .fetch_all(&self.pool)
        .await?;

        let mut matched = Vec::new();
        for row in &rows {
            let objective = Self::row_to_objective(row)?;
            if let Some(types) = objective_types {
                if !types.contains(&objective.objective_type) {
                    continue;
                }
            }
            matched.push(objective);
            if matched.len() as i64 >= limit {
                break;
            }
        }
        Ok(matched)
    }

    async fn get_dependencies(&self, id: Uuid) -> Result<Vec<Objective>, DatabaseError> {
        let Some(objective) = self.get(id).await? else {
            return Ok(Vec::new());
        };
        let mut deps = Vec::new();
        for dep_id in objective.dependencies() {
            if let Some(dep) = self.get(*dep_id).await? {
                deps.push(dep);
            }
        }
        Ok(deps)
    }

    async fn get_dependents(&self, id: Uuid) -> Result<Vec<Objective>, DatabaseError> {
        // LIKE narrows candidates; the parsed dependency list is the truth.
        let rows = sqlx::query(&format!(
            "SELECT {OBJECTIVE_COLUMNS} FROM objectives WHERE requirements LIKE ?"
        ))
        .bind(format!("%{id}%"))
        .fetch_all(&self.pool)
        .await?;

        let mut dependents = Vec::new();
        for row in &rows {
            let objective = Self::row_to_objective(row)?;
            if objective.dependencies().contains(&id) {
                dependents.push(objective);
            }
        }
        Ok(dependents)
    }

    async fn find_by_plan(&self, plan_id: Uuid) -> Result<Vec<Objective>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT {OBJECTIVE_COLUMNS} FROM objectives WHERE requirements LIKE ?"
        ))
        .bind(format!("%{plan_id}%"))
        .fetch_all(&self.pool)
        .await?;

        let mut matched = Vec::new();
        for row in &rows {
            let objective = Self::row_to_objective(row)?;
            if objective.requirements.plan_id == Some(plan_id) {
                matched.push(objective);
            }
        }
        Ok(matched)
    }
}
