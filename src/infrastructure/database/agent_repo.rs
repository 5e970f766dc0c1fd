//! SQLite implementation of `AgentRepository`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::error::DatabaseError;
use crate::domain::models::{Agent, AgentStatus};
use crate::domain::ports::{AgentFilter, AgentRepository, Page};

use super::row::{parse_json, parse_status, parse_ts, parse_uuid, parse_uuid_opt, to_rfc3339};

pub struct AgentRepositoryImpl {
    pool: SqlitePool,
}

impl AgentRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_agent(row: &SqliteRow) -> Result<Agent, DatabaseError> {
        let id: String = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let capabilities: String = row.try_get("capabilities")?;
        let depends_on: String = row.try_get("depends_on")?;
        let metadata: String = row.try_get("agent_metadata")?;
        let room_id: Option<String> = row.try_get("room_id")?;
        let claude_pid: Option<i64> = row.try_get("claude_pid")?;
        let created_at: String = row.try_get("created_at")?;
        let last_heartbeat: String = row.try_get("last_heartbeat")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Agent {
            id: parse_uuid("agents.id", &id)?,
            agent_name: row.try_get("agent_name")?,
            agent_type: row.try_get("agent_type")?,
            repository_path: row.try_get("repository_path")?,
            status: parse_status("agents.status", &status, AgentStatus::from_str)?,
            capabilities: parse_json("agents.capabilities", &capabilities)?,
            depends_on: parse_json("agents.depends_on", &depends_on)?,
            claude_pid: claude_pid
                .map(|pid| {
                    i32::try_from(pid).map_err(|_| {
                        DatabaseError::ParseError(format!("agents.claude_pid: out of range {pid}"))
                    })
                })
                .transpose()?,
            convo_session_id: row.try_get("convo_session_id")?,
            room_id: parse_uuid_opt("agents.room_id", room_id.as_deref())?,
            agent_metadata: parse_json("agents.agent_metadata", &metadata)?,
            created_at: parse_ts("agents.created_at", &created_at)?,
            last_heartbeat: parse_ts("agents.last_heartbeat", &last_heartbeat)?,
            updated_at: parse_ts("agents.updated_at", &updated_at)?,
        })
    }
}

const AGENT_COLUMNS: &str = "id, agent_name, agent_type, repository_path, status, capabilities, \
     depends_on, claude_pid, convo_session_id, room_id, agent_metadata, created_at, \
     last_heartbeat, updated_at";

#[async_trait]
impl AgentRepository for AgentRepositoryImpl {
    async fn insert(&self, agent: Agent) -> Result<(), DatabaseError> {
        let capabilities = serde_json::to_string(&agent.capabilities)
            .map_err(|e| DatabaseError::ParseError(e.to_string()))?;
        let depends_on = serde_json::to_string(&agent.depends_on)
            .map_err(|e| DatabaseError::ParseError(e.to_string()))?;

        sqlx::query(
            "INSERT INTO agents (id, agent_name, agent_type, repository_path, status, \
             capabilities, depends_on, claude_pid, convo_session_id, room_id, agent_metadata, \
             created_at, last_heartbeat, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(agent.id.to_string())
        .bind(&agent.agent_name)
        .bind(&agent.agent_type)
        .bind(&agent.repository_path)
        .bind(agent.status.as_str())
        .bind(capabilities)
        .bind(depends_on)
        .bind(agent.claude_pid.map(i64::from))
        .bind(&agent.convo_session_id)
        .bind(agent.room_id.map(|id| id.to_string()))
        .bind(agent.agent_metadata.to_string())
        .bind(to_rfc3339(agent.created_at))
        .bind(to_rfc3339(agent.last_heartbeat))
        .bind(to_rfc3339(agent.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Agent>, DatabaseError> {
        let row = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_agent).transpose()
    }

    async fn update(&self, agent: Agent) -> Result<(), DatabaseError> {
        let capabilities = serde_json::to_string(&agent.capabilities)
            .map_err(|e| DatabaseError::ParseError(e.to_string()))?;
        let depends_on = serde_json::to_string(&agent.depends_on)
            .map_err(|e| DatabaseError::ParseError(e.to_string()))?;

        sqlx::query(
            "UPDATE agents SET agent_name = ?, agent_type = ?, repository_path = ?, status = ?, \
             capabilities = ?, depends_on = ?, claude_pid = ?, convo_session_id = ?, room_id = ?, \
             agent_metadata = ?, last_heartbeat = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&agent.agent_name)
        .bind(&agent.agent_type)
        .bind(&agent.repository_path)
        .bind(agent.status.as_str())
        .bind(capabilities)
        .bind(depends_on)
        .bind(agent.claude_pid.map(i64::from))
        .bind(&agent.convo_session_id)
        .bind(agent.room_id.map(|id| id.to_string()))
        .bind(agent.agent_metadata.to_string())
        .bind(to_rfc3339(agent.last_heartbeat))
        .bind(to_rfc3339(Utc::now()))
        .bind(agent.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_active(&self, id: Uuid, pid: i32) -> Result<bool, DatabaseError> {
        let now = to_rfc3339(Utc::now());
        let result = sqlx::query(
            "UPDATE agents SET status = 'active', claude_pid = ?, last_heartbeat = ?, \
             updated_at = ? WHERE id = ? AND status IN ('initializing', 'active', 'idle')",
        )
        .bind(i64::from(pid))
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, filter: AgentFilter) -> Result<Page<Agent>, DatabaseError> {
        let mut where_clause = String::from(" WHERE 1=1");
        if filter.repository_path.is_some() {
            where_clause.push_str(" AND repository_path = ?");
        }
        if filter.status.is_some() {
            where_clause.push_str(" AND status = ?");
        }

        let count_sql = format!("SELECT COUNT(*) AS n FROM agents{where_clause}");
        let mut count_query = sqlx::query(&count_sql);
        if let Some(ref path) = filter.repository_path {
            count_query = count_query.bind(path.clone());
        }
        if let Some(status) = filter.status {
            count_query = count_query.bind(status.as_str());
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.try_get("n")?;

        let limit = if filter.limit > 0 { filter.limit } else { 50 };
        let sql = format!(
            "SELECT {AGENT_COLUMNS} FROM agents{where_clause} \
             ORDER BY last_heartbeat DESC LIMIT ? OFFSET ?"
        );
        let mut query = sqlx::query(&sql);
        if let Some(ref path) = filter.repository_path {
            query = query.bind(path.clone());
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        let rows = query
            .bind(limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;

        let data = rows
            .iter()
            .map(Self::row_to_agent)
            .collect::<Result<Vec<_>, _>>()?;
        let has_more = filter.offset + (data.len() as i64) < total;

        Ok(Page {
            data,
            total,
            has_more,
        })
    }

    async fn find_active_agents(
        &self,
        repository_path: Option<&str>,
    ) -> Result<Vec<Agent>, DatabaseError> {
        let rows = if let Some(path) = repository_path {
            sqlx::query(&format!(
                "SELECT {AGENT_COLUMNS} FROM agents \
                 WHERE status IN ('active', 'idle') AND repository_path = ? \
                 ORDER BY last_heartbeat DESC"
            ))
            .bind(path)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {AGENT_COLUMNS} FROM agents \
                 WHERE status IN ('active', 'idle') ORDER BY last_heartbeat DESC"
            ))
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(Self::row_to_agent).collect()
    }

    async fn find_non_terminal(&self) -> Result<Vec<Agent>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents \
             WHERE status IN ('initializing', 'active', 'idle') ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_agent).collect()
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Agent>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents \
             WHERE status IN ('active', 'idle') AND last_heartbeat < ? \
             ORDER BY last_heartbeat ASC"
        ))
        .bind(to_rfc3339(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_agent).collect()
    }

    async fn update_heartbeat(&self, id: Uuid) -> Result<(), DatabaseError> {
        let now = to_rfc3339(Utc::now());
        let result = sqlx::query(
            "UPDATE agents SET last_heartbeat = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::QueryFailed(sqlx::Error::RowNotFound));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::DatabaseConnection;

    async fn setup() -> AgentRepositoryImpl {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        AgentRepositoryImpl::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trip() {
        let repo = setup().await;
        let mut agent = Agent::new("builder-1", "/repo").with_type("backend");
        agent.capabilities = vec!["code".into(), "tests".into()];
        agent.claude_pid = Some(4242);

        repo.insert(agent.clone()).await.unwrap();
        let loaded = repo.get(agent.id).await.unwrap().expect("agent missing");

        assert_eq!(loaded.agent_name, "builder-1");
        assert_eq!(loaded.agent_type.as_deref(), Some("backend"));
        assert_eq!(loaded.capabilities, agent.capabilities);
        assert_eq!(loaded.claude_pid, Some(4242));
        assert_eq!(loaded.status, AgentStatus::Initializing);
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let repo = setup().await;
        assert!(repo.get(Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_status_and_path() {
        let repo = setup().await;
        let mut a = Agent::new("a", "/one");
        a.status = AgentStatus::Active;
        let mut b = Agent::new("b", "/one");
        b.status = AgentStatus::Completed;
        let mut c = Agent::new("c", "/two");
        c.status = AgentStatus::Active;
        for agent in [a, b, c] {
            repo.insert(agent).await.unwrap();
        }

        let page = repo
            .list(AgentFilter {
                repository_path: Some("/one".into()),
                status: Some(AgentStatus::Active),
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.data[0].agent_name, "a");
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_find_active_agents_excludes_terminal() {
        let repo = setup().await;
        let mut active = Agent::new("live", "/r");
        active.status = AgentStatus::Active;
        let mut dead = Agent::new("gone", "/r");
        dead.status = AgentStatus::Terminated;
        repo.insert(active).await.unwrap();
        repo.insert(dead).await.unwrap();

        let found = repo.find_active_agents(Some("/r")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_name, "live");
    }

    #[tokio::test]
    async fn test_find_stale_by_heartbeat() {
        let repo = setup().await;
        let mut stale = Agent::new("stale", "/r");
        stale.status = AgentStatus::Active;
        stale.last_heartbeat = Utc::now() - chrono::Duration::minutes(45);
        let mut fresh = Agent::new("fresh", "/r");
        fresh.status = AgentStatus::Active;
        repo.insert(stale).await.unwrap();
        repo.insert(fresh).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(30);
        let found = repo.find_stale(cutoff).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_name, "stale");
    }

    #[tokio::test]
    async fn test_update_heartbeat_missing_agent_fails() {
        let repo = setup().await;
        assert!(repo.update_heartbeat(Uuid::now_v7()).await.is_err());
    }
}
