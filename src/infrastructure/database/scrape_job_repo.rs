//! SQLite implementation of `ScrapeJobRepository`.
//!
//! The lease claim runs inside one transaction: select the best pending
//! job, stamp the lease, commit. The transaction boundary is the
//! serialization point, so at most one worker ever sees a given job.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::error::DatabaseError;
use crate::domain::models::{ScrapeJob, ScrapeJobStatus};
use crate::domain::ports::{Page, ScrapeJobRepository};

use super::row::{parse_json, parse_status, parse_ts, parse_ts_opt, parse_uuid, to_rfc3339};

pub struct ScrapeJobRepositoryImpl {
    pool: SqlitePool,
}

const JOB_COLUMNS: &str = "id, source_id, job_data, status, priority, locked_by, locked_at, \
     lock_timeout_seconds, pages_scraped, started_at, completed_at, error_message, result_data, \
     created_at, updated_at";

impl ScrapeJobRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &SqliteRow) -> Result<ScrapeJob, DatabaseError> {
        let id: String = row.try_get("id")?;
        let job_data: String = row.try_get("job_data")?;
        let status: String = row.try_get("status")?;
        let locked_at: Option<String> = row.try_get("locked_at")?;
        let started_at: Option<String> = row.try_get("started_at")?;
        let completed_at: Option<String> = row.try_get("completed_at")?;
        let result_data: Option<String> = row.try_get("result_data")?;
        let pages_scraped: i64 = row.try_get("pages_scraped")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(ScrapeJob {
            id: parse_uuid("scrape_jobs.id", &id)?,
            source_id: row.try_get("source_id")?,
            job_data: parse_json("scrape_jobs.job_data", &job_data)?,
            status: parse_status("scrape_jobs.status", &status, ScrapeJobStatus::from_str)?,
            priority: row.try_get::<i64, _>("priority")? as i32,
            locked_by: row.try_get("locked_by")?,
            locked_at: parse_ts_opt("scrape_jobs.locked_at", locked_at.as_deref())?,
            lock_timeout_seconds: row.try_get("lock_timeout_seconds")?,
            pages_scraped: u32::try_from(pages_scraped).map_err(|_| {
                DatabaseError::ParseError(format!(
                    "scrape_jobs.pages_scraped: out of range {pages_scraped}"
                ))
            })?,
            started_at: parse_ts_opt("scrape_jobs.started_at", started_at.as_deref())?,
            completed_at: parse_ts_opt("scrape_jobs.completed_at", completed_at.as_deref())?,
            error_message: row.try_get("error_message")?,
            result_data: result_data
                .as_deref()
                .map(|raw| parse_json("scrape_jobs.result_data", raw))
                .transpose()?,
            created_at: parse_ts("scrape_jobs.created_at", &created_at)?,
            updated_at: parse_ts("scrape_jobs.updated_at", &updated_at)?,
        })
    }
}

#[async_trait]
impl ScrapeJobRepository for ScrapeJobRepositoryImpl {
    async fn insert(&self, job: ScrapeJob) -> Result<(), DatabaseError> {
        let job_data = serde_json::to_string(&job.job_data)
            .map_err(|e| DatabaseError::ParseError(e.to_string()))?;

        sqlx::query(
            "INSERT INTO scrape_jobs (id, source_id, job_data, status, priority, locked_by, \
             locked_at, lock_timeout_seconds, pages_scraped, started_at, completed_at, \
             error_message, result_data, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(&job.source_id)
        .bind(job_data)
        .bind(job.status.as_str())
        .bind(i64::from(job.priority))
        .bind(&job.locked_by)
        .bind(job.locked_at.map(to_rfc3339))
        .bind(job.lock_timeout_seconds)
        .bind(i64::from(job.pages_scraped))
        .bind(job.started_at.map(to_rfc3339))
        .bind(job.completed_at.map(to_rfc3339))
        .bind(&job.error_message)
        .bind(job.result_data.as_ref().map(ToString::to_string))
        .bind(to_rfc3339(job.created_at))
        .bind(to_rfc3339(job.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScrapeJob>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn update(&self, job: ScrapeJob) -> Result<(), DatabaseError> {
        let job_data = serde_json::to_string(&job.job_data)
            .map_err(|e| DatabaseError::ParseError(e.to_string()))?;

        sqlx::query(
            "UPDATE scrape_jobs SET source_id = ?, job_data = ?, status = ?, priority = ?, \
             locked_by = ?, locked_at = ?, lock_timeout_seconds = ?, pages_scraped = ?, \
             started_at = ?, completed_at = ?, error_message = ?, result_data = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(&job.source_id)
        .bind(job_data)
        .bind(job.status.as_str())
        .bind(i64::from(job.priority))
        .bind(&job.locked_by)
        .bind(job.locked_at.map(to_rfc3339))
        .bind(job.lock_timeout_seconds)
        .bind(i64::from(job.pages_scraped))
        .bind(job.started_at.map(to_rfc3339))
        .bind(job.completed_at.map(to_rfc3339))
        .bind(&job.error_message)
        .bind(job.result_data.as_ref().map(ToString::to_string))
        .bind(to_rfc3339(Utc::now()))
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_source(&self, source_id: &str) -> Result<Option<ScrapeJob>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE source_id = ? \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn lock_next_pending(
        &self,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<ScrapeJob>, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scrape_jobs \
             WHERE status = 'pending' AND locked_by IS NULL \
             ORDER BY priority ASC, created_at ASC LIMIT 1"
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let mut job = Self::row_to_job(&row)?;

        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE scrape_jobs SET status = 'running', locked_by = ?, locked_at = ?, \
             lock_timeout_seconds = ?, started_at = ?, updated_at = ? \
             WHERE id = ? AND locked_by IS NULL",
        )
        .bind(worker_id)
        .bind(to_rfc3339(now))
        .bind(lease_seconds)
        .bind(to_rfc3339(now))
        .bind(to_rfc3339(now))
        .bind(job.id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if updated.rows_affected() == 0 {
            // Another worker won the race between select and update.
            return Ok(None);
        }

        job.status = ScrapeJobStatus::Running;
        job.locked_by = Some(worker_id.to_string());
        job.locked_at = Some(now);
        job.lock_timeout_seconds = lease_seconds;
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job))
    }

    async fn find_expired_locks(&self) -> Result<Vec<ScrapeJob>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE status = 'running'"
        ))
        .fetch_all(&self.pool)
        .await?;

        let now = Utc::now();
        let mut expired = Vec::new();
        for row in &rows {
            let job = Self::row_to_job(row)?;
            if job.lock_expired(now) {
                expired.push(job);
            }
        }
        Ok(expired)
    }

    async fn reset_expired_locks(&self) -> Result<Vec<ScrapeJob>, DatabaseError> {
        let expired = self.find_expired_locks().await?;
        for job in &expired {
            sqlx::query(
                "UPDATE scrape_jobs SET status = 'pending', locked_by = NULL, locked_at = NULL, \
                 error_message = 'Job lock expired and was reset', updated_at = ? WHERE id = ?",
            )
            .bind(to_rfc3339(Utc::now()))
            .bind(job.id.to_string())
            .execute(&self.pool)
            .await?;
        }
        Ok(expired)
    }

    async fn mark_completed(&self, id: Uuid, result: Value) -> Result<(), DatabaseError> {
        let now = to_rfc3339(Utc::now());
        sqlx::query(
            "UPDATE scrape_jobs SET status = 'completed', locked_by = NULL, locked_at = NULL, \
             completed_at = ?, result_data = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(result.to_string())
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        let now = to_rfc3339(Utc::now());
        sqlx::query(
            "UPDATE scrape_jobs SET status = 'failed', locked_by = NULL, locked_at = NULL, \
             completed_at = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(error)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError> {
        let now = to_rfc3339(Utc::now());
        sqlx::query(
            "UPDATE scrape_jobs SET status = 'cancelled', locked_by = NULL, locked_at = NULL, \
             completed_at = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(reason)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry(&self, id: Uuid) -> Result<ScrapeJob, DatabaseError> {
        sqlx::query(
            "UPDATE scrape_jobs SET status = 'pending', locked_by = NULL, locked_at = NULL, \
             started_at = NULL, completed_at = NULL, error_message = NULL, pages_scraped = 0, \
             updated_at = ? WHERE id = ?",
        )
        .bind(to_rfc3339(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        self.get(id)
            .await?
            .ok_or(DatabaseError::QueryFailed(sqlx::Error::RowNotFound))
    }

    async fn force_unlock(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE scrape_jobs SET status = 'pending', locked_by = NULL, locked_at = NULL, \
             error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(reason)
        .bind(to_rfc3339(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_progress(&self, id: Uuid, pages_scraped: u32) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE scrape_jobs SET pages_scraped = ?, updated_at = ? WHERE id = ?",
        )
        .bind(i64::from(pages_scraped))
        .bind(to_rfc3339(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch(&self, id: Uuid) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE scrape_jobs SET updated_at = ? WHERE id = ?")
            .bind(to_rfc3339(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cleanup_old_jobs(&self, days: i64) -> Result<u64, DatabaseError> {
        let cutoff = Utc::now() - Duration::days(days);
        let result = sqlx::query(
            "DELETE FROM scrape_jobs \
             WHERE status IN ('completed', 'failed', 'cancelled', 'timeout') AND updated_at < ?",
        )
        .bind(to_rfc3339(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list(
        &self,
        status: Option<ScrapeJobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Page<ScrapeJob>, DatabaseError> {
        let mut where_clause = String::new();
        if status.is_some() {
            where_clause.push_str(" WHERE status = ?");
        }

        let count_sql = format!("SELECT COUNT(*) AS n FROM scrape_jobs{where_clause}");
        let mut count_query = sqlx::query(&count_sql);
        if let Some(s) = status {
            count_query = count_query.bind(s.as_str());
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.try_get("n")?;

        let limit = if limit > 0 { limit } else { 50 };
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM scrape_jobs{where_clause} \
             ORDER BY priority ASC, created_at ASC LIMIT ? OFFSET ?"
        );
        let mut query = sqlx::query(&sql);
        if let Some(s) = status {
            query = query.bind(s.as_str());
        }
        let rows = query.bind(limit).bind(offset).fetch_all(&self.pool).await?;

        let data = rows
            .iter()
            .map(Self::row_to_job)
            .collect::<Result<Vec<_>, _>>()?;
        let has_more = offset + (data.len() as i64) < total;

        Ok(Page {
            data,
            total,
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ScrapeJobData;
    use crate::infrastructure::database::DatabaseConnection;

    async fn setup() -> ScrapeJobRepositoryImpl {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        ScrapeJobRepositoryImpl::new(db.pool().clone())
    }

    fn job(source: &str, priority: i32) -> ScrapeJob {
        ScrapeJob::new(source, ScrapeJobData::default(), priority)
    }

    #[tokio::test]
    async fn test_lock_claims_lowest_priority_earliest_created() {
        let repo = setup().await;
        repo.insert(job("later", 5)).await.unwrap();
        repo.insert(job("urgent", 1)).await.unwrap();

        let claimed = repo.lock_next_pending("w1", 60).await.unwrap().unwrap();
        assert_eq!(claimed.source_id, "urgent");
        assert_eq!(claimed.status, ScrapeJobStatus::Running);
        assert_eq!(claimed.locked_by.as_deref(), Some("w1"));
        assert!(claimed.locked_at.is_some());
        assert!(claimed.lease_consistent());
    }

    #[tokio::test]
    async fn test_lock_skips_running_jobs() {
        let repo = setup().await;
        repo.insert(job("only", 5)).await.unwrap();

        let first = repo.lock_next_pending("w1", 60).await.unwrap();
        assert!(first.is_some());
        let second = repo.lock_next_pending("w2", 60).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_expired_lock_recovery() {
        let repo = setup().await;
        repo.insert(job("s", 5)).await.unwrap();
        let claimed = repo.lock_next_pending("w1", 0).await.unwrap().unwrap();

        // lease_seconds=0 expires immediately
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let expired = repo.find_expired_locks().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, claimed.id);

        let reset = repo.reset_expired_locks().await.unwrap();
        assert_eq!(reset.len(), 1);

        let job = repo.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(job.status, ScrapeJobStatus::Pending);
        assert!(job.locked_by.is_none());
        assert_eq!(
            job.error_message.as_deref(),
            Some("Job lock expired and was reset")
        );

        // The recovered job is claimable again
        let reclaimed = repo.lock_next_pending("w2", 60).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, claimed.id);
        assert_eq!(reclaimed.locked_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_mark_completed_clears_lease() {
        let repo = setup().await;
        repo.insert(job("s", 5)).await.unwrap();
        let claimed = repo.lock_next_pending("w1", 60).await.unwrap().unwrap();

        repo.mark_completed(claimed.id, serde_json::json!({"pages": 3}))
            .await
            .unwrap();
        let done = repo.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(done.status, ScrapeJobStatus::Completed);
        assert!(done.lease_consistent());
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_rehydrates_failed_job() {
        let repo = setup().await;
        repo.insert(job("s", 5)).await.unwrap();
        let claimed = repo.lock_next_pending("w1", 60).await.unwrap().unwrap();
        repo.mark_failed(claimed.id, "boom").await.unwrap();

        let retried = repo.retry(claimed.id).await.unwrap();
        assert_eq!(retried.status, ScrapeJobStatus::Pending);
        assert!(retried.locked_by.is_none());
        assert!(retried.started_at.is_none());
        assert!(retried.completed_at.is_none());
        assert!(retried.error_message.is_none());
        assert_eq!(retried.pages_scraped, 0);
    }

    #[tokio::test]
    async fn test_cleanup_old_jobs_spares_recent_and_pending() {
        let repo = setup().await;
        repo.insert(job("old-done", 5)).await.unwrap();
        repo.insert(job("pending", 5)).await.unwrap();

        let claimed = repo.lock_next_pending("w1", 60).await.unwrap().unwrap();
        repo.mark_completed(claimed.id, Value::Null).await.unwrap();

        // Nothing is older than 7 days yet
        assert_eq!(repo.cleanup_old_jobs(7).await.unwrap(), 0);
        // Everything terminal qualifies at -1 days
        assert_eq!(repo.cleanup_old_jobs(-1).await.unwrap(), 1);
        assert_eq!(
            repo.list(None, 10, 0).await.unwrap().total,
            1,
            "pending job must survive"
        );
    }
}
