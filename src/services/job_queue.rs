//! Job queue service over the scrape-job repository: idempotent queueing,
//! lease recovery, retry, and force-unlock.

use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::error::CoreError;
use crate::domain::models::{ScrapeJob, ScrapeJobData, ScrapeJobStatus};
use crate::domain::ports::{Page, ScrapeJobRepository};

use super::event_bus::{EventBus, EventPayload};

pub const DEFAULT_PRIORITY: i32 = 5;

#[derive(Debug, Clone)]
pub struct QueueOutcome {
    pub job: ScrapeJob,
    /// True when an existing pending/running job for the source was
    /// returned instead of a new one.
    pub skipped: bool,
    pub reason: Option<String>,
}

pub struct JobQueueService {
    jobs: Arc<dyn ScrapeJobRepository>,
    bus: Arc<EventBus>,
}

impl JobQueueService {
    pub fn new(jobs: Arc<dyn ScrapeJobRepository>, bus: Arc<EventBus>) -> Self {
        Self { jobs, bus }
    }

    /// Queue a job for a source. Idempotent while a pending or running
    /// job exists for that source.
    pub async fn queue(
        &self,
        source_id: &str,
        params: ScrapeJobData,
        priority: Option<i32>,
    ) -> Result<QueueOutcome, CoreError> {
        if let Some(existing) = self.jobs.find_by_source(source_id).await? {
            if existing.status.blocks_requeue() {
                return Ok(QueueOutcome {
                    reason: Some(format!(
                        "job {} for source {source_id} is already {}",
                        existing.id, existing.status
                    )),
                    job: existing,
                    skipped: true,
                });
            }
        }

        let job = ScrapeJob::new(source_id, params, priority.unwrap_or(DEFAULT_PRIORITY));
        self.jobs.insert(job.clone()).await?;

        self.bus.emit(EventPayload::ToolCallStarted {
            payload: json!({
                "tool": "scrape_queue",
                "job_id": job.id,
                "source_id": source_id,
            }),
        });
        Ok(QueueOutcome {
            job,
            skipped: false,
            reason: None,
        })
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<ScrapeJob>, CoreError> {
        Ok(self.jobs.get(job_id).await?)
    }

    pub async fn list(
        &self,
        status: Option<ScrapeJobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Page<ScrapeJob>, CoreError> {
        Ok(self.jobs.list(status, limit, offset).await?)
    }

    pub async fn cancel_job(&self, job_id: Uuid, reason: &str) -> Result<(), CoreError> {
        self.require(job_id).await?;
        Ok(self.jobs.cancel(job_id, reason).await?)
    }

    /// Rehydrate a failed job back to pending.
    pub async fn retry_job(&self, job_id: Uuid) -> Result<ScrapeJob, CoreError> {
        let job = self.require(job_id).await?;
        if job.status != ScrapeJobStatus::Failed {
            return Err(CoreError::IllegalTransition {
                entity: "scrape_job",
                id: job_id.to_string(),
                from: job.status.as_str().to_string(),
                to: ScrapeJobStatus::Pending.as_str().to_string(),
            });
        }
        Ok(self.jobs.retry(job_id).await?)
    }

    /// Reset running jobs whose lease has lapsed. Returns how many were
    /// recovered.
    pub async fn cleanup_expired_locks(&self) -> Result<usize, CoreError> {
        let recovered = self.jobs.reset_expired_locks().await?;
        for job in &recovered {
            tracing::warn!(job = %job.id, worker = ?job.locked_by, "reset expired job lease");
        }
        Ok(recovered.len())
    }

    pub async fn force_unlock_job(&self, job_id: Uuid, reason: &str) -> Result<(), CoreError> {
        self.require(job_id).await?;
        Ok(self.jobs.force_unlock(job_id, reason).await?)
    }

    /// Force-unlock running jobs that have been held longer than the
    /// threshold, regardless of their lease.
    pub async fn force_unlock_stuck_jobs(
        &self,
        threshold_minutes: i64,
    ) -> Result<usize, CoreError> {
        let running = self
            .jobs
            .list(Some(ScrapeJobStatus::Running), 500, 0)
            .await?;
        let cutoff = chrono::Utc::now() - chrono::Duration::minutes(threshold_minutes);

        let mut unlocked = 0;
        for job in running.data {
            if job.locked_at.is_some_and(|at| at < cutoff) {
                self.jobs
                    .force_unlock(
                        job.id,
                        &format!("force unlocked after {threshold_minutes} minutes"),
                    )
                    .await?;
                unlocked += 1;
            }
        }
        Ok(unlocked)
    }

    pub async fn cleanup_old_jobs(&self, days: i64) -> Result<u64, CoreError> {
        Ok(self.jobs.cleanup_old_jobs(days).await?)
    }

    pub async fn mark_completed(&self, job_id: Uuid, result: Value) -> Result<(), CoreError> {
        self.jobs.mark_completed(job_id, result).await?;
        self.bus.emit(EventPayload::ToolCallCompleted {
            payload: json!({ "tool": "scrape", "job_id": job_id }),
        });
        Ok(())
    }

    pub async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<(), CoreError> {
        self.jobs.mark_failed(job_id, error).await?;
        self.bus.emit(EventPayload::ToolCallFailed {
            payload: json!({ "tool": "scrape", "job_id": job_id, "error": error }),
        });
        Ok(())
    }

    async fn require(&self, job_id: Uuid) -> Result<ScrapeJob, CoreError> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| CoreError::not_found("scrape_job", job_id))
    }
}
