//! Scrape job model.
//!
//! Jobs are claimed under a time-bounded lease: `running` always means a
//! worker holds the lock, and an expired lease is recoverable by resetting
//! the job to `pending`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl Default for ScrapeJobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl ScrapeJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Terminal statuses are sticky until explicitly retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Statuses that make a new `queue()` call for the same source a no-op.
    pub fn blocks_requeue(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for ScrapeJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters for a scrape job, stored as `job_data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeJobData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_patterns: Vec<String>,
    #[serde(default)]
    pub max_pages: u32,
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub source_id: String,
    #[serde(default)]
    pub job_data: ScrapeJobData,
    pub status: ScrapeJobStatus,
    /// Lower value = higher priority.
    pub priority: i32,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_timeout_seconds: i64,
    pub pages_scraped: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScrapeJob {
    pub fn new(source_id: impl Into<String>, job_data: ScrapeJobData, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            source_id: source_id.into(),
            job_data,
            status: ScrapeJobStatus::Pending,
            priority,
            locked_by: None,
            locked_at: None,
            lock_timeout_seconds: 3600,
            pages_scraped: 0,
            started_at: None,
            completed_at: None,
            error_message: None,
            result_data: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the lease has been held past its timeout.
    pub fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.locked_at) {
            (ScrapeJobStatus::Running, Some(locked_at)) => {
                now - locked_at > Duration::seconds(self.lock_timeout_seconds)
            }
            _ => false,
        }
    }

    /// Invariant check: `running` iff lease fields are populated.
    pub fn lease_consistent(&self) -> bool {
        if self.status == ScrapeJobStatus::Running {
            self.locked_by.is_some() && self.locked_at.is_some()
        } else {
            self.locked_by.is_none() && self.locked_at.is_none()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_expiry() {
        let mut job = ScrapeJob::new("src-1", ScrapeJobData::default(), 5);
        job.status = ScrapeJobStatus::Running;
        job.locked_by = Some("worker-1".into());
        job.lock_timeout_seconds = 5;
        job.locked_at = Some(Utc::now() - Duration::seconds(10));
        assert!(job.lock_expired(Utc::now()));

        job.locked_at = Some(Utc::now());
        assert!(!job.lock_expired(Utc::now()));
    }

    #[test]
    fn test_pending_job_never_expires() {
        let job = ScrapeJob::new("src-1", ScrapeJobData::default(), 5);
        assert!(!job.lock_expired(Utc::now() + Duration::days(365)));
    }

    #[test]
    fn test_lease_consistency() {
        let mut job = ScrapeJob::new("src-1", ScrapeJobData::default(), 5);
        assert!(job.lease_consistent());

        job.status = ScrapeJobStatus::Running;
        assert!(!job.lease_consistent());

        job.locked_by = Some("w".into());
        job.locked_at = Some(Utc::now());
        assert!(job.lease_consistent());
    }

    #[test]
    fn test_requeue_blocking() {
        assert!(ScrapeJobStatus::Pending.blocks_requeue());
        assert!(ScrapeJobStatus::Running.blocks_requeue());
        assert!(!ScrapeJobStatus::Failed.blocks_requeue());
        assert!(!ScrapeJobStatus::Completed.blocks_requeue());
    }
}
