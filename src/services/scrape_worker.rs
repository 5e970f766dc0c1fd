//! Scrape worker: a cooperative loop that leases jobs from the queue,
//! drives the page fetcher collaborator, and reports progress with
//! persistence throttling.
//!
//! Each worker claims one job at a time; the pool spawns
//! `max_concurrent_jobs` workers. A worker holding a lease has exclusive
//! write rights to that job's mutable fields.

use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use uuid::Uuid;

use crate::domain::error::CoreError;
use crate::domain::models::{ScrapeJob, WorkerConfig};
use crate::domain::ports::{PageFetcher, ScrapeJobRepository};

use super::event_bus::{EventBus, EventPayload};
use super::job_queue::JobQueueService;

/// Persist progress at most every 5 pages or 60 seconds; heartbeat the
/// row every 10 seconds in between.
const PERSIST_PAGE_STRIDE: u32 = 5;
const PERSIST_INTERVAL_SECS: u64 = 60;
const HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// Decision for one progress observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistAction {
    Persist,
    Touch,
    Skip,
}

/// Throttle state for one running job.
pub struct ProgressThrottle {
    last_persisted_pages: u32,
    last_persist: Instant,
    last_touch: Instant,
}

impl ProgressThrottle {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            last_persisted_pages: 0,
            last_persist: now,
            last_touch: now,
        }
    }

    pub fn observe(&mut self, pages: u32) -> PersistAction {
        let now = Instant::now();
        if pages >= self.last_persisted_pages + PERSIST_PAGE_STRIDE
            || now.duration_since(self.last_persist).as_secs() >= PERSIST_INTERVAL_SECS
        {
            self.last_persisted_pages = pages;
            self.last_persist = now;
            self.last_touch = now;
            return PersistAction::Persist;
        }
        if now.duration_since(self.last_touch).as_secs() >= HEARTBEAT_INTERVAL_SECS {
            self.last_touch = now;
            return PersistAction::Touch;
        }
        PersistAction::Skip
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ScrapeWorker {
    worker_id: String,
    jobs: Arc<dyn ScrapeJobRepository>,
    queue: Arc<JobQueueService>,
    fetcher: Arc<dyn PageFetcher>,
    bus: Arc<EventBus>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl ScrapeWorker {
    pub fn new(
        worker_id: impl Into<String>,
        jobs: Arc<dyn ScrapeJobRepository>,
        queue: Arc<JobQueueService>,
        fetcher: Arc<dyn PageFetcher>,
        bus: Arc<EventBus>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            jobs,
            queue,
            fetcher,
            bus,
            config,
            shutdown,
        }
    }

    /// Spawn a pool of `max_concurrent_jobs` workers sharing a shutdown
    /// signal.
    pub fn spawn_pool(
        jobs: Arc<dyn ScrapeJobRepository>,
        queue: Arc<JobQueueService>,
        fetcher: Arc<dyn PageFetcher>,
        bus: Arc<EventBus>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        (0..config.max_concurrent_jobs.max(1))
            .map(|index| {
                let worker = ScrapeWorker::new(
                    format!("scrape-worker-{index}-{}", Uuid::now_v7().simple()),
                    jobs.clone(),
                    queue.clone(),
                    fetcher.clone(),
                    bus.clone(),
                    config.clone(),
                    shutdown.clone(),
                );
                tokio::spawn(async move { worker.run().await })
            })
            .collect()
    }

    /// The worker loop: recover expired leases, claim a job, process it,
    /// settle it exactly once, then poll again.
    pub async fn run(mut self) {
        tracing::info!(worker = %self.worker_id, "scrape worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if let Err(e) = self.queue.cleanup_expired_locks().await {
                tracing::warn!(error = %e, "expired lock cleanup failed");
            }

            let claimed = self
                .jobs
                .lock_next_pending(&self.worker_id, self.config.job_timeout_seconds)
                .await;

            match claimed {
                Ok(Some(job)) => {
                    // The current job always flushes its settlement, even
                    // during shutdown.
                    self.process(job).await;
                }
                Ok(None) => {
                    let sleep = std::time::Duration::from_millis(self.config.poll_interval_ms);
                    tokio::select! {
                        () = tokio::time::sleep(sleep) => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "job claim failed");
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.config.poll_interval_ms,
                    ))
                    .await;
                }
            }
        }
        tracing::info!(worker = %self.worker_id, "scrape worker stopped");
    }

    /// Process one claimed job and settle it exactly once.
    async fn process(&self, job: ScrapeJob) {
        let job_id = job.id;
        self.bus.emit(EventPayload::ToolCallStarted {
            payload: json!({
                "tool": "scrape",
                "job_id": job_id,
                "source_id": job.source_id,
                "worker_id": self.worker_id,
            }),
        });

        match self.crawl(&job).await {
            Ok((pages, visited)) => {
                // Final progress always lands before completion.
                if let Err(e) = self.jobs.update_progress(job_id, pages).await {
                    tracing::warn!(job = %job_id, error = %e, "final progress write failed");
                }
                let result = json!({ "pages_scraped": pages, "visited": visited });
                if let Err(e) = self.queue.mark_completed(job_id, result).await {
                    tracing::warn!(job = %job_id, error = %e, "completion write failed");
                }
            }
            Err(e) => {
                if let Err(write_err) = self.queue.mark_failed(job_id, &e.to_string()).await {
                    tracing::warn!(job = %job_id, error = %write_err, "failure write failed");
                }
            }
        }
    }

    /// Breadth-first crawl bounded by `max_pages`. A job with
    /// `max_pages=0` or no start URL completes successfully with zero
    /// pages.
    async fn crawl(&self, job: &ScrapeJob) -> Result<(u32, Vec<String>), CoreError> {
        let max_pages = job.job_data.max_pages;
        let Some(start) = job.job_data.url.clone() else {
            return Ok((0, Vec::new()));
        };
        if max_pages == 0 {
            return Ok((0, Vec::new()));
        }

        let mut throttle = ProgressThrottle::new();
        let mut frontier: VecDeque<String> = VecDeque::from([start]);
        let mut seen: HashSet<String> = HashSet::new();
        let mut visited = Vec::new();
        let mut pages: u32 = 0;

        while let Some(url) = frontier.pop_front() {
            if pages >= max_pages || *self.shutdown.borrow() {
                break;
            }
            if !seen.insert(url.clone()) {
                continue;
            }

            let page = self.fetcher.fetch(&url).await?;
            pages += 1;
            visited.push(page.url.clone());

            for link in page.links {
                if self.link_allowed(job, &link) && !seen.contains(&link) {
                    frontier.push_back(link);
                }
            }

            match throttle.observe(pages) {
                PersistAction::Persist => {
                    self.jobs.update_progress(job.id, pages).await?;
                }
                PersistAction::Touch => {
                    self.jobs.touch(job.id).await?;
                }
                PersistAction::Skip => {}
            }
        }

        Ok((pages, visited))
    }

    fn link_allowed(&self, job: &ScrapeJob, link: &str) -> bool {
        let data = &job.job_data;
        if data
            .ignore_patterns
            .iter()
            .any(|pattern| link.contains(pattern.as_str()))
        {
            return false;
        }
        data.allow_patterns.is_empty()
            || data
                .allow_patterns
                .iter()
                .any(|pattern| link.contains(pattern.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ScrapeJobData, ScrapeJobStatus};
    use crate::domain::ports::FetchedPage;
    use crate::infrastructure::database::{DatabaseConnection, ScrapeJobRepositoryImpl};
    use async_trait::async_trait;

    /// Fetcher serving a small synthetic site.
    struct FakeFetcher;

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, CoreError> {
            if url.contains("broken") {
                return Err(CoreError::TransportUnavailable(format!("fetch {url}")));
            }
            let links = match url {
                "https://site/a" => vec![
                    "https://site/b".to_string(),
                    "https://site/skip-me".to_string(),
                ],
                "https://site/b" => vec!["https://site/c".to_string()],
                _ => vec![],
            };
            Ok(FetchedPage {
                url: url.to_string(),
                content: format!("content of {url}"),
                links,
            })
        }
    }

    struct Fixture {
        jobs: Arc<ScrapeJobRepositoryImpl>,
        queue: Arc<JobQueueService>,
        worker: ScrapeWorker,
        _shutdown_tx: watch::Sender<bool>,
    }

    async fn setup() -> Fixture {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let jobs = Arc::new(ScrapeJobRepositoryImpl::new(db.pool().clone()));
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(JobQueueService::new(jobs.clone(), bus.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = ScrapeWorker::new(
            "test-worker",
            jobs.clone(),
            queue.clone(),
            Arc::new(FakeFetcher),
            bus,
            WorkerConfig::default(),
            shutdown_rx,
        );
        Fixture {
            jobs,
            queue,
            worker,
            _shutdown_tx: shutdown_tx,
        }
    }

    async fn queue_and_claim(fixture: &Fixture, data: ScrapeJobData) -> ScrapeJob {
        fixture
            .queue
            .queue("src", data, None)
            .await
            .unwrap();
        fixture
            .jobs
            .lock_next_pending("test-worker", 600)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_crawl_respects_max_pages_and_patterns() {
        let fixture = setup().await;
        let job = queue_and_claim(
            &fixture,
            ScrapeJobData {
                url: Some("https://site/a".to_string()),
                max_pages: 10,
                ignore_patterns: vec!["skip".to_string()],
                ..ScrapeJobData::default()
            },
        )
        .await;

        fixture.worker.process(job.clone()).await;
        let done = fixture.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, ScrapeJobStatus::Completed);
        assert_eq!(done.pages_scraped, 3, "a, b, c but never skip-me");
    }

    #[tokio::test]
    async fn test_zero_max_pages_completes_with_no_pages() {
        let fixture = setup().await;
        let job = queue_and_claim(
            &fixture,
            ScrapeJobData {
                url: Some("https://site/a".to_string()),
                max_pages: 0,
                ..ScrapeJobData::default()
            },
        )
        .await;

        fixture.worker.process(job.clone()).await;
        let done = fixture.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, ScrapeJobStatus::Completed);
        assert_eq!(done.pages_scraped, 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_marks_job_failed_once() {
        let fixture = setup().await;
        let job = queue_and_claim(
            &fixture,
            ScrapeJobData {
                url: Some("https://site/broken".to_string()),
                max_pages: 5,
                ..ScrapeJobData::default()
            },
        )
        .await;

        fixture.worker.process(job.clone()).await;
        let done = fixture.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, ScrapeJobStatus::Failed);
        assert!(done.error_message.as_ref().unwrap().contains("broken"));
        assert!(done.lease_consistent());
    }

    #[test]
    fn test_throttle_page_stride() {
        let mut throttle = ProgressThrottle::new();
        assert_eq!(throttle.observe(1), PersistAction::Skip);
        assert_eq!(throttle.observe(4), PersistAction::Skip);
        assert_eq!(throttle.observe(5), PersistAction::Persist);
        assert_eq!(throttle.observe(6), PersistAction::Skip);
        assert_eq!(throttle.observe(10), PersistAction::Persist);
    }

    #[tokio::test]
    async fn test_max_pages_one_stops_at_first_page() {
        let fixture = setup().await;
        let job = queue_and_claim(
            &fixture,
            ScrapeJobData {
                url: Some("https://site/a".to_string()),
                max_pages: 1,
                ..ScrapeJobData::default()
            },
        )
        .await;

        fixture.worker.process(job.clone()).await;
        let done = fixture.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.pages_scraped, 1);
    }
}
