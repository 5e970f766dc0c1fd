//! Awaits completion of sets of agent or objective dependencies through
//! the event bus, with a global timeout.
//!
//! Semantics are collect-all-settled: every dependency ends up in exactly
//! one of `completed`, `failed`, or `timed_out`, and one failure never
//! aborts the sibling waits unless the caller asked for fail-fast.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use uuid::Uuid;

use crate::domain::error::CoreError;
use crate::domain::models::{AgentStatus, ObjectiveStatus};
use crate::domain::ports::{AgentRepository, ObjectiveRepository};

use super::event_bus::{Event, EventBus, EventFilter, EventKind, EventPayload};

/// Default wait budget: ten minutes.
pub const DEFAULT_TIMEOUT_MS: u64 = 600_000;

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout_ms: u64,
    /// When true, a failed dependency does not abort the remaining waits;
    /// the full completion map is always collected. When false, the first
    /// failure short-circuits and still-pending dependencies land in
    /// `timed_out`.
    pub wait_for_any_failure: bool,
    /// External cancellation: flipping the watch to `true` resolves all
    /// still-pending dependencies as timed out immediately.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            wait_for_any_failure: true,
            cancel: None,
        }
    }
}

/// Outcome of one wait. The three buckets partition the dependency set.
#[derive(Debug, Clone, Serialize)]
pub struct WaitResult {
    pub success: bool,
    pub completed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    pub timed_out: Vec<Uuid>,
    pub message: String,
    pub wait_duration_ms: u64,
}

impl WaitResult {
    fn finish(
        completed: Vec<Uuid>,
        failed: Vec<Uuid>,
        timed_out: Vec<Uuid>,
        started: Instant,
    ) -> Self {
        let success = failed.is_empty() && timed_out.is_empty();
        let message = if success {
            format!("all {} dependencies completed", completed.len())
        } else {
            format!(
                "{} completed, {} failed, {} timed out",
                completed.len(),
                failed.len(),
                timed_out.len()
            )
        };
        Self {
            success,
            completed,
            failed,
            timed_out,
            message,
            wait_duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

pub struct DependencyWaiter {
    agents: Arc<dyn AgentRepository>,
    objectives: Arc<dyn ObjectiveRepository>,
    bus: Arc<EventBus>,
}

enum Settled {
    Completed(Uuid),
    Failed(Uuid),
    None,
}

impl DependencyWaiter {
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        objectives: Arc<dyn ObjectiveRepository>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            agents,
            objectives,
            bus,
        }
    }

    /// Wait for a set of agent ids to reach a terminal state. Each
    /// dependency races three signals: `agent_status_change` into a
    /// terminal status, `agent_terminated`, and `objective_completed`
    /// attributed to the agent. The first arrival wins.
    pub async fn wait_for_agent_dependencies(
        &self,
        depends_on: &[Uuid],
        repository_path: &str,
        options: WaitOptions,
    ) -> Result<WaitResult, CoreError> {
        let started = Instant::now();
        if depends_on.is_empty() {
            return Ok(WaitResult::finish(vec![], vec![], vec![], started));
        }

        // Subscribe before the snapshot so nothing slips between them.
        let (subscription, mut rx) = self.bus.subscribe_many(
            &[
                EventKind::AgentStatusChange,
                EventKind::AgentTerminated,
                EventKind::ObjectiveCompleted,
            ],
            Some(EventFilter::for_repository(repository_path)),
        )?;

        let mut pending: HashSet<Uuid> = depends_on.iter().copied().collect();
        let mut completed = Vec::new();
        let mut failed = Vec::new();

        for &agent_id in depends_on {
            let Some(agent) = self.agents.get(agent_id).await? else {
                // A dependency that does not exist can never complete.
                pending.remove(&agent_id);
                failed.push(agent_id);
                continue;
            };
            if agent.status.is_terminal() {
                pending.remove(&agent_id);
                if agent.status == AgentStatus::Completed {
                    completed.push(agent_id);
                } else {
                    failed.push(agent_id);
                }
            }
        }

        let result = self
            .collect(
                pending,
                completed,
                failed,
                started,
                &mut rx,
                &options,
                Self::settle_agent_event,
            )
            .await;
        self.bus.unsubscribe(subscription);
        Ok(result)
    }

    /// Wait for the dependencies of an objective (its
    /// `requirements.dependencies` list) to complete.
    pub async fn wait_for_objective_dependencies(
        &self,
        objective_id: Uuid,
        repository_path: &str,
        options: WaitOptions,
    ) -> Result<WaitResult, CoreError> {
        let started = Instant::now();
        let objective = self
            .objectives
            .get(objective_id)
            .await?
            .ok_or_else(|| CoreError::not_found("objective", objective_id))?;
        let depends_on = objective.dependencies().to_vec();
        if depends_on.is_empty() {
            return Ok(WaitResult::finish(vec![], vec![], vec![], started));
        }

        let (subscription, mut rx) = self.bus.subscribe_many(
            &[EventKind::ObjectiveCompleted, EventKind::ObjectiveUpdate],
            Some(EventFilter::for_repository(repository_path)),
        )?;

        let mut pending: HashSet<Uuid> = depends_on.iter().copied().collect();
        let mut completed = Vec::new();
        let mut failed = Vec::new();

        for &dep_id in &depends_on {
            let Some(dep) = self.objectives.get(dep_id).await? else {
                pending.remove(&dep_id);
                failed.push(dep_id);
                continue;
            };
            match dep.status {
                ObjectiveStatus::Completed => {
                    pending.remove(&dep_id);
                    completed.push(dep_id);
                }
                ObjectiveStatus::Failed => {
                    pending.remove(&dep_id);
                    failed.push(dep_id);
                }
                _ => {}
            }
        }

        let result = self
            .collect(
                pending,
                completed,
                failed,
                started,
                &mut rx,
                &options,
                Self::settle_objective_event,
            )
            .await;
        self.bus.unsubscribe(subscription);
        Ok(result)
    }

    /// Drain events until the pending set empties, the budget lapses, or
    /// cancellation fires.
    #[allow(clippy::too_many_arguments)]
    async fn collect(
        &self,
        mut pending: HashSet<Uuid>,
        mut completed: Vec<Uuid>,
        mut failed: Vec<Uuid>,
        started: Instant,
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>,
        options: &WaitOptions,
        settle: impl Fn(&Event, &HashSet<Uuid>) -> Settled,
    ) -> WaitResult {
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_millis(options.timeout_ms);
        let mut cancel = options.cancel.clone();

        while !pending.is_empty() {
            if !options.wait_for_any_failure && !failed.is_empty() {
                // Fail-fast: the rest resolves as timed out.
                let timed_out: Vec<Uuid> = pending.drain().collect();
                return WaitResult::finish(completed, failed, timed_out, started);
            }

            let event = tokio::select! {
                event = rx.recv() => event,
                () = tokio::time::sleep_until(deadline) => None,
                changed = wait_cancelled(&mut cancel) => {
                    if changed {
                        let timed_out: Vec<Uuid> = pending.drain().collect();
                        return WaitResult::finish(completed, failed, timed_out, started);
                    }
                    continue;
                }
            };

            let Some(event) = event else {
                // Timeout or bus gone: everything still pending timed out.
                let timed_out: Vec<Uuid> = pending.drain().collect();
                return WaitResult::finish(completed, failed, timed_out, started);
            };

            match settle(&event, &pending) {
                Settled::Completed(id) => {
                    pending.remove(&id);
                    completed.push(id);
                }
                Settled::Failed(id) => {
                    pending.remove(&id);
                    failed.push(id);
                }
                Settled::None => {}
            }
        }

        WaitResult::finish(completed, failed, vec![], started)
    }

    fn settle_agent_event(event: &Event, pending: &HashSet<Uuid>) -> Settled {
        match &event.payload {
            EventPayload::AgentStatusChange {
                agent_id,
                new_status,
                ..
            } if pending.contains(agent_id) && new_status.is_terminal() => {
                if *new_status == AgentStatus::Completed {
                    Settled::Completed(*agent_id)
                } else {
                    Settled::Failed(*agent_id)
                }
            }
            EventPayload::AgentTerminated {
                agent_id,
                final_status,
                ..
            } if pending.contains(agent_id) => {
                if *final_status == AgentStatus::Completed {
                    Settled::Completed(*agent_id)
                } else {
                    Settled::Failed(*agent_id)
                }
            }
            EventPayload::ObjectiveCompleted {
                completed_by: Some(agent_id),
                ..
            } if pending.contains(agent_id) => Settled::Completed(*agent_id),
            _ => Settled::None,
        }
    }

    fn settle_objective_event(event: &Event, pending: &HashSet<Uuid>) -> Settled {
        match &event.payload {
            EventPayload::ObjectiveCompleted { objective_id, .. }
                if pending.contains(objective_id) =>
            {
                Settled::Completed(*objective_id)
            }
            EventPayload::ObjectiveUpdate {
                objective_id,
                new_status: ObjectiveStatus::Failed,
                ..
            } if pending.contains(objective_id) => Settled::Failed(*objective_id),
            _ => Settled::None,
        }
    }
}

/// Resolve when the cancel watch flips to true; pend forever without one.
async fn wait_cancelled(cancel: &mut Option<watch::Receiver<bool>>) -> bool {
    match cancel {
        Some(rx) => {
            if *rx.borrow() {
                return true;
            }
            match rx.changed().await {
                Ok(()) => *rx.borrow(),
                Err(_) => false,
            }
        }
        None => {
            std::future::pending::<()>().await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Agent;
    use crate::infrastructure::database::{
        AgentRepositoryImpl, DatabaseConnection, ObjectiveRepositoryImpl,
    };
    use serde_json::Value;

    struct Fixture {
        waiter: DependencyWaiter,
        agents: Arc<AgentRepositoryImpl>,
        bus: Arc<EventBus>,
    }

    async fn setup() -> Fixture {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let agents = Arc::new(AgentRepositoryImpl::new(db.pool().clone()));
        let objectives = Arc::new(ObjectiveRepositoryImpl::new(db.pool().clone()));
        let bus = Arc::new(EventBus::new());
        Fixture {
            waiter: DependencyWaiter::new(agents.clone(), objectives, Arc::clone(&bus)),
            agents,
            bus,
        }
    }

    async fn insert_agent(fixture: &Fixture, status: AgentStatus) -> Uuid {
        let mut agent = Agent::new("dep", "/r");
        agent.status = status;
        let id = agent.id;
        fixture.agents.insert(agent).await.unwrap();
        id
    }

    fn quick(timeout_ms: u64) -> WaitOptions {
        WaitOptions {
            timeout_ms,
            ..WaitOptions::default()
        }
    }

    #[tokio::test]
    async fn test_empty_set_succeeds_immediately() {
        let fixture = setup().await;
        let result = fixture
            .waiter
            .wait_for_agent_dependencies(&[], "/r", quick(10))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.completed.is_empty());
    }

    #[tokio::test]
    async fn test_already_terminal_short_circuits() {
        let fixture = setup().await;
        let done = insert_agent(&fixture, AgentStatus::Completed).await;
        let dead = insert_agent(&fixture, AgentStatus::Failed).await;

        let result = fixture
            .waiter
            .wait_for_agent_dependencies(&[done, dead], "/r", quick(50))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.completed, vec![done]);
        assert_eq!(result.failed, vec![dead]);
        assert!(result.timed_out.is_empty());
    }

    #[tokio::test]
    async fn test_event_resolves_pending_dependency() {
        let fixture = setup().await;
        let agent_id = insert_agent(&fixture, AgentStatus::Active).await;

        let bus = Arc::clone(&fixture.bus);
        let emitter = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            bus.emit(EventPayload::AgentTerminated {
                agent_id,
                final_status: AgentStatus::Completed,
                reason: None,
                repository_path: "/r".to_string(),
            });
        });

        let result = fixture
            .waiter
            .wait_for_agent_dependencies(&[agent_id], "/r", quick(5_000))
            .await
            .unwrap();
        emitter.await.unwrap();
        assert!(result.success);
        assert_eq!(result.completed, vec![agent_id]);
    }

    #[tokio::test]
    async fn test_timeout_partitions_the_set() {
        let fixture = setup().await;
        let never = insert_agent(&fixture, AgentStatus::Active).await;
        let done = insert_agent(&fixture, AgentStatus::Completed).await;

        let result = fixture
            .waiter
            .wait_for_agent_dependencies(&[never, done], "/r", quick(50))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.completed, vec![done]);
        assert_eq!(result.timed_out, vec![never]);
        assert_eq!(
            result.completed.len() + result.failed.len() + result.timed_out.len(),
            2
        );
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_siblings() {
        let fixture = setup().await;
        let failing = insert_agent(&fixture, AgentStatus::Active).await;
        let succeeding = insert_agent(&fixture, AgentStatus::Active).await;

        let bus = Arc::clone(&fixture.bus);
        let emitter = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            bus.emit(EventPayload::AgentTerminated {
                agent_id: failing,
                final_status: AgentStatus::Failed,
                reason: Some("boom".into()),
                repository_path: "/r".to_string(),
            });
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            bus.emit(EventPayload::AgentTerminated {
                agent_id: succeeding,
                final_status: AgentStatus::Completed,
                reason: None,
                repository_path: "/r".to_string(),
            });
        });

        let result = fixture
            .waiter
            .wait_for_agent_dependencies(&[failing, succeeding], "/r", quick(5_000))
            .await
            .unwrap();
        emitter.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failed, vec![failing]);
        assert_eq!(result.completed, vec![succeeding]);
    }

    #[tokio::test]
    async fn test_cancellation_resolves_as_timeout() {
        let fixture = setup().await;
        let agent_id = insert_agent(&fixture, AgentStatus::Active).await;
        let (tx, rx) = watch::channel(false);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let result = fixture
            .waiter
            .wait_for_agent_dependencies(
                &[agent_id],
                "/r",
                WaitOptions {
                    timeout_ms: 60_000,
                    wait_for_any_failure: true,
                    cancel: Some(rx),
                },
            )
            .await
            .unwrap();
        canceller.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.timed_out, vec![agent_id]);
        assert!(result.wait_duration_ms < 10_000);
    }

    #[tokio::test]
    async fn test_missing_dependency_counts_as_failed() {
        let fixture = setup().await;
        let ghost = Uuid::now_v7();
        let result = fixture
            .waiter
            .wait_for_agent_dependencies(&[ghost], "/r", quick(50))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.failed, vec![ghost]);
    }

    #[tokio::test]
    async fn test_objective_completed_event_attributed_to_agent() {
        let fixture = setup().await;
        let agent_id = insert_agent(&fixture, AgentStatus::Active).await;

        let bus = Arc::clone(&fixture.bus);
        let emitter = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            bus.emit(EventPayload::ObjectiveCompleted {
                objective_id: Uuid::now_v7(),
                completed_by: Some(agent_id),
                results: Value::Null,
                repository_path: "/r".to_string(),
            });
        });

        let result = fixture
            .waiter
            .wait_for_agent_dependencies(&[agent_id], "/r", quick(5_000))
            .await
            .unwrap();
        emitter.await.unwrap();
        assert!(result.success);
        assert_eq!(result.completed, vec![agent_id]);
    }
}
