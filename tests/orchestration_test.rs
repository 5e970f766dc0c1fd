//! End-to-end orchestration scenarios against the full stack with real
//! child processes (stub shell scripts).

mod common;

use common::Stack;
use std::time::Duration;
use zmcp::domain::models::{AgentStatus, ObjectiveStatus};
use zmcp::services::event_bus::{EventKind, EventPayload, OrchestrationEventStatus};
use zmcp::services::orchestrator::{OrchestrationRequest, OrchestrationStatus};

fn request(stack: &Stack, title: &str, objective: &str) -> OrchestrationRequest {
    OrchestrationRequest {
        title: title.to_string(),
        objective: objective.to_string(),
        repository_path: stack.repo_path.clone(),
        skip_research: false,
        skip_monitor: false,
        max_monitor_ms: Some(30_000),
    }
}

#[tokio::test]
async fn test_happy_orchestration_emits_expected_events() {
    let stack = Stack::with_agent_script("exit 0").await;

    let (_s1, mut registered_rx) = stack
        .bus
        .subscribe(EventKind::ProjectRegistered, None)
        .unwrap();
    let (_s2, mut room_rx) = stack.bus.subscribe(EventKind::RoomCreated, None).unwrap();
    let (_s3, mut created_rx) = stack
        .bus
        .subscribe(EventKind::ObjectiveCreated, None)
        .unwrap();
    let (_s4, mut spawned_rx) = stack.bus.subscribe(EventKind::AgentSpawned, None).unwrap();
    let (_s5, mut update_rx) = stack
        .bus
        .subscribe(EventKind::OrchestrationUpdate, None)
        .unwrap();
    let (_s6, mut completed_rx) = stack
        .bus
        .subscribe(EventKind::OrchestrationCompleted, None)
        .unwrap();

    let report = tokio::time::timeout(
        Duration::from_secs(60),
        stack
            .orchestrator
            .run(request(&stack, "Add OAuth", "Add OAuth login")),
    )
    .await
    .expect("orchestration timed out")
    .expect("orchestration errored");

    assert!(report.success, "phases: {:?}", report.phases);
    assert_eq!(report.status, OrchestrationStatus::Completed);
    assert!(report.master_objective_id.is_some());
    assert!(report.room_name.as_deref().unwrap().starts_with("orch-"));
    assert!(!report.spawned_agents.is_empty());

    // One project registration for the fresh path
    assert!(registered_rx.try_recv().is_ok());
    // One coordination room
    let room_event = room_rx.try_recv().unwrap();
    match room_event.payload {
        EventPayload::RoomCreated { room, .. } => {
            assert!(room.name.starts_with("orch-add-oauth-login-"));
        }
        _ => panic!("wrong payload"),
    }
    // Master objective (plus research and sub-objectives)
    assert!(created_rx.try_recv().is_ok());
    // Researcher, architect, then specialists
    let mut spawn_count = 0;
    while spawned_rx.try_recv().is_ok() {
        spawn_count += 1;
    }
    assert!(spawn_count >= 3, "expected researcher + architect + workers");

    // Updates end in a completed terminal update
    let mut last_status = None;
    while let Ok(event) = update_rx.try_recv() {
        if let EventPayload::OrchestrationUpdate { status, .. } = event.payload {
            last_status = Some(status);
        }
    }
    assert_eq!(last_status, Some(OrchestrationEventStatus::Completed));

    // Terminal completion event with success=true
    let done = completed_rx.try_recv().unwrap();
    match done.payload {
        EventPayload::OrchestrationCompleted {
            success,
            orchestration_id,
            ..
        } => {
            assert!(success);
            assert_eq!(orchestration_id, report.orchestration_id);
        }
        _ => panic!("wrong payload"),
    }

    // The master objective reached completed with progress 100
    let master = stack
        .objectives
        .get(report.master_objective_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(master.status, ObjectiveStatus::Completed);
    assert_eq!(master.progress_percentage, Some(100));

    // Cleanup stored a closing summary
    assert_eq!(stack.knowledge.entities().await.len(), 1);
}

#[tokio::test]
async fn test_orchestration_progress_is_monotonic() {
    let stack = Stack::with_agent_script("exit 0").await;
    let (_sub, mut progress_rx) = stack
        .bus
        .subscribe(EventKind::ProgressUpdate, None)
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(60),
        stack
            .orchestrator
            .run(request(&stack, "Refactor", "refactor the parser")),
    )
    .await
    .unwrap()
    .unwrap();

    let mut last: f64 = -1.0;
    while let Ok(event) = progress_rx.try_recv() {
        if let EventPayload::ProgressUpdate {
            reported_progress, ..
        } = event.payload
        {
            assert!(
                reported_progress >= last,
                "progress went backwards: {last} -> {reported_progress}"
            );
            last = reported_progress;
        }
    }
}

#[tokio::test]
async fn test_cancellation_terminates_agents_and_is_idempotent() {
    let stack = Stack::with_agent_script("sleep 30").await;

    let id = stack
        .orchestrator
        .start(request(&stack, "Long job", "implement the long feature"))
        .await
        .unwrap();

    // Let the orchestration spawn at least one agent
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        if let Some(report) = stack.orchestrator.status(&id).await {
            if !report.spawned_agents.is_empty() {
                break;
            }
            if report.status.is_terminal() {
                panic!("orchestration ended early: {report:?}");
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no agents spawned in time"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let (_sub, mut completed_rx) = stack
        .bus
        .subscribe(EventKind::OrchestrationCompleted, None)
        .unwrap();

    stack.orchestrator.cancel_orchestration(&id).await.unwrap();

    let done = tokio::time::timeout(Duration::from_secs(5), completed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    match done.payload {
        EventPayload::OrchestrationCompleted { success, .. } => assert!(!success),
        _ => panic!("wrong payload"),
    }

    // Spawned agents are terminal in the store
    let report = stack.orchestrator.status(&id).await.unwrap();
    assert_eq!(report.status, OrchestrationStatus::Cancelled);
    for agent_id in &report.spawned_agents {
        let agent = stack.agents.get(*agent_id).await.unwrap().unwrap();
        assert!(
            agent.status.is_terminal(),
            "agent {agent_id} still {:?}",
            agent.status
        );
    }

    // Cancelling again is a no-op
    stack.orchestrator.cancel_orchestration(&id).await.unwrap();
    assert!(
        completed_rx.try_recv().is_err(),
        "idempotent cancel must not emit again"
    );
}

#[tokio::test]
async fn test_failing_agents_fail_the_orchestration() {
    let stack = Stack::with_agent_script("exit 3").await;

    let report = tokio::time::timeout(
        Duration::from_secs(60),
        stack
            .orchestrator
            .run(request(&stack, "Doomed", "doomed objective")),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(!report.success);
    assert_eq!(report.status, OrchestrationStatus::Failed);
}

#[tokio::test]
async fn test_terminated_agents_resolve_dependent_waits() {
    // Scenario: B depends on A; A fails; B and C stay untouched.
    let stack = Stack::with_agent_script("exit 0").await;
    let failing = stack.stub_script("failing.sh", "exit 1");
    let sleeping = stack.stub_script("sleeping.sh", "sleep 30");

    use std::collections::HashMap;
    use zmcp::services::agent_service::{ClaudeConfig, CreateAgentRequest};

    let spawn = |name: &str, program: &std::path::Path| CreateAgentRequest {
        agent_name: name.to_string(),
        repository_path: stack.repo_path.clone(),
        objective_description: "work".to_string(),
        agent_type: Some("backend".to_string()),
        capabilities: vec![],
        depends_on: vec![],
        metadata: None,
        auto_create_room: false,
        room_id: None,
        claude_config: ClaudeConfig {
            prompt: "work".to_string(),
            model: None,
            session_id: None,
            environment_vars: HashMap::new(),
            program: program.to_string_lossy().to_string(),
        },
    };

    let a = stack.agents.create_agent(spawn("a", &failing)).await.unwrap();
    let b = stack.agents.create_agent(spawn("b", &sleeping)).await.unwrap();
    let c = stack.agents.create_agent(spawn("c", &sleeping)).await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(20),
        stack.waiter.wait_for_agent_dependencies(
            &[a.id],
            &stack.repo_path,
            zmcp::services::dependency_waiter::WaitOptions {
                timeout_ms: 15_000,
                ..Default::default()
            },
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(!result.success);
    assert_eq!(result.failed, vec![a.id]);
    assert!(result.timed_out.is_empty());

    // Siblings were not touched
    for sibling in [b.id, c.id] {
        let agent = stack.agents.get(sibling).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Active);
    }

    // Cleanup the sleepers
    stack.agents.terminate(b.id).await.unwrap();
    stack.agents.terminate(c.id).await.unwrap();
}
