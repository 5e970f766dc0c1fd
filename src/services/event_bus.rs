//! Typed event bus for the orchestration runtime.
//!
//! Process-wide pub/sub with filtered subscriptions, per-kind delivery
//! ordering, and an in-memory ring of recent events for debugging.
//! Delivery is at-most-once per live subscription and not durable.
//!
//! The bus is an explicit dependency of every component rather than a
//! singleton; tests build a fresh bus per case.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::error::CoreError;
use crate::domain::models::{
    Agent, AgentStatus, Message, Objective, ObjectiveStatus, Project, ProjectStatus, Room,
};

/// Number of events retained per kind for debugging. Not part of the
/// delivery contract.
const HISTORY_RING_CAPACITY: usize = 1024;

/// Every kind of event the runtime emits. Exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentSpawned,
    AgentStatusChange,
    AgentTerminated,
    AgentResumed,
    ObjectiveCreated,
    ObjectiveUpdate,
    ObjectiveCompleted,
    RoomCreated,
    RoomMessage,
    RoomClosed,
    OrchestrationUpdate,
    OrchestrationCompleted,
    ProgressUpdate,
    SystemError,
    SystemWarning,
    ProjectRegistered,
    ProjectStatusChange,
    ProjectDisconnected,
    ProjectHeartbeat,
    ToolCallStarted,
    ToolCallCompleted,
    ToolCallFailed,
}

impl EventKind {
    /// Every kind, for mirror-style subscribers (dashboard transport).
    pub const ALL: [EventKind; 22] = [
        Self::AgentSpawned,
        Self::AgentStatusChange,
        Self::AgentTerminated,
        Self::AgentResumed,
        Self::ObjectiveCreated,
        Self::ObjectiveUpdate,
        Self::ObjectiveCompleted,
        Self::RoomCreated,
        Self::RoomMessage,
        Self::RoomClosed,
        Self::OrchestrationUpdate,
        Self::OrchestrationCompleted,
        Self::ProgressUpdate,
        Self::SystemError,
        Self::SystemWarning,
        Self::ProjectRegistered,
        Self::ProjectStatusChange,
        Self::ProjectDisconnected,
        Self::ProjectHeartbeat,
        Self::ToolCallStarted,
        Self::ToolCallCompleted,
        Self::ToolCallFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentSpawned => "agent_spawned",
            Self::AgentStatusChange => "agent_status_change",
            Self::AgentTerminated => "agent_terminated",
            Self::AgentResumed => "agent_resumed",
            Self::ObjectiveCreated => "objective_created",
            Self::ObjectiveUpdate => "objective_update",
            Self::ObjectiveCompleted => "objective_completed",
            Self::RoomCreated => "room_created",
            Self::RoomMessage => "room_message",
            Self::RoomClosed => "room_closed",
            Self::OrchestrationUpdate => "orchestration_update",
            Self::OrchestrationCompleted => "orchestration_completed",
            Self::ProgressUpdate => "progress_update",
            Self::SystemError => "system_error",
            Self::SystemWarning => "system_warning",
            Self::ProjectRegistered => "project_registered",
            Self::ProjectStatusChange => "project_status_change",
            Self::ProjectDisconnected => "project_disconnected",
            Self::ProjectHeartbeat => "project_heartbeat",
            Self::ToolCallStarted => "tool_call_started",
            Self::ToolCallCompleted => "tool_call_completed",
            Self::ToolCallFailed => "tool_call_failed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reporting phase carried by `orchestration_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationEventPhase {
    Planning,
    Execution,
    Monitoring,
    Completion,
}

/// Status carried by `orchestration_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationEventStatus {
    Started,
    InProgress,
    Completed,
    Failed,
}

/// Context classification for `progress_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressContextType {
    Agent,
    Orchestration,
    Objective,
    Monitoring,
}

impl ProgressContextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Orchestration => "orchestration",
            Self::Objective => "objective",
            Self::Monitoring => "monitoring",
        }
    }
}

/// Typed payload of one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    AgentSpawned {
        agent: Agent,
        repository_path: String,
    },
    AgentStatusChange {
        agent_id: Uuid,
        previous_status: AgentStatus,
        new_status: AgentStatus,
        repository_path: String,
        metadata: Value,
    },
    AgentTerminated {
        agent_id: Uuid,
        final_status: AgentStatus,
        reason: Option<String>,
        repository_path: String,
    },
    AgentResumed {
        agent_id: Uuid,
        repository_path: String,
    },
    ObjectiveCreated {
        objective: Objective,
        repository_path: String,
    },
    ObjectiveUpdate {
        objective_id: Uuid,
        previous_status: Option<ObjectiveStatus>,
        new_status: ObjectiveStatus,
        assigned_agent_id: Option<Uuid>,
        progress_percentage: Option<u8>,
        repository_path: String,
        metadata: Value,
    },
    ObjectiveCompleted {
        objective_id: Uuid,
        completed_by: Option<Uuid>,
        results: Value,
        repository_path: String,
    },
    RoomCreated {
        room: Room,
        repository_path: String,
    },
    RoomMessage {
        room_name: String,
        message: Message,
        repository_path: String,
    },
    RoomClosed {
        room_name: String,
        repository_path: String,
    },
    OrchestrationUpdate {
        orchestration_id: String,
        phase: OrchestrationEventPhase,
        status: OrchestrationEventStatus,
        agent_count: usize,
        completed_objectives: usize,
        total_objectives: usize,
        repository_path: String,
        metadata: Value,
    },
    OrchestrationCompleted {
        orchestration_id: String,
        success: bool,
        duration_ms: u64,
        final_results: Value,
        repository_path: String,
    },
    ProgressUpdate {
        context_id: String,
        context_type: ProgressContextType,
        agent_id: Option<Uuid>,
        reported_progress: f64,
        message: Option<String>,
        repository_path: String,
    },
    SystemError {
        error: String,
        context: String,
        repository_path: Option<String>,
    },
    SystemWarning {
        error: String,
        context: String,
        repository_path: Option<String>,
    },
    ProjectRegistered {
        project: Project,
        repository_path: String,
    },
    ProjectStatusChange {
        project_id: Uuid,
        previous_status: ProjectStatus,
        new_status: ProjectStatus,
        repository_path: String,
    },
    ProjectDisconnected {
        project_id: Uuid,
        repository_path: String,
    },
    ProjectHeartbeat {
        project_id: Uuid,
        repository_path: String,
    },
    ToolCallStarted {
        payload: Value,
    },
    ToolCallCompleted {
        payload: Value,
    },
    ToolCallFailed {
        payload: Value,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AgentSpawned { .. } => EventKind::AgentSpawned,
            Self::AgentStatusChange { .. } => EventKind::AgentStatusChange,
            Self::AgentTerminated { .. } => EventKind::AgentTerminated,
            Self::AgentResumed { .. } => EventKind::AgentResumed,
            Self::ObjectiveCreated { .. } => EventKind::ObjectiveCreated,
            Self::ObjectiveUpdate { .. } => EventKind::ObjectiveUpdate,
            Self::ObjectiveCompleted { .. } => EventKind::ObjectiveCompleted,
            Self::RoomCreated { .. } => EventKind::RoomCreated,
            Self::RoomMessage { .. } => EventKind::RoomMessage,
            Self::RoomClosed { .. } => EventKind::RoomClosed,
            Self::OrchestrationUpdate { .. } => EventKind::OrchestrationUpdate,
            Self::OrchestrationCompleted { .. } => EventKind::OrchestrationCompleted,
            Self::ProgressUpdate { .. } => EventKind::ProgressUpdate,
            Self::SystemError { .. } => EventKind::SystemError,
            Self::SystemWarning { .. } => EventKind::SystemWarning,
            Self::ProjectRegistered { .. } => EventKind::ProjectRegistered,
            Self::ProjectStatusChange { .. } => EventKind::ProjectStatusChange,
            Self::ProjectDisconnected { .. } => EventKind::ProjectDisconnected,
            Self::ProjectHeartbeat { .. } => EventKind::ProjectHeartbeat,
            Self::ToolCallStarted { .. } => EventKind::ToolCallStarted,
            Self::ToolCallCompleted { .. } => EventKind::ToolCallCompleted,
            Self::ToolCallFailed { .. } => EventKind::ToolCallFailed,
        }
    }

    /// Repository path this event is scoped to, when it has one.
    pub fn repository_path(&self) -> Option<&str> {
        match self {
            Self::AgentSpawned {
                repository_path, ..
            }
            | Self::AgentStatusChange {
                repository_path, ..
            }
            | Self::AgentTerminated {
                repository_path, ..
            }
            | Self::AgentResumed {
                repository_path, ..
            }
            | Self::ObjectiveCreated {
                repository_path, ..
            }
            | Self::ObjectiveUpdate {
                repository_path, ..
            }
            | Self::ObjectiveCompleted {
                repository_path, ..
            }
            | Self::RoomCreated {
                repository_path, ..
            }
            | Self::RoomMessage {
                repository_path, ..
            }
            | Self::RoomClosed {
                repository_path, ..
            }
            | Self::OrchestrationUpdate {
                repository_path, ..
            }
            | Self::OrchestrationCompleted {
                repository_path, ..
            }
            | Self::ProgressUpdate {
                repository_path, ..
            }
            | Self::ProjectRegistered {
                repository_path, ..
            }
            | Self::ProjectStatusChange {
                repository_path, ..
            }
            | Self::ProjectDisconnected {
                repository_path, ..
            }
            | Self::ProjectHeartbeat {
                repository_path, ..
            } => Some(repository_path),
            Self::SystemError {
                repository_path, ..
            }
            | Self::SystemWarning {
                repository_path, ..
            } => repository_path.as_deref(),
            Self::ToolCallStarted { .. }
            | Self::ToolCallCompleted { .. }
            | Self::ToolCallFailed { .. } => None,
        }
    }

    /// Agent id this event concerns, when it has one.
    pub fn agent_id(&self) -> Option<Uuid> {
        match self {
            Self::AgentSpawned { agent, .. } => Some(agent.id),
            Self::AgentStatusChange { agent_id, .. }
            | Self::AgentTerminated { agent_id, .. }
            | Self::AgentResumed { agent_id, .. } => Some(*agent_id),
            Self::ObjectiveCompleted { completed_by, .. } => *completed_by,
            Self::ObjectiveUpdate {
                assigned_agent_id, ..
            } => *assigned_agent_id,
            Self::ProgressUpdate { agent_id, .. } => *agent_id,
            _ => None,
        }
    }

    /// Orchestration id this event concerns, when it has one.
    pub fn orchestration_id(&self) -> Option<&str> {
        match self {
            Self::OrchestrationUpdate {
                orchestration_id, ..
            }
            | Self::OrchestrationCompleted {
                orchestration_id, ..
            } => Some(orchestration_id),
            Self::ProgressUpdate {
                context_id,
                context_type: ProgressContextType::Orchestration,
                ..
            } => Some(context_id),
            _ => None,
        }
    }

    /// Room name this event concerns, when it has one.
    pub fn room_name(&self) -> Option<&str> {
        match self {
            Self::RoomCreated { room, .. } => Some(&room.name),
            Self::RoomMessage { room_name, .. } | Self::RoomClosed { room_name, .. } => {
                Some(room_name)
            }
            _ => None,
        }
    }
}

/// One delivered event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Subscription filter. An unset field matches everything; a set field
/// must equal the event's corresponding attribute.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub repository_path: Option<String>,
    pub agent_id: Option<Uuid>,
    pub orchestration_id: Option<String>,
    pub room_name: Option<String>,
}

impl EventFilter {
    pub fn for_repository(path: impl Into<String>) -> Self {
        Self {
            repository_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn for_agent(agent_id: Uuid) -> Self {
        Self {
            agent_id: Some(agent_id),
            ..Self::default()
        }
    }

    pub fn for_orchestration(orchestration_id: impl Into<String>) -> Self {
        Self {
            orchestration_id: Some(orchestration_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, payload: &EventPayload) -> bool {
        if let Some(ref path) = self.repository_path {
            if payload.repository_path() != Some(path.as_str()) {
                return false;
            }
        }
        if let Some(agent_id) = self.agent_id {
            if payload.agent_id() != Some(agent_id) {
                return false;
            }
        }
        if let Some(ref orchestration_id) = self.orchestration_id {
            if payload.orchestration_id() != Some(orchestration_id.as_str()) {
                return false;
            }
        }
        if let Some(ref room_name) = self.room_name {
            if payload.room_name() != Some(room_name.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Opaque handle to one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    filter: Option<EventFilter>,
    tx: mpsc::UnboundedSender<Event>,
}

struct BusInner {
    next_id: u64,
    closed: bool,
    subscribers: HashMap<EventKind, Vec<Subscriber>>,
    history: HashMap<EventKind, VecDeque<Event>>,
}

/// The process-wide event bus.
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_id: 0,
                closed: false,
                subscribers: HashMap::new(),
                history: HashMap::new(),
            }),
        }
    }

    /// Subscribe to one event kind. Returns the subscription id and the
    /// receiving end of the delivery channel.
    pub fn subscribe(
        &self,
        kind: EventKind,
        filter: Option<EventFilter>,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Event>), CoreError> {
        self.subscribe_many(&[kind], filter)
    }

    /// Subscribe to several kinds over one channel. Delivery stays ordered
    /// per kind; no ordering is guaranteed across kinds.
    pub fn subscribe_many(
        &self,
        kinds: &[EventKind],
        filter: Option<EventFilter>,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Event>), CoreError> {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        if inner.closed {
            return Err(CoreError::TransportUnavailable(
                "event bus is closed to new subscriptions".to_string(),
            ));
        }

        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        let (tx, rx) = mpsc::unbounded_channel();

        for kind in kinds {
            inner.subscribers.entry(*kind).or_default().push(Subscriber {
                id,
                filter: filter.clone(),
                tx: tx.clone(),
            });
        }
        Ok((id, rx))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        for subscribers in inner.subscribers.values_mut() {
            subscribers.retain(|s| s.id != id);
        }
    }

    /// Emit an event. Fire-and-forget: delivery failures only drop the
    /// dead subscription, never affect other subscribers or the emitter.
    pub fn emit(&self, payload: EventPayload) {
        let event = Event::new(payload);
        let kind = event.kind();

        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        let ring = inner.history.entry(kind).or_default();
        if ring.len() >= HISTORY_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(event.clone());

        if let Some(subscribers) = inner.subscribers.get_mut(&kind) {
            subscribers.retain(|subscriber| {
                let wanted = subscriber
                    .filter
                    .as_ref()
                    .is_none_or(|f| f.matches(&event.payload));
                if !wanted {
                    return true;
                }
                match subscriber.tx.send(event.clone()) {
                    Ok(()) => true,
                    Err(_) => {
                        tracing::debug!(kind = %kind, "dropping dead event subscription");
                        false
                    }
                }
            });
        }
    }

    /// Recent events of one kind, oldest first. Debugging aid only.
    pub fn recent(&self, kind: EventKind, limit: usize) -> Vec<Event> {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        inner
            .history
            .get(&kind)
            .map(|ring| {
                ring.iter()
                    .rev()
                    .take(limit)
                    .cloned()
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Close the bus: no new subscriptions, and existing delivery
    /// channels are released. Receivers still drain whatever was already
    /// enqueued, then observe end-of-stream.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("event bus lock poisoned").closed
    }

    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        inner.subscribers.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system_warning(path: Option<&str>) -> EventPayload {
        EventPayload::SystemWarning {
            error: "w".into(),
            context: "test".into(),
            repository_path: path.map(ToString::to_string),
        }
    }

    #[tokio::test]
    async fn test_emit_delivers_to_subscriber() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe(EventKind::SystemWarning, None).unwrap();

        bus.emit(system_warning(Some("/r")));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::SystemWarning);
    }

    #[tokio::test]
    async fn test_filter_by_repository_path() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus
            .subscribe(
                EventKind::SystemWarning,
                Some(EventFilter::for_repository("/wanted")),
            )
            .unwrap();

        bus.emit(system_warning(Some("/other")));
        bus.emit(system_warning(Some("/wanted")));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload.repository_path(), Some("/wanted"));
        assert!(rx.try_recv().is_err(), "filtered event must not arrive");
    }

    #[tokio::test]
    async fn test_delivery_ordered_per_kind() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe(EventKind::ProgressUpdate, None).unwrap();

        for i in 0..10 {
            bus.emit(EventPayload::ProgressUpdate {
                context_id: format!("ctx-{i}"),
                context_type: ProgressContextType::Agent,
                agent_id: None,
                reported_progress: f64::from(i),
                message: None,
                repository_path: "/r".into(),
            });
        }

        for i in 0..10 {
            let event = rx.recv().await.unwrap();
            match event.payload {
                EventPayload::ProgressUpdate { context_id, .. } => {
                    assert_eq!(context_id, format!("ctx-{i}"));
                }
                _ => panic!("wrong payload"),
            }
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe(EventKind::SystemWarning, None).unwrap();
        bus.unsubscribe(id);
        bus.emit(system_warning(None));
        assert!(rx.recv().await.is_none(), "channel closes after unsubscribe");
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_new_subscriptions() {
        let bus = EventBus::new();
        bus.close();
        assert!(bus.subscribe(EventKind::SystemWarning, None).is_err());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned_on_emit() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe(EventKind::SystemWarning, None).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        bus.emit(system_warning(None));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_history_ring_caps_at_capacity() {
        let bus = EventBus::new();
        for _ in 0..(HISTORY_RING_CAPACITY + 10) {
            bus.emit(system_warning(None));
        }
        let recent = bus.recent(EventKind::SystemWarning, usize::MAX);
        assert_eq!(recent.len(), HISTORY_RING_CAPACITY);
    }

    #[tokio::test]
    async fn test_subscribe_many_receives_multiple_kinds() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus
            .subscribe_many(
                &[EventKind::SystemWarning, EventKind::SystemError],
                None,
            )
            .unwrap();

        bus.emit(system_warning(None));
        bus.emit(EventPayload::SystemError {
            error: "e".into(),
            context: "test".into(),
            repository_path: None,
        });

        let kinds = [rx.recv().await.unwrap().kind(), rx.recv().await.unwrap().kind()];
        assert!(kinds.contains(&EventKind::SystemWarning));
        assert!(kinds.contains(&EventKind::SystemError));
    }
}
