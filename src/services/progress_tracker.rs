//! Monotonic progress aggregation with throttled reporting.
//!
//! Per `(context_id, context_type)` the tracker keeps the last reported
//! progress and enforces monotonic non-decrease under concurrent reports
//! (compare-and-set under one lock). Emission is throttled: at most one
//! `progress_update` per second or per five-point move, whichever comes
//! sooner; reaching 100 always emits immediately.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::event_bus::{EventBus, EventPayload, ProgressContextType};

const THROTTLE_WINDOW_MS: u128 = 1_000;
const THROTTLE_DELTA: f64 = 5.0;

/// Identity of one tracked context. The repository path scopes the
/// emitted `progress_update` events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey {
    pub context_id: String,
    pub context_type: ProgressContextType,
    pub repository_path: String,
}

impl ContextKey {
    pub fn new(
        context_id: impl Into<String>,
        context_type: ProgressContextType,
        repository_path: impl Into<String>,
    ) -> Self {
        Self {
            context_id: context_id.into(),
            context_type,
            repository_path: repository_path.into(),
        }
    }
}

#[derive(Debug)]
struct ContextState {
    progress: f64,
    updated_at: DateTime<Utc>,
    last_emit_at: Option<Instant>,
    last_emitted: f64,
    /// Agent-scoped contributions for aggregate contexts.
    contributors: HashMap<Uuid, f64>,
}

impl ContextState {
    fn new() -> Self {
        Self {
            progress: 0.0,
            updated_at: Utc::now(),
            last_emit_at: None,
            last_emitted: 0.0,
            contributors: HashMap::new(),
        }
    }
}

/// Outcome of one report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportOutcome {
    /// The stored (possibly clamped) progress after this report.
    pub reported_progress: f64,
    /// Whether a `progress_update` was emitted for this report.
    pub emitted: bool,
}

/// Aggregate view of a context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextProgress {
    pub total_progress: f64,
    pub agent_count: usize,
}

pub struct ProgressTracker {
    bus: Arc<EventBus>,
    contexts: Mutex<HashMap<ContextKey, ContextState>>,
}

impl ProgressTracker {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Report progress for a context. A report lower than the stored
    /// value leaves the value unchanged (but bumps `updated_at` and may
    /// still emit a no-change update).
    pub async fn report_context_progress(
        &self,
        key: &ContextKey,
        agent_id: Option<Uuid>,
        progress: f64,
        message: Option<String>,
    ) -> ReportOutcome {
        let clamped = progress.clamp(0.0, 100.0);
        let mut contexts = self.contexts.lock().await;
        let state = contexts.entry(key.clone()).or_insert_with(ContextState::new);

        if let Some(agent_id) = agent_id {
            let entry = state.contributors.entry(agent_id).or_insert(0.0);
            *entry = entry.max(clamped);
        }

        // Compare-and-set: monotonic non-decrease.
        let effective = state.progress.max(clamped);
        state.progress = effective;
        state.updated_at = Utc::now();

        let now = Instant::now();
        let due = match state.last_emit_at {
            None => true,
            Some(last) => {
                now.duration_since(last).as_millis() >= THROTTLE_WINDOW_MS
                    || (effective - state.last_emitted).abs() >= THROTTLE_DELTA
            }
        };
        let emitted = due || (effective >= 100.0 && state.last_emitted < 100.0);

        if emitted {
            state.last_emit_at = Some(now);
            state.last_emitted = effective;
            self.bus.emit(EventPayload::ProgressUpdate {
                context_id: key.context_id.clone(),
                context_type: key.context_type,
                agent_id,
                reported_progress: effective,
                message,
                repository_path: key.repository_path.clone(),
            });
        }

        ReportOutcome {
            reported_progress: effective,
            emitted,
        }
    }

    /// Aggregate progress for a context: equal-weight average of
    /// agent-scoped children when present, otherwise the context's own
    /// stored progress.
    pub async fn get_context_progress(&self, key: &ContextKey) -> ContextProgress {
        let contexts = self.contexts.lock().await;
        match contexts.get(key) {
            Some(state) if !state.contributors.is_empty() => {
                let sum: f64 = state.contributors.values().sum();
                ContextProgress {
                    total_progress: sum / state.contributors.len() as f64,
                    agent_count: state.contributors.len(),
                }
            }
            Some(state) => ContextProgress {
                total_progress: state.progress,
                agent_count: 0,
            },
            None => ContextProgress {
                total_progress: 0.0,
                agent_count: 0,
            },
        }
    }

    /// Build an updater handle for a context that also forwards to an
    /// external transport sender when one is attached.
    pub fn progress_updater(
        self: &Arc<Self>,
        key: ContextKey,
        sender: Option<ProgressSender>,
    ) -> ProgressUpdater {
        ProgressUpdater {
            tracker: Arc::clone(self),
            key,
            sender,
        }
    }
}

/// External transport callback for progress notifications.
pub type ProgressSender = Arc<dyn Fn(f64, Option<&str>) + Send + Sync>;

/// Opaque updater bound to one context.
#[derive(Clone)]
pub struct ProgressUpdater {
    tracker: Arc<ProgressTracker>,
    key: ContextKey,
    sender: Option<ProgressSender>,
}

impl ProgressUpdater {
    pub async fn update(&self, progress: f64, message: Option<String>) -> ReportOutcome {
        let outcome = self
            .tracker
            .report_context_progress(&self.key, None, progress, message.clone())
            .await;
        if let Some(ref sender) = self.sender {
            sender(outcome.reported_progress, message.as_deref());
        }
        outcome
    }
}
