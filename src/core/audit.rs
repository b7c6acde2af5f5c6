//! Audit trail of task lifecycle events.
//!
//! Sinks receive one event per transition the scheduler drives (create,
//! start, finish, fail, reset, expire). The in-memory sink keeps a bounded
//! ring buffer for tests and dev dashboards.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::util::clock::now_ms;

/// What happened to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Task submitted.
    Create,
    /// Task claimed and marked RUNNING.
    Start,
    /// Start lost the version race.
    Stale,
    /// Process succeeded.
    Finish,
    /// Process failed.
    Fail,
    /// Orphaned RUNNING tasks reclassified.
    Reset,
    /// FINISHED tasks purged by retention.
    Expire,
}

impl AuditAction {
    /// Stable name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stale => "stale",
            Self::Finish => "finish",
            Self::Fail => "fail",
            Self::Reset => "reset",
            Self::Expire => "expire",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit event structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Related task identifier (`batch` for bulk operations).
    pub task_id: String,
    /// Activity code (`*` for bulk operations).
    pub activity_code: String,
    /// Action taken.
    pub action: AuditAction,
    /// Timestamp milliseconds.
    pub created_at_ms: u64,
    /// Additional context.
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// Audit sink shared between the scheduler and detached task completions.
pub type SharedAuditSink = Arc<Mutex<Box<dyn AuditSink>>>;

/// Record into an optional shared sink.
pub fn record_audit(sink: Option<&SharedAuditSink>, event: AuditEvent) {
    if let Some(sink) = sink {
        sink.lock().record(event);
    }
}

/// In-memory audit sink for testing and dev.
///
/// Clones share the same buffer, so a test can keep one handle and box the
/// other into the scheduler.
#[derive(Clone)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events of one action, oldest first.
    pub fn events_for(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Sink that forwards events to `tracing` at INFO under the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&mut self, event: AuditEvent) {
        tracing::info!(
            target: "audit",
            event_id = %event.event_id,
            task_id = %event.task_id,
            activity = %event.activity_code,
            action = %event.action,
            detail = event.detail.as_deref().unwrap_or(""),
            "task audit"
        );
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    task_id: impl Into<String>,
    activity_code: impl Into<String>,
    action: AuditAction,
    detail: Option<String>,
) -> AuditEvent {
    let task_id = task_id.into();
    let created_at_ms = now_ms();
    AuditEvent {
        event_id: format!("{task_id}-{action}-{created_at_ms}"),
        task_id,
        activity_code: activity_code.into(),
        action,
        created_at_ms,
        detail,
    }
}
