//! Structured notifications for rollback firings, escalations and fatal
//! conditions.

use std::fmt;

use chrono::{DateTime, Utc};
use keel_monitor::Severity;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// What happened.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A trigger fired and a rollback started.
    Fired,
    /// A strategy failed; moving to the next one.
    Escalated,
    /// A strategy validated.
    Succeeded,
    /// An operator stopped escalation.
    Halted,
    /// Every strategy failed.
    Fatal,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fired => "fired",
            Self::Escalated => "escalated",
            Self::Succeeded => "succeeded",
            Self::Halted => "halted",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// A structured rollback notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// What happened.
    pub kind: NotificationKind,
    /// Trigger id.
    pub trigger_id: String,
    /// Trigger severity.
    pub severity: Severity,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Short outcome label.
    pub outcome: String,
    /// Strategy involved, if any.
    pub strategy_id: Option<String>,
    /// Free-form detail.
    pub detail: Option<String>,
}

/// Receives rollback notifications. Implementations must not block.
pub trait NotificationSink
where
    Self: Send + Sync,
{
    /// Deliver one notification.
    fn notify(&self, event: &NotificationEvent);
}

/// Writes notifications as structured `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, event: &NotificationEvent) {
        let trigger_id = event.trigger_id.as_str();
        let outcome = event.outcome.as_str();
        let strategy = event.strategy_id.as_deref().unwrap_or("-");
        let detail = event.detail.as_deref().unwrap_or("");

        match event.kind {
            NotificationKind::Fatal => error!(
                trigger_id,
                severity = %event.severity,
                timestamp = %event.timestamp,
                outcome,
                strategy,
                "rollback fatal, manual intervention required: {}",
                detail
            ),
            NotificationKind::Escalated | NotificationKind::Halted => warn!(
                trigger_id,
                severity = %event.severity,
                timestamp = %event.timestamp,
                outcome,
                strategy,
                "rollback {}: {}",
                event.kind,
                detail
            ),
            NotificationKind::Fired | NotificationKind::Succeeded => info!(
                trigger_id,
                severity = %event.severity,
                timestamp = %event.timestamp,
                outcome,
                strategy,
                "rollback {}",
                event.kind
            ),
        }
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<NotificationEvent>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications received so far.
    #[must_use]
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().clone()
    }

    /// Kinds received so far, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

impl NotificationSink for CollectingSink {
    fn notify(&self, event: &NotificationEvent) {
        self.events.lock().push(event.clone());
    }
}
