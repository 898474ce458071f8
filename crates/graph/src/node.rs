//! Service nodes and their lifecycle status.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a service node.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ServiceStatus {
    /// Registered, not yet admitted for startup.
    Pending,
    /// Every dependency is running; eligible to start.
    Ready,
    /// Start has been issued, waiting for a passing health check.
    Starting,
    /// Started and passed its health check.
    Running,
    /// Start or health check failed, or the service was rolled back unsuccessfully.
    Failed,
    /// Deliberately stopped.
    Stopped,
}

impl ServiceStatus {
    /// Whether a node in this status may still be brought up by the startup loop.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }

    /// Whether `self -> to` is an allowed lifecycle transition.
    ///
    /// Staying in the same status is always allowed.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        use ServiceStatus::{Failed, Pending, Ready, Running, Starting, Stopped};

        if self as u8 == to as u8 {
            return true;
        }

        matches!(
            (self, to),
            (Pending, Ready | Failed | Stopped)
                | (Ready, Starting | Pending | Failed | Stopped)
                | (Starting, Running | Failed | Stopped)
                | (Running, Failed | Stopped)
                | (Failed, Pending | Ready | Stopped)
                | (Stopped, Pending | Ready | Failed)
        )
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A service in the dependency graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    /// Unique service id.
    pub id: String,

    /// Ids of services that must be running before this one starts.
    pub dependencies: BTreeSet<String>,

    /// Current lifecycle status.
    pub status: ServiceStatus,

    /// When the service last passed a health check.
    pub last_health_check_at: Option<DateTime<Utc>>,

    /// The most recent failure reported for this service.
    pub last_error: Option<String>,
}

impl ServiceNode {
    pub(crate) fn new(id: String, dependencies: BTreeSet<String>) -> Self {
        Self {
            id,
            dependencies,
            status: ServiceStatus::Pending,
            last_health_check_at: None,
            last_error: None,
        }
    }
}
