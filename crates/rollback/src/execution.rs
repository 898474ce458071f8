//! Records of rollback attempts.

use std::fmt;

use chrono::{DateTime, Utc};
use keel_monitor::Severity;
use serde::{Deserialize, Serialize};

/// How a single strategy attempt ended.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    /// Action completed and validation passed.
    Succeeded,
    /// Action failed, timed out, or validation did not pass.
    Failed,
}

/// One strategy attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackExecution {
    /// Strategy id.
    pub strategy_id: String,

    /// Trigger that caused the rollback.
    pub trigger_id: String,

    /// When the action was invoked.
    pub started_at: DateTime<Utc>,

    /// When validation finished.
    pub finished_at: DateTime<Utc>,

    /// Outcome.
    pub outcome: ExecutionOutcome,

    /// Whether validation ran and passed.
    pub validation_passed: bool,

    /// Failure detail, if any.
    pub error: Option<String>,
}

/// How a whole rollback ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackOutcome {
    /// A strategy validated; the system is back to a known-good state.
    Succeeded {
        /// Strategy that succeeded.
        strategy_id: String,
    },
    /// Every applicable strategy failed. Operator intervention required.
    Fatal,
    /// An operator stopped escalation after a failed strategy.
    Halted,
    /// Not attempted, because another rollback was in flight or the
    /// coordinator is waiting for an operator.
    Skipped,
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded { strategy_id } => write!(f, "succeeded via {strategy_id}"),
            Self::Fatal => f.write_str("fatal"),
            Self::Halted => f.write_str("halted"),
            Self::Skipped => f.write_str("skipped"),
        }
    }
}

/// Result of one call to [`RollbackCoordinator::execute`](crate::RollbackCoordinator::execute).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Trigger that caused the rollback.
    pub trigger_id: String,

    /// Trigger severity.
    pub severity: Severity,

    /// Outcome.
    pub outcome: RollbackOutcome,

    /// Strategy attempts in the order they ran.
    pub executions: Vec<RollbackExecution>,
}

impl RollbackReport {
    /// Whether the system was restored.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, RollbackOutcome::Succeeded { .. })
    }
}

/// Coordinator lifecycle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CoordinatorState {
    /// No rollback in flight.
    Idle = 0,
    /// A rollback holds the in-flight guard.
    Executing = 1,
    /// All strategies failed; nothing further happens automatically.
    ManualInterventionRequired = 2,
}

impl CoordinatorState {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Executing,
            _ => Self::ManualInterventionRequired,
        }
    }
}
