//! Error types for rollback execution.

use std::time::Duration;

use thiserror::Error;

/// Result type for rollback operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a single strategy did not restore the system.
///
/// These are recorded on the [`RollbackExecution`](crate::RollbackExecution)
/// and drive escalation; they never escape
/// [`RollbackCoordinator::execute`](crate::RollbackCoordinator::execute).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The strategy's action returned an error.
    #[error("strategy {strategy_id} failed: {reason}")]
    StrategyFailed {
        /// Strategy id.
        strategy_id: String,
        /// Error reported by the action.
        reason: String,
    },

    /// The strategy's action exceeded the strategy timeout.
    #[error("strategy {strategy_id} did not finish within {timeout:?}")]
    StrategyTimedOut {
        /// Strategy id.
        strategy_id: String,
        /// Configured timeout.
        timeout: Duration,
    },

    /// The action completed but validation did not pass.
    #[error("strategy {strategy_id} did not validate")]
    ValidationFailed {
        /// Strategy id.
        strategy_id: String,
    },

    /// A relaunched service failed to start.
    #[error("strategy {strategy_id}: service {service_id} failed to start: {reason}")]
    ServiceStartFailed {
        /// Strategy id.
        strategy_id: String,
        /// Service id.
        service_id: String,
        /// Error reported by the service.
        reason: String,
    },

    /// A relaunched service did not report healthy.
    #[error("strategy {strategy_id}: service {service_id} is not healthy")]
    ServiceUnhealthy {
        /// Strategy id.
        strategy_id: String,
        /// Service id.
        service_id: String,
    },

    /// A graph status update was rejected.
    #[error(transparent)]
    Graph(#[from] keel_graph::Error),
}
