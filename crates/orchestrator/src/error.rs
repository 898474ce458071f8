//! Error types for the orchestrator.

use thiserror::Error;

/// Result type for orchestrator operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while building or driving the orchestrator.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration is malformed or inconsistent.
    #[error("config error: {0}")]
    Config(String),

    /// An I/O operation failed.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),

    /// The dependency graph rejected a declaration or transition.
    #[error(transparent)]
    Graph(#[from] keel_graph::Error),

    /// The startup sequencer refused to run.
    #[error(transparent)]
    Startup(#[from] keel_startup::Error),

    /// A step or strategy names an action nobody registered.
    #[error("{owner} references unknown action {action}")]
    UnknownAction {
        /// Step or strategy id.
        owner: String,
        /// Missing action id.
        action: String,
    },

    /// A step or strategy names a health check nobody registered.
    #[error("{owner} references unknown health check {health_check}")]
    UnknownHealthCheck {
        /// Step or strategy id.
        owner: String,
        /// Missing health check id.
        health_check: String,
    },

    /// A graph service has no implementation to start.
    #[error("service {0} has no registered implementation")]
    UnknownService(String),

    /// `start` was already called.
    #[error("orchestrator already started")]
    AlreadyStarted,

    /// A service failed to start.
    #[error("service {id} failed to start: {reason}")]
    ServiceStartFailed {
        /// Service id.
        id: String,
        /// Failure detail.
        reason: String,
    },

    /// A service started but never reported healthy.
    #[error("service {id} not healthy within {timeout:?}")]
    ServiceUnhealthy {
        /// Service id.
        id: String,
        /// How long it was given.
        timeout: std::time::Duration,
    },

    /// Pending services can never become ready.
    #[error("structural deadlock: {} service(s) blocked: {}", blocked.len(), blocked.join(", "))]
    StructuralDeadlock {
        /// Blocked service ids with what they wait on.
        blocked: Vec<String>,
    },
}
