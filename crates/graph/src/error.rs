//! Error types for dependency graph operations.

use thiserror::Error;

use crate::ServiceStatus;

/// Result type for dependency graph operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Structural errors raised by the dependency graph. None of these are retried.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A service with this id is already registered.
    #[error("service {0} is already registered")]
    DuplicateService(String),

    /// A declared dependency does not reference a registered service.
    #[error("service {service} depends on unknown service {dependency}")]
    UnknownDependency {
        /// The service declaring the dependency.
        service: String,
        /// The missing dependency id.
        dependency: String,
    },

    /// The dependency edges contain a cycle.
    #[error("cyclic dependency between services: {}", cycle_nodes.join(" -> "))]
    CyclicDependency {
        /// Services on the detected cycle, in edge order.
        cycle_nodes: Vec<String>,
    },

    /// The requested status change is not allowed.
    #[error("invalid transition for service {id}: {from} -> {to}")]
    InvalidTransition {
        /// The service id.
        id: String,
        /// Current status.
        from: ServiceStatus,
        /// Requested status.
        to: ServiceStatus,
    },

    /// A service cannot become ready while a dependency is not running.
    #[error("service {id} cannot become ready, waiting on: {}", waiting_on.join(", "))]
    DependenciesNotRunning {
        /// The service id.
        id: String,
        /// Dependencies that are not running.
        waiting_on: Vec<String>,
    },

    /// No service with this id is registered.
    #[error("unknown service {0}")]
    UnknownService(String),

    /// The graph changed (or was never validated) since the last `validate()`.
    #[error("dependency graph has not been validated")]
    NotValidated,
}
