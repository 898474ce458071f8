//! Error types for trigger evaluation.

use thiserror::Error;

/// Result type for monitor operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while reading metrics.
///
/// None of these escape [`TriggerMonitor::evaluate`](crate::TriggerMonitor::evaluate);
/// an affected trigger is recorded as not fired for that poll.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The metric path does not resolve in the snapshot.
    #[error("metric {path} missing from snapshot")]
    MissingMetric {
        /// Dotted metric path.
        path: String,
    },

    /// The metric path resolves to something that is not a number or boolean.
    #[error("metric {path} is not numeric")]
    NotNumeric {
        /// Dotted metric path.
        path: String,
    },

    /// The metrics provider failed to produce a snapshot.
    #[error("metrics provider error: {0}")]
    Provider(String),
}
