//! Error types for the startup sequencer.

use thiserror::Error;

use crate::SessionState;

/// Result type for startup operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by [`StartupSequencer`](crate::StartupSequencer).
///
/// Step failures are not errors; they are recorded in the session.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The session already ran (or is running); build a new sequencer to retry.
    #[error("startup session already run (state: {0:?})")]
    AlreadyRun(SessionState),
}
