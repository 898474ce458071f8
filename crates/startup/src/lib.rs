//! Ordered, deadline-bounded execution of process-level startup steps.
//!
//! Each [`StartupStep`] runs its action, then polls its health check until it
//! passes or the step's deadline expires. A failed critical step halts the
//! sequence; non-critical failures are recorded and the sequence continues.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod sequencer;
mod session;
mod step;

pub use error::{Error, Result};
pub use sequencer::{DEFAULT_HEALTH_POLL_INTERVAL, SequencerOptions, StartupSequencer};
pub use session::{
    AggregateHealth, SessionState, StartupReport, StartupSession, StepInfo, StepOutcome,
    StepResult,
};
pub use step::{DEFAULT_STEP_TIMEOUT, StartupStep};
