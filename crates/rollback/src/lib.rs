//! Escalating rollback with a single in-flight guard.
//!
//! A [`RollbackCoordinator`] answers a satisfied trigger by running the
//! applicable [`RollbackStrategy`]s from smallest to largest blast radius
//! until one validates. If none does, the coordinator stops and waits for an
//! operator.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod coordinator;
mod error;
mod execution;
mod notification;
mod strategy;

pub use coordinator::{
    CoordinatorOptions, DEFAULT_HEALTH_POLL_INTERVAL, DEFAULT_SERVICE_TIMEOUT,
    DEFAULT_STRATEGY_TIMEOUT, RollbackCoordinator,
};
pub use error::{Error, Result};
pub use execution::{
    CoordinatorState, ExecutionOutcome, RollbackExecution, RollbackOutcome, RollbackReport,
};
pub use notification::{
    CollectingSink, NotificationEvent, NotificationKind, NotificationSink, TracingSink,
};
pub use strategy::{RollbackScope, RollbackStrategy};
