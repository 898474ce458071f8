//! Rollback trigger evaluation over periodic metrics snapshots.
//!
//! A [`TriggerMonitor`] holds a set of [`RollbackTrigger`]s. Each poll appends
//! one [`RollbackEvent`] per trigger and checks the trigger's [`Window`]
//! against the retained history. When any window is satisfied the monitor
//! names one trigger to act on, highest severity first.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod monitor;
mod snapshot;
mod trigger;
mod window;

pub use error::{Error, Result};
pub use monitor::{
    DEFAULT_MISSING_METRIC_ALERT_AFTER, DEFAULT_POLL_INTERVAL, MonitorOptions, TriggerEvaluation,
    TriggerMonitor,
};
pub use snapshot::{MetricsProvider, MetricsSnapshot};
pub use trigger::{
    Condition, HIGH_ERROR_RATE, MetricCheck, Operator, REPEATED_HEALTH_CHECK_FAILURE,
    REPEATED_SERVICE_FAILURE, RESOURCE_EXHAUSTION, RESPONSE_TIME_DEGRADATION, RollbackEvent,
    RollbackTrigger, Severity, TriggerThresholds,
};
pub use window::Window;
