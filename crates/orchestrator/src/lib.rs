//! Service lifecycle orchestration.
//!
//! An [`Orchestrator`] is built from an [`OrchestratorConfig`] and a
//! [`Registry`](keel_bootable::Registry) of concrete services, actions and
//! health checks. It validates the service graph, runs the startup steps, and
//! once startup completes, watches metrics and answers satisfied triggers
//! with escalating rollback.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod command;
mod config;
mod error;
mod metrics_file;
mod orchestrator;
mod serde_duration;
mod services;

pub use command::{CommandAction, CommandHealthCheck, CommandService};
pub use config::{
    ALWAYS_HEALTHY_CHECK, CommandConfig, MonitorConfig, OrchestratorConfig, RollbackConfig,
    SERVICES_RUNNING_CHECK, START_SERVICES_ACTION, ServiceConfig, StartupConfig, StepConfig,
    StrategyConfig, ThresholdsConfig,
};
pub use error::{Error, Result};
pub use metrics_file::FileMetricsProvider;
pub use orchestrator::{DECISION_CHANNEL_CAPACITY, Orchestrator, OrchestratorState};
pub use services::{BringUpOptions, ServicesRunning, StartServices};
