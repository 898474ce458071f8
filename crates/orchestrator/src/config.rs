//! Orchestrator configuration, loaded from a single JSON document.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keel_monitor::{DEFAULT_MISSING_METRIC_ALERT_AFTER, DEFAULT_POLL_INTERVAL, TriggerThresholds};
use keel_rollback::{DEFAULT_STRATEGY_TIMEOUT, RollbackScope};
use keel_startup::{DEFAULT_HEALTH_POLL_INTERVAL, DEFAULT_STEP_TIMEOUT};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::serde_duration;

/// Id of the built-in action that brings graph services up.
pub const START_SERVICES_ACTION: &str = "start-services";

/// Id of the built-in health check that passes once every service runs.
pub const SERVICES_RUNNING_CHECK: &str = "services-running";

/// Id of the built-in health check that always passes.
pub const ALWAYS_HEALTHY_CHECK: &str = "always";

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Services and their dependencies.
    pub services: Vec<ServiceConfig>,

    /// Startup steps, in execution order. When empty and services are
    /// declared, a single critical `start-services` step is used.
    pub steps: Vec<StepConfig>,

    /// Rollback strategies.
    pub strategies: Vec<StrategyConfig>,

    /// Named commands, usable as actions and health checks by id.
    pub commands: BTreeMap<String, CommandConfig>,

    /// Trigger monitor settings.
    pub monitor: MonitorConfig,

    /// Rollback settings.
    pub rollback: RollbackConfig,

    /// Startup settings.
    pub startup: StartupConfig,

    /// JSON file read on every monitor poll.
    pub metrics_file: Option<PathBuf>,
}

/// One graph service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service id.
    pub id: String,

    /// Services that must be running first.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Long-running process backing the service.
    #[serde(default)]
    pub command: Option<CommandConfig>,

    /// Probe run to decide whether the service is healthy.
    #[serde(default)]
    pub health_command: Option<CommandConfig>,
}

/// One startup step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Step id.
    pub id: String,

    /// Display name. Defaults to the id.
    #[serde(default)]
    pub name: Option<String>,

    /// Action id.
    pub action: String,

    /// Health check id. Defaults to one that always passes.
    #[serde(default)]
    pub health_check: Option<String>,

    /// Deadline for action plus health check.
    #[serde(default = "default_step_timeout", with = "serde_duration")]
    pub timeout: Duration,

    /// Whether failure halts startup.
    #[serde(default = "default_true")]
    pub critical: bool,
}

/// One rollback strategy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Strategy id.
    pub id: String,

    /// Lower runs first.
    pub priority: u32,

    /// Blast radius.
    pub scope: RollbackScope,

    /// Action id.
    pub action: String,

    /// Validation health check id. Defaults to `services-running`.
    #[serde(default)]
    pub validate: Option<String>,

    /// Services reverted by this strategy.
    #[serde(default)]
    pub services: Vec<String>,

    /// Triggers answered. Empty means all.
    #[serde(default)]
    pub triggers: Vec<String>,
}

/// An external program.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Program to execute.
    pub program: String,

    /// Arguments.
    pub args: Vec<String>,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,

    /// Working directory.
    pub working_dir: Option<PathBuf>,
}

/// Trigger monitor settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Delay between polls.
    #[serde(with = "serde_duration")]
    pub poll_interval: Duration,

    /// Consecutive missing-metric polls that raise a warning.
    pub missing_metric_alert_after: u32,

    /// Overrides for the standard trigger thresholds.
    pub thresholds: ThresholdsConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            missing_metric_alert_after: DEFAULT_MISSING_METRIC_ALERT_AFTER,
            thresholds: ThresholdsConfig::default(),
        }
    }
}

/// Partial overrides for [`TriggerThresholds`]. Unset fields keep defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    /// Error ratio above which a poll fires.
    pub error_rate: Option<f64>,
    /// How long the error ratio must stay high.
    #[serde(with = "serde_duration::option")]
    pub error_rate_window: Option<Duration>,
    /// Failed transitions needed within the window.
    pub service_failures: Option<f64>,
    /// Window for failed transitions.
    #[serde(with = "serde_duration::option")]
    pub service_failure_window: Option<Duration>,
    /// Average response time, in seconds, above which a poll fires.
    pub response_time_seconds: Option<f64>,
    /// How long response time must stay high.
    #[serde(with = "serde_duration::option")]
    pub response_time_window: Option<Duration>,
    /// Memory high-water mark, percent.
    pub memory_percent: Option<f64>,
    /// CPU high-water mark, percent.
    pub cpu_percent: Option<f64>,
    /// Disk high-water mark, percent.
    pub disk_percent: Option<f64>,
    /// Failed health checks needed within the window.
    pub health_check_failures: Option<u32>,
    /// Window for failed health checks.
    #[serde(with = "serde_duration::option")]
    pub health_check_window: Option<Duration>,
}

impl ThresholdsConfig {
    /// Applies the overrides to the default thresholds.
    #[must_use]
    pub fn resolve(&self) -> TriggerThresholds {
        let d = TriggerThresholds::default();
        TriggerThresholds {
            error_rate: self.error_rate.unwrap_or(d.error_rate),
            error_rate_window: self.error_rate_window.unwrap_or(d.error_rate_window),
            service_failures: self.service_failures.unwrap_or(d.service_failures),
            service_failure_window: self
                .service_failure_window
                .unwrap_or(d.service_failure_window),
            response_time_seconds: self
                .response_time_seconds
                .unwrap_or(d.response_time_seconds),
            response_time_window: self.response_time_window.unwrap_or(d.response_time_window),
            memory_percent: self.memory_percent.unwrap_or(d.memory_percent),
            cpu_percent: self.cpu_percent.unwrap_or(d.cpu_percent),
            disk_percent: self.disk_percent.unwrap_or(d.disk_percent),
            health_check_failures: self
                .health_check_failures
                .unwrap_or(d.health_check_failures),
            health_check_window: self.health_check_window.unwrap_or(d.health_check_window),
        }
    }
}

/// Rollback settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Bound on each strategy's action and validation.
    #[serde(with = "serde_duration")]
    pub strategy_timeout: Duration,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            strategy_timeout: DEFAULT_STRATEGY_TIMEOUT,
        }
    }
}

/// Startup settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Delay between health check attempts.
    #[serde(with = "serde_duration")]
    pub health_poll_interval: Duration,

    /// How long service bring-up waits for progress before reporting a
    /// structural deadlock.
    #[serde(with = "serde_duration")]
    pub diagnostic_interval: Duration,

    /// How long one service may take to report healthy after starting.
    #[serde(with = "serde_duration")]
    pub service_timeout: Duration,

    /// Timeout of the implicit `start-services` step.
    #[serde(with = "serde_duration")]
    pub services_step_timeout: Duration,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            health_poll_interval: DEFAULT_HEALTH_POLL_INTERVAL,
            diagnostic_interval: Duration::from_secs(30),
            service_timeout: DEFAULT_STEP_TIMEOUT,
            services_step_timeout: Duration::from_secs(5 * 60),
        }
    }
}

fn default_step_timeout() -> Duration {
    DEFAULT_STEP_TIMEOUT
}

const fn default_true() -> bool {
    true
}

impl OrchestratorConfig {
    /// Loads and checks a configuration file.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the file cannot be read, [`Error::Config`] if it does
    /// not parse or is inconsistent.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Io("failed to read config file", e))?;
        Self::from_json(&content)
    }

    /// Parses and checks a configuration document.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if it does not parse or is inconsistent.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        config.check()?;
        Ok(config)
    }

    /// Steps to run, with the implicit `start-services` step when none are
    /// configured.
    #[must_use]
    pub fn effective_steps(&self) -> Vec<StepConfig> {
        if !self.steps.is_empty() || self.services.is_empty() {
            return self.steps.clone();
        }

        vec![StepConfig {
            id: START_SERVICES_ACTION.to_string(),
            name: Some("Start services".to_string()),
            action: START_SERVICES_ACTION.to_string(),
            health_check: Some(SERVICES_RUNNING_CHECK.to_string()),
            timeout: self.startup.services_step_timeout,
            critical: true,
        }]
    }

    /// Rejects duplicate ids and zero intervals.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] describing the first problem found.
    pub fn check(&self) -> Result<()> {
        unique("step", self.steps.iter().map(|s| s.id.as_str()))?;
        unique("strategy", self.strategies.iter().map(|s| s.id.as_str()))?;

        for (id, command) in &self.commands {
            if command.program.is_empty() {
                return Err(Error::Config(format!("command {id} has no program")));
            }
        }

        if self.monitor.poll_interval.is_zero() {
            return Err(Error::Config("monitor.poll_interval must be positive".into()));
        }
        if self.startup.health_poll_interval.is_zero() {
            return Err(Error::Config(
                "startup.health_poll_interval must be positive".into(),
            ));
        }

        Ok(())
    }
}

fn unique<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(Error::Config(format!("duplicate {kind} id {id}")));
        }
    }
    Ok(())
}
