//! Startup step definitions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use keel_bootable::{Action, AlwaysHealthy, HealthCheck};

/// Default time a step may take, action and health check together.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// One process-level bring-up phase.
#[derive(Clone)]
pub struct StartupStep {
    /// Step id.
    pub id: String,

    /// Human readable name.
    pub name: String,

    /// Work to perform.
    pub action: Arc<dyn Action>,

    /// Predicate polled after the action returns.
    pub health_check: Arc<dyn HealthCheck>,

    /// Deadline for the action plus health check.
    pub timeout: Duration,

    /// Whether failure halts the whole sequence.
    pub critical: bool,
}

impl StartupStep {
    /// Creates a critical step with the default timeout and a health check
    /// that always passes.
    pub fn new(id: impl Into<String>, name: impl Into<String>, action: Arc<dyn Action>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            action,
            health_check: Arc::new(AlwaysHealthy),
            timeout: DEFAULT_STEP_TIMEOUT,
            critical: true,
        }
    }

    /// Sets the health check.
    #[must_use]
    pub fn with_health_check(mut self, health_check: Arc<dyn HealthCheck>) -> Self {
        self.health_check = health_check;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets whether the step is critical.
    #[must_use]
    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }
}

impl fmt::Debug for StartupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartupStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}
