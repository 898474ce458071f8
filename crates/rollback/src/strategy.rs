//! Rollback strategy definitions.

use std::fmt;
use std::sync::Arc;

use keel_bootable::{Action, HealthCheck};
use serde::{Deserialize, Serialize};

/// What a strategy touches. Ordered by blast radius.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RollbackScope {
    /// Revert configuration only.
    Configuration,
    /// Revert service versions.
    Service,
    /// Restore data.
    Data,
    /// Revert everything.
    FullSystem,
}

impl fmt::Display for RollbackScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::Service => "service",
            Self::Data => "data",
            Self::FullSystem => "full_system",
        };
        f.write_str(name)
    }
}

/// One way of returning the system to a known-good state.
#[derive(Clone)]
pub struct RollbackStrategy {
    /// Strategy id.
    pub id: String,

    /// Lower runs first.
    pub priority: u32,

    /// Blast radius.
    pub scope: RollbackScope,

    /// Performs the rollback.
    pub execute: Arc<dyn Action>,

    /// Confirms the system is healthy again.
    pub validate: Arc<dyn HealthCheck>,

    /// Graph services this strategy reverts.
    pub services: Vec<String>,

    /// Trigger ids this strategy answers. Empty means every trigger.
    pub triggers: Vec<String>,
}

impl RollbackStrategy {
    /// Creates a strategy that answers every trigger and names no services.
    pub fn new(
        id: impl Into<String>,
        priority: u32,
        scope: RollbackScope,
        execute: Arc<dyn Action>,
        validate: Arc<dyn HealthCheck>,
    ) -> Self {
        Self {
            id: id.into(),
            priority,
            scope,
            execute,
            validate,
            services: Vec::new(),
            triggers: Vec::new(),
        }
    }

    /// Sets the services this strategy reverts.
    #[must_use]
    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts the strategy to the given triggers.
    #[must_use]
    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    /// Whether this strategy answers `trigger_id`.
    #[must_use]
    pub fn applies_to(&self, trigger_id: &str) -> bool {
        self.triggers.is_empty() || self.triggers.iter().any(|t| t == trigger_id)
    }
}

impl fmt::Debug for RollbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackStrategy")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("scope", &self.scope)
            .field("services", &self.services)
            .field("triggers", &self.triggers)
            .finish_non_exhaustive()
    }
}
