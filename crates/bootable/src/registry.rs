//! Lookup table of actions, health checks and services keyed by id.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::{Action, Bootable, HealthCheck};

/// Id-keyed lookup for the concrete implementations behind steps, strategies
/// and graph services.
#[derive(Clone, Default)]
pub struct Registry {
    actions: HashMap<String, Arc<dyn Action>>,
    health_checks: HashMap<String, Arc<dyn HealthCheck>>,
    services: HashMap<String, Arc<dyn Bootable>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut actions: Vec<_> = self.actions.keys().collect();
        actions.sort();
        let mut health_checks: Vec<_> = self.health_checks.keys().collect();
        health_checks.sort();
        let mut services: Vec<_> = self.services.keys().collect();
        services.sort();

        f.debug_struct("Registry")
            .field("actions", &actions)
            .field("health_checks", &health_checks)
            .field("services", &services)
            .finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action, replacing any previous one with the same id.
    pub fn register_action(&mut self, id: impl Into<String>, action: Arc<dyn Action>) {
        let id = id.into();
        if self.actions.insert(id.clone(), action).is_some() {
            warn!("action {} registered twice, replacing", id);
        }
    }

    /// Registers a health check, replacing any previous one with the same id.
    pub fn register_health_check(&mut self, id: impl Into<String>, check: Arc<dyn HealthCheck>) {
        let id = id.into();
        if self.health_checks.insert(id.clone(), check).is_some() {
            warn!("health check {} registered twice, replacing", id);
        }
    }

    /// Registers the service backing a graph node.
    pub fn register_service(&mut self, id: impl Into<String>, service: Arc<dyn Bootable>) {
        let id = id.into();
        if self.services.insert(id.clone(), service).is_some() {
            warn!("service {} registered twice, replacing", id);
        }
    }

    /// Looks up an action.
    #[must_use]
    pub fn action(&self, id: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(id).cloned()
    }

    /// Looks up a health check.
    #[must_use]
    pub fn health_check(&self, id: &str) -> Option<Arc<dyn HealthCheck>> {
        self.health_checks.get(id).cloned()
    }

    /// Looks up a service.
    #[must_use]
    pub fn service(&self, id: &str) -> Option<Arc<dyn Bootable>> {
        self.services.get(id).cloned()
    }

    /// Whether an action with this id exists.
    #[must_use]
    pub fn has_action(&self, id: &str) -> bool {
        self.actions.contains_key(id)
    }

    /// Whether a health check with this id exists.
    #[must_use]
    pub fn has_health_check(&self, id: &str) -> bool {
        self.health_checks.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AlwaysHealthy, NoopAction};

    #[test]
    fn lookups_return_registered_entries() {
        let mut registry = Registry::new();
        registry.register_action("noop", Arc::new(NoopAction));
        registry.register_health_check("ok", Arc::new(AlwaysHealthy));

        assert!(registry.action("noop").is_some());
        assert!(registry.health_check("ok").is_some());
        assert!(registry.action("missing").is_none());
        assert!(registry.service("missing").is_none());
        assert!(registry.has_action("noop"));
        assert!(!registry.has_health_check("noop"));
    }

    #[test]
    fn debug_lists_ids_sorted() {
        let mut registry = Registry::new();
        registry.register_action("b", Arc::new(NoopAction));
        registry.register_action("a", Arc::new(NoopAction));

        let rendered = format!("{registry:?}");
        assert!(rendered.contains(r#"actions: ["a", "b"]"#));
    }
}
