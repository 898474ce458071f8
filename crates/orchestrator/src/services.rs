//! Built-in startup step that brings graph services up in dependency order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_bootable::{Action, BoxError, HealthCheck, Registry};
use keel_graph::{DependencyGraph, ServiceStatus};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::error::Error;

/// Timing for [`StartServices`].
#[derive(Clone, Debug)]
pub struct BringUpOptions {
    /// Delay between health probes of a starting service.
    pub health_poll_interval: Duration,

    /// How long to wait for progress when nothing is ready.
    pub diagnostic_interval: Duration,

    /// How long one service may take to report healthy.
    pub service_timeout: Duration,
}

/// Starts every pending graph service, one at a time, in topological order.
///
/// Only services returned by [`DependencyGraph::ready_services`] are started,
/// so a service never starts before its dependencies are running.
pub struct StartServices {
    graph: Arc<DependencyGraph>,
    registry: Registry,
    options: BringUpOptions,
}

impl StartServices {
    /// Creates the action.
    #[must_use]
    pub const fn new(graph: Arc<DependencyGraph>, registry: Registry, options: BringUpOptions) -> Self {
        Self {
            graph,
            registry,
            options,
        }
    }

    /// Next ready service, earliest in topological order.
    fn next_ready(&self, order: &[String]) -> Option<String> {
        let ready = self.graph.ready_services();
        order.iter().find(|id| ready.contains(id)).cloned()
    }

    async fn wait_for_progress(&self, order: &[String]) -> Result<String, Error> {
        let deadline = Instant::now() + self.options.diagnostic_interval;
        loop {
            if let Some(id) = self.next_ready(order) {
                return Ok(id);
            }
            if Instant::now() >= deadline {
                let blocked: Vec<String> = self
                    .graph
                    .blocked_services()
                    .into_iter()
                    .map(|b| {
                        let waiting: Vec<String> = b
                            .waiting_on
                            .iter()
                            .map(|(dep, status)| match status {
                                Some(status) => format!("{dep} ({status})"),
                                None => format!("{dep} (unregistered)"),
                            })
                            .collect();
                        format!("{} waiting on {}", b.id, waiting.join(", "))
                    })
                    .collect();
                return Err(Error::StructuralDeadlock { blocked });
            }
            sleep(self.options.health_poll_interval).await;
        }
    }

    async fn start_one(&self, id: &str) -> Result<(), Error> {
        let service = self
            .registry
            .service(id)
            .ok_or_else(|| Error::UnknownService(id.to_string()))?;

        self.graph.set_status(id, ServiceStatus::Ready)?;
        self.graph.set_status(id, ServiceStatus::Starting)?;
        info!("starting service {}", id);

        if let Err(e) = service.start().await {
            let reason = e.to_string();
            self.graph.mark_failed(id, reason.clone())?;
            return Err(Error::ServiceStartFailed {
                id: id.to_string(),
                reason,
            });
        }

        let deadline = Instant::now() + self.options.service_timeout;
        loop {
            if service.is_healthy().await {
                self.graph.set_status(id, ServiceStatus::Running)?;
                info!("service {} running", id);
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.graph.mark_failed(
                    id,
                    format!("not healthy within {:?}", self.options.service_timeout),
                )?;
                return Err(Error::ServiceUnhealthy {
                    id: id.to_string(),
                    timeout: self.options.service_timeout,
                });
            }
            sleep(self.options.health_poll_interval).await;
        }
    }
}

#[async_trait]
impl Action for StartServices {
    async fn invoke(&self) -> Result<(), BoxError> {
        let order = self.graph.topological_order()?;
        info!("bringing up {} service(s)", order.len());

        loop {
            let next = match self.next_ready(&order) {
                Some(id) => id,
                None if self.graph.blocked_services().is_empty() => break,
                None => {
                    let blocked = self.graph.blocked_services();
                    warn!(
                        "no service ready, {} blocked; waiting {:?} for progress",
                        blocked.len(),
                        self.options.diagnostic_interval
                    );
                    match self.wait_for_progress(&order).await {
                        Ok(id) => id,
                        Err(e) => {
                            error!("{}", e);
                            return Err(e.into());
                        }
                    }
                }
            };

            if let Err(e) = self.start_one(&next).await {
                error!("{}", e);
                return Err(e.into());
            }
        }

        debug!("service bring-up finished");
        Ok(())
    }
}

/// Passes once every graph service reports healthy.
///
/// Each service's [`Bootable`](keel_bootable::Bootable) is asked directly,
/// so the check holds during a rollback, while the graph still has the
/// relaunched services stopped. A service with no registered implementation
/// fails the check.
pub struct ServicesRunning {
    graph: Arc<DependencyGraph>,
    registry: Registry,
}

impl ServicesRunning {
    /// Creates the health check.
    #[must_use]
    pub const fn new(graph: Arc<DependencyGraph>, registry: Registry) -> Self {
        Self { graph, registry }
    }
}

#[async_trait]
impl HealthCheck for ServicesRunning {
    async fn check(&self) -> bool {
        for node in self.graph.nodes() {
            let Some(service) = self.registry.service(&node.id) else {
                debug!("service {} has no implementation to check", node.id);
                return false;
            };
            if !service.is_healthy().await {
                debug!("service {} is not healthy", node.id);
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use keel_bootable::Bootable;
    use parking_lot::Mutex;

    use super::*;

    struct Recorded {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl Bootable for Recorded {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self) -> Result<(), BoxError> {
            self.log.lock().push(self.name.clone());
            if self.fail {
                return Err("refused".into());
            }
            self.healthy.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), BoxError> {
            self.healthy.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn options() -> BringUpOptions {
        BringUpOptions {
            health_poll_interval: Duration::from_millis(100),
            diagnostic_interval: Duration::from_secs(2),
            service_timeout: Duration::from_secs(5),
        }
    }

    fn setup(failing: &[&str]) -> (Arc<DependencyGraph>, Registry, Arc<Mutex<Vec<String>>>) {
        let graph = DependencyGraph::new();
        graph.add_service("A", Vec::<String>::new()).unwrap();
        graph.add_service("B", ["A"]).unwrap();
        graph.add_service("C", ["A"]).unwrap();
        graph.add_service("D", ["B", "C"]).unwrap();
        graph.validate().unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        for id in ["A", "B", "C", "D"] {
            registry.register_service(
                id,
                Arc::new(Recorded {
                    name: id.to_string(),
                    log: log.clone(),
                    fail: failing.contains(&id),
                    healthy: AtomicBool::new(false),
                }),
            );
        }
        (Arc::new(graph), registry, log)
    }

    #[tokio::test(start_paused = true)]
    async fn starts_in_topological_order() {
        let (graph, registry, log) = setup(&[]);
        let action = StartServices::new(graph.clone(), registry.clone(), options());

        action.invoke().await.unwrap();

        assert_eq!(*log.lock(), vec!["A", "B", "C", "D"]);
        assert!(ServicesRunning::new(graph.clone(), registry).check().await);
        assert!(graph.node("D").unwrap().last_health_check_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_service_stops_bring_up() {
        let (graph, registry, log) = setup(&["B"]);
        let action = StartServices::new(graph.clone(), registry.clone(), options());

        let err = action.invoke().await.unwrap_err();
        assert!(err.to_string().contains("service B failed to start"));
        assert_eq!(*log.lock(), vec!["A", "B"]);
        assert_eq!(graph.status("B"), Some(ServiceStatus::Failed));
        assert_eq!(graph.status("D"), Some(ServiceStatus::Pending));
        assert!(!ServicesRunning::new(graph, registry).check().await);
    }

    #[tokio::test]
    async fn services_running_asks_the_services_not_the_graph() {
        let (graph, registry, _) = setup(&[]);
        for id in ["A", "B", "C", "D"] {
            registry.service(id).unwrap().start().await.unwrap();
        }
        let check = ServicesRunning::new(graph.clone(), registry.clone());

        // Still pending in the graph, but every service is up.
        assert!(check.check().await);

        registry.service("C").unwrap().shutdown().await.unwrap();
        assert!(!check.check().await);

        let partial = ServicesRunning::new(graph, Registry::new());
        assert!(!partial.check().await);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_graph_reports_structural_deadlock() {
        let (graph, registry, log) = setup(&[]);
        graph.mark_failed("A", "crashed earlier").unwrap();
        let action = StartServices::new(graph, registry, options());

        let err = action.invoke().await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("structural deadlock"), "{message}");
        assert!(message.contains("B waiting on A (failed)"), "{message}");
        assert!(log.lock().is_empty());
    }
}
