//! Rollback coordination: mutual exclusion, escalation and service restore.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use chrono::Utc;
use keel_bootable::Registry;
use keel_graph::{DependencyGraph, ServiceStatus};
use keel_monitor::{RollbackTrigger, TriggerMonitor};
use parking_lot::RwLock;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::execution::{
    CoordinatorState, ExecutionOutcome, RollbackExecution, RollbackOutcome, RollbackReport,
};
use crate::notification::{NotificationEvent, NotificationKind, NotificationSink};
use crate::strategy::{RollbackScope, RollbackStrategy};

/// Default bound on one strategy's action, and separately on its validation.
pub const DEFAULT_STRATEGY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default time a relaunched service has to report healthy.
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay between health probes of a relaunched service.
pub const DEFAULT_HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Options for [`RollbackCoordinator`].
#[derive(Clone, Debug)]
pub struct CoordinatorOptions {
    /// Bound on a strategy's action, and separately on its validation.
    pub strategy_timeout: Duration,

    /// How long each relaunched service has to report healthy.
    pub service_timeout: Duration,

    /// Delay between health probes of a relaunched service.
    pub health_poll_interval: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            strategy_timeout: DEFAULT_STRATEGY_TIMEOUT,
            service_timeout: DEFAULT_SERVICE_TIMEOUT,
            health_poll_interval: DEFAULT_HEALTH_POLL_INTERVAL,
        }
    }
}

/// Runs rollback strategies in escalating order, one rollback at a time.
///
/// Services with a [`Bootable`](keel_bootable::Bootable) in the registry are
/// shut down before a strategy runs and relaunched after its action returns.
/// The graph only marks them running again once validation has passed and
/// each one reports healthy. Services without one are tracked in the graph
/// alone.
pub struct RollbackCoordinator {
    strategies: Vec<RollbackStrategy>,
    graph: Arc<DependencyGraph>,
    registry: Registry,
    monitor: Arc<TriggerMonitor>,
    sink: Arc<dyn NotificationSink>,
    options: CoordinatorOptions,
    state: AtomicU8,
    halt_requested: AtomicBool,
    history: RwLock<Vec<RollbackExecution>>,
}

impl fmt::Debug for RollbackCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackCoordinator")
            .field("strategies", &self.strategies)
            .field("options", &self.options)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RollbackCoordinator {
    /// Creates a coordinator. Strategies are ordered by priority, then id.
    pub fn new(
        mut strategies: Vec<RollbackStrategy>,
        graph: Arc<DependencyGraph>,
        registry: Registry,
        monitor: Arc<TriggerMonitor>,
        sink: Arc<dyn NotificationSink>,
        options: CoordinatorOptions,
    ) -> Self {
        strategies.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

        Self {
            strategies,
            graph,
            registry,
            monitor,
            sink,
            options,
            state: AtomicU8::new(CoordinatorState::Idle as u8),
            halt_requested: AtomicBool::new(false),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Strategies in execution order.
    #[must_use]
    pub fn strategies(&self) -> &[RollbackStrategy] {
        &self.strategies
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Every strategy attempt so far, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<RollbackExecution> {
        self.history.read().clone()
    }

    /// The monitor's decision, unless a rollback is in flight or the
    /// coordinator is waiting for an operator.
    #[must_use]
    pub fn should_rollback_now(&self) -> Option<RollbackTrigger> {
        let decision = self.monitor.should_rollback()?;
        match self.state() {
            CoordinatorState::Idle => Some(decision),
            state => {
                debug!(
                    "ignoring firing of {} while coordinator is {:?}",
                    decision.id, state
                );
                None
            }
        }
    }

    /// Stops escalation: the running strategy completes, but no further
    /// strategy is attempted. Returns `false` when no rollback is in flight.
    pub fn halt_escalation(&self) -> bool {
        if self.state() != CoordinatorState::Executing {
            return false;
        }
        warn!("operator requested rollback escalation halt");
        self.halt_requested.store(true, Ordering::SeqCst);
        true
    }

    /// Clears the manual-intervention state so automatic rollback can resume.
    /// Returns `false` when the coordinator was not waiting for an operator.
    pub fn acknowledge_intervention(&self) -> bool {
        let cleared = self
            .state
            .compare_exchange(
                CoordinatorState::ManualInterventionRequired as u8,
                CoordinatorState::Idle as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if cleared {
            self.monitor.reset_all();
            info!("manual intervention acknowledged, automatic rollback re-enabled");
        }
        cleared
    }

    /// Services a strategy reverts, in topological order.
    ///
    /// Full-system strategies affect every service. Service strategies affect
    /// the named services and everything that depends on them. Configuration
    /// and data strategies affect only the named services.
    #[must_use]
    pub fn affected_services(&self, strategy: &RollbackStrategy) -> Vec<String> {
        let order = self.service_order();

        if strategy.scope == RollbackScope::FullSystem {
            return order;
        }

        let mut affected = BTreeSet::new();
        for id in &strategy.services {
            if self.graph.status(id).is_none() {
                warn!("strategy {} names unknown service {}", strategy.id, id);
                continue;
            }
            affected.insert(id.clone());
            if strategy.scope == RollbackScope::Service {
                if let Ok(dependents) = self.graph.dependents_of(id) {
                    affected.extend(dependents);
                }
            }
        }

        order
            .into_iter()
            .filter(|id| affected.contains(id))
            .collect()
    }

    /// Runs applicable strategies for `trigger` until one validates.
    ///
    /// Returns [`RollbackOutcome::Skipped`] without running anything if a
    /// rollback is already in flight or the coordinator needs an operator.
    pub async fn execute(&self, trigger: &RollbackTrigger) -> RollbackReport {
        let mut report = RollbackReport {
            trigger_id: trigger.id.clone(),
            severity: trigger.severity,
            outcome: RollbackOutcome::Skipped,
            executions: Vec::new(),
        };

        if let Err(current) = self.state.compare_exchange(
            CoordinatorState::Idle as u8,
            CoordinatorState::Executing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            info!(
                "rollback for {} not started: coordinator is {:?}",
                trigger.id,
                CoordinatorState::from_u8(current)
            );
            return report;
        }
        self.halt_requested.store(false, Ordering::SeqCst);

        self.notify(NotificationKind::Fired, trigger, "started", None, None);

        let applicable: Vec<&RollbackStrategy> = self
            .strategies
            .iter()
            .filter(|s| s.applies_to(&trigger.id))
            .collect();

        let mut touched = BTreeSet::new();

        for (index, strategy) in applicable.iter().enumerate() {
            let affected = self.affected_services(strategy);
            touched.extend(affected.iter().cloned());

            info!(
                "rollback for {}: attempting strategy {} ({}, {} service(s))",
                trigger.id,
                strategy.id,
                strategy.scope,
                affected.len()
            );

            self.unwind(&affected).await;
            let execution = self.run_strategy(strategy, &trigger.id, &touched).await;
            self.history.write().push(execution.clone());
            report.executions.push(execution.clone());

            if execution.outcome == ExecutionOutcome::Succeeded {
                self.monitor.reset_all();
                self.notify(
                    NotificationKind::Succeeded,
                    trigger,
                    "succeeded",
                    Some(&strategy.id),
                    None,
                );
                report.outcome = RollbackOutcome::Succeeded {
                    strategy_id: strategy.id.clone(),
                };
                self.release();
                return report;
            }

            if self.halt_requested.load(Ordering::SeqCst) {
                self.notify(
                    NotificationKind::Halted,
                    trigger,
                    "halted",
                    Some(&strategy.id),
                    execution.error.clone(),
                );
                report.outcome = RollbackOutcome::Halted;
                self.release();
                return report;
            }

            if let Some(next) = applicable.get(index + 1) {
                self.notify(
                    NotificationKind::Escalated,
                    trigger,
                    "escalating",
                    Some(&strategy.id),
                    Some(format!(
                        "{}; next strategy {}",
                        execution.error.as_deref().unwrap_or("failed"),
                        next.id
                    )),
                );
            }
        }

        let detail = if applicable.is_empty() {
            format!("no strategy applies to trigger {}", trigger.id)
        } else {
            format!("all {} strategies failed", applicable.len())
        };

        for id in self.service_order() {
            if touched.contains(&id) {
                if let Err(e) = self.graph.mark_failed(&id, format!("rollback failed: {detail}")) {
                    warn!("could not mark {} failed: {}", id, e);
                }
            }
        }

        self.notify(NotificationKind::Fatal, trigger, "fatal", None, Some(detail));
        report.outcome = RollbackOutcome::Fatal;
        self.state.store(
            CoordinatorState::ManualInterventionRequired as u8,
            Ordering::SeqCst,
        );
        report
    }

    /// Topological order, or id order if the graph was never validated.
    fn service_order(&self) -> Vec<String> {
        self.graph
            .topological_order()
            .unwrap_or_else(|_| self.graph.nodes().into_iter().map(|n| n.id).collect())
    }

    fn release(&self) {
        self.state.store(CoordinatorState::Idle as u8, Ordering::SeqCst);
    }

    /// Executes one strategy. Once its action returns, every service touched
    /// so far is relaunched before validation runs.
    async fn run_strategy(
        &self,
        strategy: &RollbackStrategy,
        trigger_id: &str,
        touched: &BTreeSet<String>,
    ) -> RollbackExecution {
        let started_at = Utc::now();
        let limit = self.options.strategy_timeout;

        let action = match timeout(limit, strategy.execute.invoke()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::StrategyFailed {
                strategy_id: strategy.id.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::StrategyTimedOut {
                strategy_id: strategy.id.clone(),
                timeout: limit,
            }),
        };

        let result = match action {
            Ok(()) => self.restore(strategy, touched).await,
            Err(e) => Err(e),
        };

        let finished_at = Utc::now();
        match result {
            Ok(()) => {
                info!("strategy {} validated", strategy.id);
                RollbackExecution {
                    strategy_id: strategy.id.clone(),
                    trigger_id: trigger_id.to_string(),
                    started_at,
                    finished_at,
                    outcome: ExecutionOutcome::Succeeded,
                    validation_passed: true,
                    error: None,
                }
            }
            Err(e) => {
                warn!("{}", e);
                RollbackExecution {
                    strategy_id: strategy.id.clone(),
                    trigger_id: trigger_id.to_string(),
                    started_at,
                    finished_at,
                    outcome: ExecutionOutcome::Failed,
                    validation_passed: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Relaunches the touched services, validates, confirms each one is
    /// healthy and only then marks them running. Any failure shuts the
    /// relaunched services down again and leaves the graph untouched.
    async fn restore(&self, strategy: &RollbackStrategy, touched: &BTreeSet<String>) -> Result<()> {
        let order: Vec<String> = self
            .service_order()
            .into_iter()
            .filter(|id| touched.contains(id))
            .collect();

        let verified = match self.relaunch(strategy, &order).await {
            Ok(()) => self.verify(strategy, &order).await,
            Err(e) => Err(e),
        };
        if let Err(e) = verified {
            self.stop(&order).await;
            return Err(e);
        }

        self.commit(&order);
        Ok(())
    }

    /// Starts each service, dependencies first, and waits for it to report
    /// healthy before starting the next.
    async fn relaunch(&self, strategy: &RollbackStrategy, order: &[String]) -> Result<()> {
        for id in order {
            let Some(service) = self.registry.service(id) else {
                continue;
            };

            debug!("relaunching service {}", id);
            service.start().await.map_err(|e| Error::ServiceStartFailed {
                strategy_id: strategy.id.clone(),
                service_id: id.clone(),
                reason: e.to_string(),
            })?;

            let deadline = Instant::now() + self.options.service_timeout;
            while !service.is_healthy().await {
                if Instant::now() >= deadline {
                    return Err(Error::ServiceUnhealthy {
                        strategy_id: strategy.id.clone(),
                        service_id: id.clone(),
                    });
                }
                sleep(self.options.health_poll_interval).await;
            }
        }
        Ok(())
    }

    /// Runs the strategy's validation, then checks every relaunched service
    /// once more.
    async fn verify(&self, strategy: &RollbackStrategy, order: &[String]) -> Result<()> {
        if !matches!(
            timeout(self.options.strategy_timeout, strategy.validate.check()).await,
            Ok(true)
        ) {
            return Err(Error::ValidationFailed {
                strategy_id: strategy.id.clone(),
            });
        }

        for id in order {
            let Some(service) = self.registry.service(id) else {
                continue;
            };
            if !service.is_healthy().await {
                return Err(Error::ServiceUnhealthy {
                    strategy_id: strategy.id.clone(),
                    service_id: id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Marks verified services running, dependencies first.
    fn commit(&self, order: &[String]) {
        for id in order {
            match self.mark_running(id) {
                Ok(()) => debug!("service {} restored", id),
                Err(e) => warn!("could not restore {} after rollback: {}", id, e),
            }
        }
    }

    fn mark_running(&self, id: &str) -> Result<()> {
        if self.graph.status(id) == Some(ServiceStatus::Running) {
            return Ok(());
        }
        self.graph.set_status(id, ServiceStatus::Ready)?;
        self.graph.set_status(id, ServiceStatus::Starting)?;
        self.graph.set_status(id, ServiceStatus::Running)?;
        Ok(())
    }

    /// Shuts affected services down, dependents first, and marks them stopped.
    async fn unwind(&self, affected: &[String]) {
        for id in affected.iter().rev() {
            if self.graph.status(id) == Some(ServiceStatus::Stopped) {
                continue;
            }
            self.shutdown(id).await;
            if let Err(e) = self.graph.set_status(id, ServiceStatus::Stopped) {
                warn!("could not stop {} before rollback: {}", id, e);
            }
        }
    }

    /// Shuts relaunched services down again, dependents first. The graph
    /// already has them stopped.
    async fn stop(&self, order: &[String]) {
        for id in order.iter().rev() {
            self.shutdown(id).await;
        }
    }

    async fn shutdown(&self, id: &str) {
        let Some(service) = self.registry.service(id) else {
            return;
        };
        debug!("shutting down service {}", id);
        if let Err(e) = service.shutdown().await {
            warn!("service {} did not shut down cleanly: {}", id, e);
        }
    }

    fn notify(
        &self,
        kind: NotificationKind,
        trigger: &RollbackTrigger,
        outcome: &str,
        strategy_id: Option<&str>,
        detail: Option<String>,
    ) {
        self.sink.notify(&NotificationEvent {
            kind,
            trigger_id: trigger.id.clone(),
            severity: trigger.severity,
            timestamp: Utc::now(),
            outcome: outcome.to_string(),
            strategy_id: strategy_id.map(str::to_string),
            detail,
        });
    }
}
