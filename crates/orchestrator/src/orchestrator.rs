//! Wires the graph, startup sequencer, trigger monitor and rollback
//! coordinator together.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use keel_bootable::{AlwaysHealthy, HealthCheck, Registry};
use keel_graph::{DependencyGraph, ServiceStatus};
use keel_monitor::{MetricsProvider, MonitorOptions, TriggerMonitor};
use keel_rollback::{
    CoordinatorOptions, CoordinatorState, NotificationSink, RollbackCoordinator, RollbackExecution,
    RollbackOutcome, RollbackStrategy, TracingSink,
};
use keel_startup::{SequencerOptions, StartupReport, StartupSequencer, StartupStep};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::command::{CommandAction, CommandHealthCheck, CommandService};
use crate::config::{
    ALWAYS_HEALTHY_CHECK, OrchestratorConfig, SERVICES_RUNNING_CHECK, START_SERVICES_ACTION,
};
use crate::error::{Error, Result};
use crate::metrics_file::FileMetricsProvider;
use crate::services::{BringUpOptions, ServicesRunning, StartServices};

/// Capacity of the channel carrying rollback decisions from the monitor loop
/// to the coordinator loop.
pub const DECISION_CHANNEL_CAPACITY: usize = 16;

/// Externally visible orchestrator state.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum OrchestratorState {
    /// Built; `start` not called yet.
    NotStarted,
    /// Startup steps are running.
    Starting,
    /// Startup completed; monitoring is active.
    Running,
    /// A rollback is in flight.
    RollingBack,
    /// Every rollback strategy failed. An operator has to step in.
    ManualInterventionRequired,
    /// Startup failed or was cancelled.
    StartupFailed,
    /// Shut down.
    Stopped,
}

impl OrchestratorState {
    /// Whether nothing further will happen without an operator or restart.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ManualInterventionRequired | Self::StartupFailed | Self::Stopped
        )
    }
}

/// Owns every long-lived worker: the startup sequencer, the trigger monitor
/// loop and the rollback coordinator loop.
pub struct Orchestrator {
    registry: Registry,
    graph: Arc<DependencyGraph>,
    steps: Vec<StartupStep>,
    sequencer: StartupSequencer,
    monitor: Arc<TriggerMonitor>,
    coordinator: Arc<RollbackCoordinator>,
    provider: Option<Arc<dyn MetricsProvider>>,
    state: watch::Sender<OrchestratorState>,
    report: Mutex<Option<StartupReport>>,
    started: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("graph", &self.graph)
            .field("steps", &self.steps)
            .field("coordinator", &self.coordinator)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds an orchestrator that reports through `tracing` and reads
    /// metrics from `config.metrics_file`, if set.
    ///
    /// # Errors
    ///
    /// Graph errors from the declared services, and unknown action, health
    /// check or service references.
    pub fn new(config: OrchestratorConfig, registry: Registry) -> Result<Self> {
        let provider = config
            .metrics_file
            .as_ref()
            .map(|path| Arc::new(FileMetricsProvider::new(path)) as Arc<dyn MetricsProvider>);
        Self::with_collaborators(config, registry, Arc::new(TracingSink), provider)
    }

    /// Builds an orchestrator with an explicit notification sink and metrics
    /// provider.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_collaborators(
        config: OrchestratorConfig,
        mut registry: Registry,
        sink: Arc<dyn NotificationSink>,
        provider: Option<Arc<dyn MetricsProvider>>,
    ) -> Result<Self> {
        config.check()?;

        for (id, command) in &config.commands {
            registry.register_action(id.clone(), Arc::new(CommandAction::new(id, command.clone())));
            registry.register_health_check(
                id.clone(),
                Arc::new(CommandHealthCheck::new(id, command.clone())),
            );
        }

        let graph = Arc::new(DependencyGraph::new());
        for service in &config.services {
            graph.add_service(service.id.clone(), service.depends_on.iter().cloned())?;

            if let Some(command) = &service.command {
                let mut backing = CommandService::new(&service.id, command.clone());
                if let Some(health) = &service.health_command {
                    backing = backing.with_health_command(health.clone());
                }
                registry.register_service(service.id.clone(), Arc::new(backing));
            }
        }
        let order = graph.validate()?;
        info!("service start order: [{}]", order.join(", "));

        for id in &order {
            if registry.service(id).is_none() {
                return Err(Error::UnknownService(id.clone()));
            }
        }

        if !registry.has_action(START_SERVICES_ACTION) {
            let bring_up = StartServices::new(
                graph.clone(),
                registry.clone(),
                BringUpOptions {
                    health_poll_interval: config.startup.health_poll_interval,
                    diagnostic_interval: config.startup.diagnostic_interval,
                    service_timeout: config.startup.service_timeout,
                },
            );
            registry.register_action(START_SERVICES_ACTION, Arc::new(bring_up));
        }
        if !registry.has_health_check(SERVICES_RUNNING_CHECK) {
            registry.register_health_check(
                SERVICES_RUNNING_CHECK,
                Arc::new(ServicesRunning::new(graph.clone(), registry.clone())),
            );
        }
        if !registry.has_health_check(ALWAYS_HEALTHY_CHECK) {
            registry.register_health_check(ALWAYS_HEALTHY_CHECK, Arc::new(AlwaysHealthy));
        }

        let steps = config
            .effective_steps()
            .into_iter()
            .map(|step| -> Result<StartupStep> {
                let action = registry.action(&step.action).ok_or_else(|| Error::UnknownAction {
                    owner: step.id.clone(),
                    action: step.action.clone(),
                })?;
                let health_check =
                    resolve_check(&registry, &step.id, step.health_check.as_deref(), ALWAYS_HEALTHY_CHECK)?;
                Ok(StartupStep::new(step.id.clone(), step.name.unwrap_or(step.id), action)
                    .with_health_check(health_check)
                    .with_timeout(step.timeout)
                    .with_critical(step.critical))
            })
            .collect::<Result<Vec<_>>>()?;

        let strategies = config
            .strategies
            .iter()
            .map(|strategy| -> Result<RollbackStrategy> {
                let execute = registry.action(&strategy.action).ok_or_else(|| Error::UnknownAction {
                    owner: strategy.id.clone(),
                    action: strategy.action.clone(),
                })?;
                let validate = resolve_check(
                    &registry,
                    &strategy.id,
                    strategy.validate.as_deref(),
                    SERVICES_RUNNING_CHECK,
                )?;
                Ok(RollbackStrategy::new(
                    strategy.id.clone(),
                    strategy.priority,
                    strategy.scope,
                    execute,
                    validate,
                )
                .with_services(strategy.services.iter().cloned())
                .with_triggers(strategy.triggers.iter().cloned()))
            })
            .collect::<Result<Vec<_>>>()?;

        let monitor = Arc::new(TriggerMonitor::with_default_triggers(
            &config.monitor.thresholds.resolve(),
            MonitorOptions {
                poll_interval: config.monitor.poll_interval,
                missing_metric_alert_after: config.monitor.missing_metric_alert_after,
                ..MonitorOptions::default()
            },
        ));

        let coordinator = Arc::new(RollbackCoordinator::new(
            strategies,
            graph.clone(),
            registry.clone(),
            monitor.clone(),
            sink,
            CoordinatorOptions {
                strategy_timeout: config.rollback.strategy_timeout,
                service_timeout: config.startup.service_timeout,
                health_poll_interval: config.startup.health_poll_interval,
            },
        ));

        let sequencer = StartupSequencer::new(SequencerOptions {
            health_poll_interval: config.startup.health_poll_interval,
        });

        let (state, _) = watch::channel(OrchestratorState::NotStarted);

        Ok(Self {
            registry,
            graph,
            steps,
            sequencer,
            monitor,
            coordinator,
            provider,
            state,
            report: Mutex::new(None),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Runs the startup sequence. On success, activates monitoring and
    /// spawns the monitor and coordinator loops.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyStarted`] on a second call. Step failures are reported
    /// in the returned [`StartupReport`], not as errors.
    pub async fn start(&self) -> Result<StartupReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        self.state.send_replace(OrchestratorState::Starting);
        let report = self.sequencer.run(self.steps.clone()).await?;
        *self.report.lock() = Some(report.clone());

        for result in &report.session.step_results {
            debug!(
                "step {}: {:?} in {}ms{}",
                result.step_id,
                result.outcome,
                result.duration_ms,
                result
                    .error
                    .as_deref()
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default()
            );
        }

        if !report.is_operational() {
            error!(
                "startup failed ({:?}, cancelled: {})",
                report.health, report.cancelled
            );
            self.state.send_replace(OrchestratorState::StartupFailed);
            return Ok(report);
        }

        info!("startup completed ({:?}), activating monitoring", report.health);
        self.monitor.activate();
        self.spawn_workers();
        self.state.send_replace(OrchestratorState::Running);

        Ok(report)
    }

    fn spawn_workers(&self) {
        let (decisions_tx, decisions_rx) = mpsc::channel(DECISION_CHANNEL_CAPACITY);

        match &self.provider {
            Some(provider) => {
                self.tracker.spawn(self.monitor.clone().run(
                    provider.clone(),
                    decisions_tx,
                    self.cancel.clone(),
                ));
            }
            None => warn!("no metrics provider configured, rollback triggers will not be evaluated"),
        }

        self.tracker.spawn(coordinate(
            self.coordinator.clone(),
            decisions_rx,
            self.state.clone(),
            self.cancel.clone(),
        ));
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    /// Report of the startup run, once finished.
    #[must_use]
    pub fn startup_report(&self) -> Option<StartupReport> {
        self.report.lock().clone()
    }

    /// Aborts a running startup sequence.
    pub fn cancel_startup(&self) {
        self.sequencer.cancel();
    }

    /// Stops rollback escalation after the current strategy.
    pub fn halt_escalation(&self) -> bool {
        self.coordinator.halt_escalation()
    }

    /// Clears the manual-intervention state and resumes automatic rollback.
    pub fn acknowledge_intervention(&self) -> bool {
        let cleared = self.coordinator.acknowledge_intervention();
        if cleared {
            self.state.send_replace(OrchestratorState::Running);
        }
        cleared
    }

    /// Every rollback strategy attempt so far.
    #[must_use]
    pub fn rollback_history(&self) -> Vec<RollbackExecution> {
        self.coordinator.history()
    }

    /// The dependency graph.
    #[must_use]
    pub const fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    /// The trigger monitor.
    #[must_use]
    pub const fn monitor(&self) -> &Arc<TriggerMonitor> {
        &self.monitor
    }

    /// The rollback coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &Arc<RollbackCoordinator> {
        &self.coordinator
    }

    /// Stops the workers, then every service in reverse dependency order.
    pub async fn shutdown(&self) {
        info!("shutting down orchestrator");
        self.sequencer.cancel();
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        for id in self.graph.shutdown_order().unwrap_or_default() {
            let Some(status) = self.graph.status(&id) else {
                continue;
            };
            if matches!(status, ServiceStatus::Pending | ServiceStatus::Stopped) {
                continue;
            }

            if let Some(service) = self.registry.service(&id) {
                if let Err(e) = service.shutdown().await {
                    warn!("service {} did not shut down cleanly: {}", id, e);
                }
            }
            if let Err(e) = self.graph.set_status(&id, ServiceStatus::Stopped) {
                warn!("could not mark {} stopped: {}", id, e);
            }
        }

        self.state.send_replace(OrchestratorState::Stopped);
        info!("orchestrator stopped");
    }
}

fn resolve_check(
    registry: &Registry,
    owner: &str,
    id: Option<&str>,
    default: &str,
) -> Result<Arc<dyn HealthCheck>> {
    let id = id.unwrap_or(default);
    registry.health_check(id).ok_or_else(|| Error::UnknownHealthCheck {
        owner: owner.to_string(),
        health_check: id.to_string(),
    })
}

/// Drains rollback decisions one at a time.
///
/// A rollback in progress is never interrupted by cancellation; the loop only
/// observes cancellation between decisions.
async fn coordinate(
    coordinator: Arc<RollbackCoordinator>,
    mut decisions: mpsc::Receiver<keel_monitor::RollbackTrigger>,
    state: watch::Sender<OrchestratorState>,
    cancel: CancellationToken,
) {
    loop {
        let fired = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            decision = decisions.recv() => match decision {
                Some(trigger) => trigger,
                None => break,
            },
        };

        let Some(trigger) = coordinator.should_rollback_now() else {
            debug!("firing of {} ignored", fired.id);
            continue;
        };

        state.send_replace(OrchestratorState::RollingBack);
        let report = coordinator.execute(&trigger).await;
        info!(
            "rollback for {} finished: {} after {} attempt(s)",
            report.trigger_id,
            report.outcome,
            report.executions.len()
        );

        let next = match (report.outcome, coordinator.state()) {
            (RollbackOutcome::Fatal, _) | (_, CoordinatorState::ManualInterventionRequired) => {
                OrchestratorState::ManualInterventionRequired
            }
            _ => OrchestratorState::Running,
        };
        state.send_replace(next);
    }

    debug!("rollback coordinator loop stopped");
}
