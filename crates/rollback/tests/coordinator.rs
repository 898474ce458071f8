//! Escalation, mutual exclusion and service restore.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keel_bootable::{
    Action, AlwaysHealthy, Bootable, BoxError, FnAction, FnHealthCheck, HealthCheck, Registry,
};
use keel_graph::{DependencyGraph, ServiceStatus};
use keel_monitor::{
    MetricCheck, MetricsSnapshot, MonitorOptions, Operator, RollbackTrigger, Severity,
    TriggerMonitor, Window,
};
use keel_rollback::{
    CollectingSink, CoordinatorOptions, CoordinatorState, ExecutionOutcome, NotificationKind,
    RollbackCoordinator, RollbackOutcome, RollbackScope, RollbackStrategy,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;

fn running_graph() -> Arc<DependencyGraph> {
    let graph = DependencyGraph::new();
    graph.add_service("db", Vec::<String>::new()).unwrap();
    graph.add_service("cache", Vec::<String>::new()).unwrap();
    graph.add_service("api", ["db", "cache"]).unwrap();
    graph.add_service("web", ["api"]).unwrap();
    let order = graph.validate().unwrap();

    for id in &order {
        graph.set_status(id, ServiceStatus::Ready).unwrap();
        graph.set_status(id, ServiceStatus::Starting).unwrap();
        graph.set_status(id, ServiceStatus::Running).unwrap();
    }
    Arc::new(graph)
}

fn error_trigger() -> RollbackTrigger {
    RollbackTrigger::new(
        "high-error-rate",
        MetricCheck::new("errors.rate", Operator::Gt, 0.1),
        Window::Instant,
        Severity::High,
    )
}

fn firing_monitor() -> Arc<TriggerMonitor> {
    let monitor = TriggerMonitor::new(vec![error_trigger()], MonitorOptions::default());
    monitor.evaluate(&MetricsSnapshot::new(json!({ "errors": { "rate": 0.5 } })));
    assert!(monitor.should_rollback().is_some());
    Arc::new(monitor)
}

fn counted(calls: &Arc<AtomicUsize>) -> Arc<dyn Action> {
    let calls = calls.clone();
    Arc::new(FnAction::new(move || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), BoxError>(())
        }
    }))
}

fn slow(calls: &Arc<AtomicUsize>, delay: Duration) -> Arc<dyn Action> {
    let calls = calls.clone();
    Arc::new(FnAction::new(move || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok::<(), BoxError>(())
        }
    }))
}

fn validates(passes: bool) -> Arc<dyn HealthCheck> {
    Arc::new(FnHealthCheck::new(move || async move { passes }))
}

fn ladder(calls: &Arc<AtomicUsize>, passing: &[bool; 4]) -> Vec<RollbackStrategy> {
    // Deliberately out of order; the coordinator sorts by priority.
    vec![
        RollbackStrategy::new("full", 4, RollbackScope::FullSystem, counted(calls), validates(passing[3])),
        RollbackStrategy::new("config", 1, RollbackScope::Configuration, counted(calls), validates(passing[0]))
            .with_services(["api"]),
        RollbackStrategy::new("data", 3, RollbackScope::Data, counted(calls), validates(passing[2]))
            .with_services(["db"]),
        RollbackStrategy::new("service", 2, RollbackScope::Service, counted(calls), validates(passing[1]))
            .with_services(["api"]),
    ]
}

fn coordinator(
    strategies: Vec<RollbackStrategy>,
    graph: &Arc<DependencyGraph>,
    monitor: &Arc<TriggerMonitor>,
    sink: &Arc<CollectingSink>,
) -> RollbackCoordinator {
    RollbackCoordinator::new(
        strategies,
        graph.clone(),
        Registry::new(),
        monitor.clone(),
        sink.clone(),
        CoordinatorOptions::default(),
    )
}

struct FakeService {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    running: AtomicBool,
    broken: AtomicBool,
}

#[async_trait]
impl Bootable for FakeService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), BoxError> {
        self.log.lock().push(format!("start:{}", self.name));
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BoxError> {
        self.log.lock().push(format!("stop:{}", self.name));
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.broken.load(Ordering::SeqCst)
    }
}

struct Services {
    registry: Registry,
    log: Arc<Mutex<Vec<String>>>,
    fakes: Vec<Arc<FakeService>>,
}

impl Services {
    fn running() -> Self {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        let mut fakes = Vec::new();
        for id in ["db", "cache", "api", "web"] {
            let fake = Arc::new(FakeService {
                name: id.to_string(),
                log: log.clone(),
                running: AtomicBool::new(true),
                broken: AtomicBool::new(false),
            });
            registry.register_service(id, fake.clone());
            fakes.push(fake);
        }
        Self {
            registry,
            log,
            fakes,
        }
    }

    fn get(&self, id: &str) -> Arc<FakeService> {
        self.fakes.iter().find(|f| f.name == id).unwrap().clone()
    }
}

fn relaunch_options() -> CoordinatorOptions {
    CoordinatorOptions {
        service_timeout: Duration::from_secs(2),
        health_poll_interval: Duration::from_millis(100),
        ..CoordinatorOptions::default()
    }
}

#[tokio::test]
async fn test_escalates_in_priority_order_until_validated() {
    let graph = running_graph();
    let monitor = firing_monitor();
    let sink = Arc::new(CollectingSink::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let coordinator = coordinator(ladder(&calls, &[false, false, true, true]), &graph, &monitor, &sink);

    let trigger = coordinator.should_rollback_now().unwrap();
    let report = coordinator.execute(&trigger).await;

    let attempted: Vec<_> = report.executions.iter().map(|e| e.strategy_id.as_str()).collect();
    assert_eq!(attempted, vec!["config", "service", "data"]);
    assert_eq!(
        report.outcome,
        RollbackOutcome::Succeeded {
            strategy_id: "data".to_string()
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.executions[0].outcome, ExecutionOutcome::Failed);
    assert!(report.executions[2].validation_passed);

    assert_eq!(
        sink.kinds(),
        vec![
            NotificationKind::Fired,
            NotificationKind::Escalated,
            NotificationKind::Escalated,
            NotificationKind::Succeeded,
        ]
    );
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
    assert_eq!(coordinator.history().len(), 3);

    // Restored and stale history cleared.
    for node in graph.nodes() {
        assert_eq!(node.status, ServiceStatus::Running, "{} not restored", node.id);
    }
    assert!(monitor.should_rollback().is_none());
    assert!(coordinator.should_rollback_now().is_none());
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_all_strategies_failing_is_fatal() {
    let graph = running_graph();
    let monitor = firing_monitor();
    let sink = Arc::new(CollectingSink::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let coordinator = coordinator(ladder(&calls, &[false; 4]), &graph, &monitor, &sink);

    let report = coordinator.execute(&error_trigger()).await;

    assert_eq!(report.outcome, RollbackOutcome::Fatal);
    assert_eq!(report.executions.len(), 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(sink.kinds().last(), Some(&NotificationKind::Fatal));
    assert_eq!(coordinator.state(), CoordinatorState::ManualInterventionRequired);

    for node in graph.nodes() {
        assert_eq!(node.status, ServiceStatus::Failed);
        assert!(node.last_error.unwrap().contains("rollback failed"));
    }

    // Nothing further happens automatically.
    assert!(coordinator.should_rollback_now().is_none());
    let again = coordinator.execute(&error_trigger()).await;
    assert_eq!(again.outcome, RollbackOutcome::Skipped);
    assert!(again.executions.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    assert!(coordinator.acknowledge_intervention());
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
    assert!(!coordinator.acknowledge_intervention());
}

#[tokio::test(start_paused = true)]
async fn test_second_rollback_never_runs_concurrently() {
    let graph = running_graph();
    let monitor = firing_monitor();
    let sink = Arc::new(CollectingSink::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let strategy = RollbackStrategy::new(
        "config",
        1,
        RollbackScope::Configuration,
        slow(&calls, Duration::from_secs(10)),
        Arc::new(AlwaysHealthy),
    );
    let coordinator = Arc::new(coordinator(vec![strategy], &graph, &monitor, &sink));

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.execute(&error_trigger()).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(coordinator.state(), CoordinatorState::Executing);
    assert!(coordinator.should_rollback_now().is_none());
    let second = coordinator.execute(&error_trigger()).await;
    assert_eq!(second.outcome, RollbackOutcome::Skipped);

    let first = first.await.unwrap();
    assert!(first.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_halt_lets_current_strategy_finish_but_stops_escalation() {
    let graph = running_graph();
    let monitor = firing_monitor();
    let sink = Arc::new(CollectingSink::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let strategies = vec![
        RollbackStrategy::new(
            "config",
            1,
            RollbackScope::Configuration,
            slow(&calls, Duration::from_secs(10)),
            validates(false),
        ),
        RollbackStrategy::new("full", 2, RollbackScope::FullSystem, counted(&calls), validates(true)),
    ];
    let coordinator = Arc::new(coordinator(strategies, &graph, &monitor, &sink));

    assert!(!coordinator.halt_escalation());

    let running = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.execute(&error_trigger()).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(coordinator.halt_escalation());

    let report = running.await.unwrap();
    assert_eq!(report.outcome, RollbackOutcome::Halted);
    assert_eq!(report.executions.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(sink.kinds().last(), Some(&NotificationKind::Halted));
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_strategy_is_bounded_by_timeout() {
    let graph = running_graph();
    let monitor = firing_monitor();
    let sink = Arc::new(CollectingSink::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let strategies = vec![
        RollbackStrategy::new(
            "stuck",
            1,
            RollbackScope::Configuration,
            slow(&calls, Duration::from_secs(3600)),
            validates(true),
        ),
        RollbackStrategy::new("full", 2, RollbackScope::FullSystem, counted(&calls), validates(true)),
    ];
    let coordinator = RollbackCoordinator::new(
        strategies,
        graph,
        Registry::new(),
        monitor,
        sink,
        CoordinatorOptions {
            strategy_timeout: Duration::from_secs(30),
            ..CoordinatorOptions::default()
        },
    );

    let report = coordinator.execute(&error_trigger()).await;

    assert_eq!(report.executions.len(), 2);
    assert!(
        report.executions[0]
            .error
            .as_deref()
            .unwrap()
            .contains("did not finish")
    );
    assert!(report.is_success());
}

#[tokio::test]
async fn test_strategies_filter_by_trigger() {
    let graph = running_graph();
    let monitor = firing_monitor();
    let sink = Arc::new(CollectingSink::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let strategies = vec![
        RollbackStrategy::new("disk", 1, RollbackScope::Data, counted(&calls), validates(true))
            .with_triggers(["resource-exhaustion"]),
        RollbackStrategy::new("config", 2, RollbackScope::Configuration, counted(&calls), validates(true))
            .with_triggers(["high-error-rate"]),
    ];
    let coordinator = coordinator(strategies, &graph, &monitor, &sink);

    let report = coordinator.execute(&error_trigger()).await;
    assert_eq!(
        report.outcome,
        RollbackOutcome::Succeeded {
            strategy_id: "config".to_string()
        }
    );
    assert_eq!(report.executions.len(), 1);
}

#[tokio::test]
async fn test_no_applicable_strategy_is_fatal() {
    let graph = running_graph();
    let monitor = firing_monitor();
    let sink = Arc::new(CollectingSink::new());
    let coordinator = coordinator(Vec::new(), &graph, &monitor, &sink);

    let report = coordinator.execute(&error_trigger()).await;
    assert_eq!(report.outcome, RollbackOutcome::Fatal);
    assert_eq!(coordinator.state(), CoordinatorState::ManualInterventionRequired);
    // Nothing was touched, so nothing is marked failed.
    assert_eq!(graph.status("db"), Some(ServiceStatus::Running));
}

#[test]
fn test_affected_services_follow_scope() {
    let graph = running_graph();
    let monitor = Arc::new(TriggerMonitor::new(Vec::new(), MonitorOptions::default()));
    let sink = Arc::new(CollectingSink::new());
    let coordinator = coordinator(Vec::new(), &graph, &monitor, &sink);
    let noop = || {
        (
            Arc::new(keel_bootable::NoopAction) as Arc<dyn Action>,
            Arc::new(AlwaysHealthy) as Arc<dyn HealthCheck>,
        )
    };

    let (a, v) = noop();
    let service = RollbackStrategy::new("s", 1, RollbackScope::Service, a, v).with_services(["db"]);
    assert_eq!(coordinator.affected_services(&service), vec!["db", "api", "web"]);

    let (a, v) = noop();
    let config =
        RollbackStrategy::new("c", 1, RollbackScope::Configuration, a, v).with_services(["api", "ghost"]);
    assert_eq!(coordinator.affected_services(&config), vec!["api"]);

    let (a, v) = noop();
    let full = RollbackStrategy::new("f", 1, RollbackScope::FullSystem, a, v);
    assert_eq!(coordinator.affected_services(&full), vec!["cache", "db", "api", "web"]);
}

#[tracing_test::traced_test]
#[tokio::test(start_paused = true)]
async fn test_unhealthy_service_after_action_escalates() {
    let graph = running_graph();
    let monitor = firing_monitor();
    let sink = Arc::new(CollectingSink::new());
    let services = Services::running();
    let api = services.get("api");
    api.broken.store(true, Ordering::SeqCst);

    let calls = Arc::new(AtomicUsize::new(0));
    let repair = {
        let api = api.clone();
        Arc::new(FnAction::new(move || {
            let api = api.clone();
            async move {
                api.broken.store(false, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        }))
    };
    let strategies = vec![
        RollbackStrategy::new("restart-api", 1, RollbackScope::Service, counted(&calls), validates(true))
            .with_services(["api"]),
        RollbackStrategy::new("full", 2, RollbackScope::FullSystem, repair, validates(true)),
    ];
    let coordinator = RollbackCoordinator::new(
        strategies,
        graph.clone(),
        services.registry.clone(),
        monitor.clone(),
        sink.clone(),
        relaunch_options(),
    );

    let report = coordinator.execute(&error_trigger()).await;

    assert_eq!(
        report.outcome,
        RollbackOutcome::Succeeded {
            strategy_id: "full".to_string()
        }
    );
    assert_eq!(report.executions[0].outcome, ExecutionOutcome::Failed);
    assert!(!report.executions[0].validation_passed);
    assert!(
        report.executions[0]
            .error
            .as_deref()
            .unwrap()
            .contains("service api is not healthy")
    );
    assert_eq!(
        sink.kinds(),
        vec![
            NotificationKind::Fired,
            NotificationKind::Escalated,
            NotificationKind::Succeeded,
        ]
    );

    assert_eq!(
        *services.log.lock(),
        vec![
            // restart-api: api and its dependent go down, api never recovers.
            "stop:web", "stop:api", "start:api", "stop:web", "stop:api",
            // full: the rest goes down, then everything comes back in order.
            "stop:db", "stop:cache", "start:cache", "start:db", "start:api", "start:web",
        ]
    );
    for node in graph.nodes() {
        assert_eq!(node.status, ServiceStatus::Running, "{}", node.id);
        assert!(node.last_health_check_at.is_some(), "{}", node.id);
    }
    assert!(logs_contain("strategy restart-api: service api is not healthy"));
}

#[tokio::test(start_paused = true)]
async fn test_graph_marks_services_running_only_after_validation() {
    let graph = running_graph();
    let monitor = firing_monitor();
    let sink = Arc::new(CollectingSink::new());
    let services = Services::running();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let check = {
        let graph = graph.clone();
        let seen = seen.clone();
        Arc::new(FnHealthCheck::new(move || {
            let graph = graph.clone();
            let seen = seen.clone();
            async move {
                seen.lock().push(graph.status("api"));
                true
            }
        }))
    };
    let calls = Arc::new(AtomicUsize::new(0));
    let strategies = vec![
        RollbackStrategy::new("restart-api", 1, RollbackScope::Service, counted(&calls), check)
            .with_services(["api"]),
    ];
    let coordinator = RollbackCoordinator::new(
        strategies,
        graph.clone(),
        services.registry.clone(),
        monitor,
        sink,
        relaunch_options(),
    );

    let report = coordinator.execute(&error_trigger()).await;

    assert!(report.is_success());
    assert_eq!(*seen.lock(), vec![Some(ServiceStatus::Stopped)]);
    assert_eq!(graph.status("api"), Some(ServiceStatus::Running));
    assert_eq!(graph.status("web"), Some(ServiceStatus::Running));
    assert!(services.get("web").running.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_failed_validation_shuts_relaunched_services_down() {
    let graph = running_graph();
    let monitor = firing_monitor();
    let sink = Arc::new(CollectingSink::new());
    let services = Services::running();
    let calls = Arc::new(AtomicUsize::new(0));
    let strategies = vec![
        RollbackStrategy::new("restart-api", 1, RollbackScope::Service, counted(&calls), validates(false))
            .with_services(["api"]),
    ];
    let coordinator = RollbackCoordinator::new(
        strategies,
        graph.clone(),
        services.registry.clone(),
        monitor,
        sink,
        relaunch_options(),
    );

    let report = coordinator.execute(&error_trigger()).await;

    assert_eq!(report.outcome, RollbackOutcome::Fatal);
    assert!(!services.get("api").running.load(Ordering::SeqCst));
    assert!(!services.get("web").running.load(Ordering::SeqCst));
    assert!(services.get("db").running.load(Ordering::SeqCst));
    assert_eq!(graph.status("api"), Some(ServiceStatus::Failed));
    assert_eq!(graph.status("db"), Some(ServiceStatus::Running));
}
