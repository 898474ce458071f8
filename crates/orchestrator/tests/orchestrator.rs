//! End-to-end orchestration: configuration, startup, monitoring, rollback
//! and shutdown.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keel_bootable::{Bootable, BoxError, FnAction, Registry};
use keel_graph::ServiceStatus;
use keel_monitor::{MetricsProvider, MetricsSnapshot};
use keel_orchestrator::{Error, Orchestrator, OrchestratorConfig, OrchestratorState};
use keel_rollback::{CollectingSink, NotificationKind};
use keel_startup::{AggregateHealth, SessionState};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

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

struct SharedMetrics(Arc<Mutex<Value>>);

#[async_trait]
impl MetricsProvider for SharedMetrics {
    async fn snapshot(&self) -> Result<MetricsSnapshot, BoxError> {
        Ok(MetricsSnapshot::new(self.0.lock().clone()))
    }
}

fn healthy_metrics() -> Value {
    json!({
        "errors": { "rate": 0.0 },
        "services": {
            "db": { "failed_transitions": 0 },
            "cache": { "failed_transitions": 0 },
            "api": { "failed_transitions": 0 },
        },
        "response_time": { "avg_seconds": 0.1 },
        "resources": { "memory_percent": 20, "cpu_percent": 20, "disk_percent": 20 },
        "health": { "check_passed": true },
    })
}

fn exhausted_metrics() -> Value {
    let mut metrics = healthy_metrics();
    metrics["resources"]["memory_percent"] = json!(99);
    metrics
}

/// Registry with db, cache and api; also returns api for tests that break it.
fn services_with_api(log: &Arc<Mutex<Vec<String>>>) -> (Registry, Arc<FakeService>) {
    let mut registry = Registry::new();
    let mut api = None;
    for id in ["db", "cache", "api"] {
        let service = Arc::new(FakeService {
            name: id.to_string(),
            log: log.clone(),
            running: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        });
        registry.register_service(id, service.clone());
        if id == "api" {
            api = Some(service);
        }
    }
    (registry, api.unwrap())
}

fn services_registry(log: &Arc<Mutex<Vec<String>>>) -> Registry {
    services_with_api(log).0
}

fn base_config() -> Value {
    json!({
        "services": [
            { "id": "db" },
            { "id": "cache" },
            { "id": "api", "depends_on": ["db", "cache"] },
        ],
        "monitor": { "poll_interval": "1s" },
        "startup": { "health_poll_interval": "50ms" },
        "strategies": [
            { "id": "restart-api", "priority": 1, "scope": "service", "action": "restart", "services": ["api"] },
            { "id": "full", "priority": 2, "scope": "full_system", "action": "restore" },
        ],
    })
}

fn config(value: &Value) -> OrchestratorConfig {
    OrchestratorConfig::from_json(&value.to_string()).unwrap()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached");
}

fn rollback_actions(
    registry: &mut Registry,
    metrics: &Arc<Mutex<Value>>,
    restart_works: bool,
    restore_works: bool,
) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    for (id, works) in [("restart", restart_works), ("restore", restore_works)] {
        let calls = calls.clone();
        let metrics = metrics.clone();
        registry.register_action(
            id,
            Arc::new(FnAction::new(move || {
                let calls = calls.clone();
                let metrics = metrics.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if works {
                        *metrics.lock() = healthy_metrics();
                        Ok(())
                    } else {
                        Err::<(), BoxError>("rollback target unavailable".into())
                    }
                }
            })),
        );
    }
    calls
}

#[tokio::test(start_paused = true)]
async fn test_config_file_drives_startup_in_dependency_order() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", base_config()).unwrap();
    let config = OrchestratorConfig::from_file(file.path()).unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = services_registry(&log);
    let metrics = Arc::new(Mutex::new(healthy_metrics()));
    rollback_actions(&mut registry, &metrics, true, true);

    let orchestrator = Orchestrator::new(config, registry).unwrap();
    assert_eq!(orchestrator.state(), OrchestratorState::NotStarted);

    let report = orchestrator.start().await.unwrap();

    assert_eq!(report.session.state, SessionState::Completed);
    assert_eq!(report.health, AggregateHealth::Healthy);
    assert_eq!(report.session.step_results.len(), 1);
    assert_eq!(*log.lock(), vec!["start:cache", "start:db", "start:api"]);
    assert_eq!(orchestrator.state(), OrchestratorState::Running);
    assert!(orchestrator.monitor().is_active());
    for node in orchestrator.graph().nodes() {
        assert_eq!(node.status, ServiceStatus::Running);
    }

    assert!(matches!(orchestrator.start().await, Err(Error::AlreadyStarted)));

    orchestrator.shutdown().await;
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
    assert_eq!(
        log.lock()[3..],
        ["stop:api", "stop:db", "stop:cache"].map(String::from)
    );
    for node in orchestrator.graph().nodes() {
        assert_eq!(node.status, ServiceStatus::Stopped);
    }
}

#[tracing_test::traced_test]
#[tokio::test(start_paused = true)]
async fn test_critical_step_failure_keeps_monitoring_off() {
    let mut value = base_config();
    value["steps"] = json!([
        { "id": "migrate", "action": "migrate" },
        { "id": "services", "action": "start-services", "health_check": "services-running" },
    ]);

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = services_registry(&log);
    let metrics = Arc::new(Mutex::new(healthy_metrics()));
    rollback_actions(&mut registry, &metrics, true, true);
    registry.register_action(
        "migrate",
        Arc::new(FnAction::new(|| async { Err::<(), BoxError>("schema locked".into()) })),
    );

    let orchestrator = Orchestrator::new(config(&value), registry).unwrap();
    let report = orchestrator.start().await.unwrap();

    assert_eq!(report.session.state, SessionState::Failed);
    assert_eq!(report.session.step_results.len(), 1);
    assert!(log.lock().is_empty());
    assert_eq!(orchestrator.state(), OrchestratorState::StartupFailed);
    assert!(!orchestrator.monitor().is_active());
    assert_eq!(orchestrator.startup_report(), Some(report));
    assert!(logs_contain("schema locked"));
    assert!(logs_contain("startup failed"));
}

#[test]
fn test_unresolved_references_are_rejected() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut value = base_config();
    value["steps"] = json!([{ "id": "warm", "action": "nope" }]);
    let err = Orchestrator::new(config(&value), services_registry(&log)).unwrap_err();
    assert!(matches!(err, Error::UnknownAction { ref owner, .. } if owner == "warm"));

    // Strategy actions are not registered.
    let err = Orchestrator::new(config(&base_config()), services_registry(&log)).unwrap_err();
    assert!(matches!(err, Error::UnknownAction { ref owner, .. } if owner == "restart-api"));

    let mut value = base_config();
    value["strategies"] = json!([]);
    value["services"] = json!([{ "id": "db" }, { "id": "queue" }]);
    let err = Orchestrator::new(config(&value), services_registry(&log)).unwrap_err();
    assert!(matches!(err, Error::UnknownService(ref id) if id == "queue"));
}

#[test]
fn test_cyclic_services_fail_construction() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut value = base_config();
    value["strategies"] = json!([]);
    value["services"] = json!([
        { "id": "db", "depends_on": ["api"] },
        { "id": "cache" },
        { "id": "api", "depends_on": ["db"] },
    ]);

    let err = Orchestrator::new(config(&value), services_registry(&log)).unwrap_err();
    assert!(
        matches!(err, Error::Graph(keel_graph::Error::CyclicDependency { .. })),
        "{err}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_trigger_rolls_back_and_returns_to_running() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = services_registry(&log);
    let metrics = Arc::new(Mutex::new(healthy_metrics()));
    let calls = rollback_actions(&mut registry, &metrics, true, true);
    let sink = Arc::new(CollectingSink::new());

    let orchestrator = Orchestrator::with_collaborators(
        config(&base_config()),
        registry,
        sink.clone(),
        Some(Arc::new(SharedMetrics(metrics.clone()))),
    )
    .unwrap();
    orchestrator.start().await.unwrap();

    *metrics.lock() = exhausted_metrics();
    eventually(|| orchestrator.rollback_history().len() == 1).await;
    eventually(|| orchestrator.state() == OrchestratorState::Running).await;

    let history = orchestrator.rollback_history();
    assert_eq!(history[0].strategy_id, "restart-api");
    assert_eq!(history[0].trigger_id, "resource-exhaustion");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        sink.kinds(),
        vec![NotificationKind::Fired, NotificationKind::Succeeded]
    );
    assert_eq!(orchestrator.graph().status("api"), Some(ServiceStatus::Running));

    // Healthy metrics afterwards do not re-trigger.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(orchestrator.rollback_history().len(), 1);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_strategies_require_manual_intervention() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = services_registry(&log);
    let metrics = Arc::new(Mutex::new(healthy_metrics()));
    let calls = rollback_actions(&mut registry, &metrics, false, false);
    let sink = Arc::new(CollectingSink::new());

    let orchestrator = Orchestrator::with_collaborators(
        config(&base_config()),
        registry,
        sink.clone(),
        Some(Arc::new(SharedMetrics(metrics.clone()))),
    )
    .unwrap();
    let mut state = orchestrator.subscribe();
    orchestrator.start().await.unwrap();

    *metrics.lock() = exhausted_metrics();
    tokio::time::timeout(
        Duration::from_secs(60),
        state.wait_for(|s| *s == OrchestratorState::ManualInterventionRequired),
    )
    .await
    .expect("never required intervention")
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(orchestrator.rollback_history().len(), 2);
    assert_eq!(sink.kinds().last(), Some(&NotificationKind::Fatal));
    for node in orchestrator.graph().nodes() {
        assert_eq!(node.status, ServiceStatus::Failed);
    }

    // Still firing, but nothing further is attempted.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(orchestrator.acknowledge_intervention());
    assert_eq!(orchestrator.state(), OrchestratorState::Running);

    orchestrator.shutdown().await;
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
}

#[tracing_test::traced_test]
#[tokio::test(start_paused = true)]
async fn test_unhealthy_service_escalates_past_default_validation() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (mut registry, api) = services_with_api(&log);
    let metrics = Arc::new(Mutex::new(healthy_metrics()));

    // The restart clears the metrics but leaves api broken.
    let restart_metrics = metrics.clone();
    registry.register_action(
        "restart",
        Arc::new(FnAction::new(move || {
            let metrics = restart_metrics.clone();
            async move {
                *metrics.lock() = healthy_metrics();
                Ok::<(), BoxError>(())
            }
        })),
    );
    let restore_api = api.clone();
    registry.register_action(
        "restore",
        Arc::new(FnAction::new(move || {
            let api = restore_api.clone();
            async move {
                api.broken.store(false, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        })),
    );

    let mut value = base_config();
    value["startup"]["service_timeout"] = json!("2s");
    let sink = Arc::new(CollectingSink::new());
    let orchestrator = Orchestrator::with_collaborators(
        config(&value),
        registry,
        sink.clone(),
        Some(Arc::new(SharedMetrics(metrics.clone()))),
    )
    .unwrap();
    orchestrator.start().await.unwrap();

    api.broken.store(true, Ordering::SeqCst);
    *metrics.lock() = exhausted_metrics();
    eventually(|| orchestrator.rollback_history().len() == 2).await;
    eventually(|| orchestrator.state() == OrchestratorState::Running).await;

    let history = orchestrator.rollback_history();
    assert_eq!(history[0].strategy_id, "restart-api");
    assert!(!history[0].validation_passed);
    assert!(
        history[0]
            .error
            .as_deref()
            .unwrap()
            .contains("service api is not healthy")
    );
    assert_eq!(history[1].strategy_id, "full");
    assert!(history[1].validation_passed);
    assert_eq!(
        sink.kinds(),
        vec![
            NotificationKind::Fired,
            NotificationKind::Escalated,
            NotificationKind::Succeeded,
        ]
    );
    for node in orchestrator.graph().nodes() {
        assert_eq!(node.status, ServiceStatus::Running, "{}", node.id);
        assert!(node.last_health_check_at.is_some(), "{}", node.id);
    }
    assert!(logs_contain("strategy restart-api: service api is not healthy"));

    orchestrator.shutdown().await;
}
