//! Periodic trigger evaluation.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::snapshot::{MetricsProvider, MetricsSnapshot};
use crate::trigger::{RollbackEvent, RollbackTrigger, TriggerThresholds};

/// Default monitor poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of consecutive missing-metric polls before a warning.
pub const DEFAULT_MISSING_METRIC_ALERT_AFTER: u32 = 3;

/// Options for [`TriggerMonitor`].
#[derive(Clone, Debug)]
pub struct MonitorOptions {
    /// Delay between evaluations in [`TriggerMonitor::run`]. Sustained
    /// windows measure the spacing of the snapshots they see and only fall
    /// back to this before two events are recorded. Zero is replaced with
    /// [`DEFAULT_POLL_INTERVAL`].
    pub poll_interval: Duration,

    /// Consecutive missing-metric polls for one trigger that raise a warning.
    pub missing_metric_alert_after: u32,

    /// Hard cap on events kept per trigger and per subject.
    pub max_history: usize,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            missing_metric_alert_after: DEFAULT_MISSING_METRIC_ALERT_AFTER,
            max_history: 1024,
        }
    }
}

/// Result of evaluating one trigger against one snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct TriggerEvaluation {
    /// Event appended to the trigger's history.
    pub event: RollbackEvent,
    /// Whether the trigger's window is now satisfied.
    pub satisfied: bool,
    /// Why the metric could not be read, if it could not.
    pub error: Option<Error>,
}

struct TriggerState {
    trigger: RollbackTrigger,
    history: VecDeque<RollbackEvent>,
    /// Per-subject histories the window is judged on. Checks without a `*`
    /// path segment record under the empty subject.
    subjects: BTreeMap<String, VecDeque<RollbackEvent>>,
    satisfied: bool,
    consecutive_misses: u32,
    total_misses: u64,
}

impl TriggerState {
    fn new(trigger: RollbackTrigger) -> Self {
        Self {
            trigger,
            history: VecDeque::new(),
            subjects: BTreeMap::new(),
            satisfied: false,
            consecutive_misses: 0,
            total_misses: 0,
        }
    }

    fn clear(&mut self) {
        self.history.clear();
        self.subjects.clear();
        self.satisfied = false;
    }
}

/// Evaluates rollback triggers against metrics snapshots.
///
/// History lives behind a lock held only for the length of an evaluation or
/// a clone, so status readers can query it while the poll loop runs.
pub struct TriggerMonitor {
    options: MonitorOptions,
    triggers: RwLock<BTreeMap<String, TriggerState>>,
    active: AtomicBool,
}

impl fmt::Debug for TriggerMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerMonitor")
            .field("options", &self.options)
            .field("triggers", &self.triggers.read().keys().collect::<Vec<_>>())
            .field("active", &self.is_active())
            .finish()
    }
}

impl TriggerMonitor {
    /// Creates a monitor. A trigger id given twice keeps the later definition.
    #[must_use]
    pub fn new(triggers: Vec<RollbackTrigger>, mut options: MonitorOptions) -> Self {
        if options.poll_interval.is_zero() {
            warn!(
                "monitor poll interval must be positive, using {:?}",
                DEFAULT_POLL_INTERVAL
            );
            options.poll_interval = DEFAULT_POLL_INTERVAL;
        }

        let mut states = BTreeMap::new();
        for trigger in triggers {
            let id = trigger.id.clone();
            if states.insert(id.clone(), TriggerState::new(trigger)).is_some() {
                warn!("trigger {} defined twice, keeping the later definition", id);
            }
        }

        Self {
            options,
            triggers: RwLock::new(states),
            active: AtomicBool::new(false),
        }
    }

    /// Creates a monitor with the five standard triggers.
    #[must_use]
    pub fn with_default_triggers(thresholds: &TriggerThresholds, options: MonitorOptions) -> Self {
        Self::new(thresholds.triggers(), options)
    }

    /// Monitor options.
    #[must_use]
    pub const fn options(&self) -> &MonitorOptions {
        &self.options
    }

    /// Registered triggers, ordered by id.
    #[must_use]
    pub fn triggers(&self) -> Vec<RollbackTrigger> {
        self.triggers
            .read()
            .values()
            .map(|state| state.trigger.clone())
            .collect()
    }

    /// Starts evaluating in [`run`](Self::run). Called once startup completes.
    pub fn activate(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            info!("trigger monitor activated");
        }
    }

    /// Whether the poll loop evaluates snapshots.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Evaluates every trigger against `snapshot`, appending one event each.
    ///
    /// Metrics that cannot be read are logged and recorded as not fired. A
    /// trigger whose check path contains `*` is judged per matched subject,
    /// so its window trips only when one subject satisfies it alone.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Vec<TriggerEvaluation> {
        let mut triggers = self.triggers.write();
        let mut evaluations = Vec::with_capacity(triggers.len());

        for state in triggers.values_mut() {
            let (mut readings, error) = observe(&state.trigger, snapshot);

            if let Some(error) = &error {
                state.consecutive_misses += 1;
                state.total_misses += 1;
                debug!("trigger {} not evaluated: {}", state.trigger.id, error);
                if state.consecutive_misses == self.options.missing_metric_alert_after {
                    warn!(
                        "trigger {} has had no usable metric for {} consecutive polls: {}",
                        state.trigger.id, state.consecutive_misses, error
                    );
                }
            } else {
                state.consecutive_misses = 0;
            }

            for subject in state.subjects.keys() {
                readings.entry(subject.clone()).or_default();
            }

            let mut satisfied_by = None;
            for (subject, reading) in &readings {
                let history = state.subjects.entry(subject.clone()).or_default();
                history.push_back(RollbackEvent {
                    trigger_id: state.trigger.id.clone(),
                    timestamp: snapshot.taken_at,
                    observed_value: reading.value,
                    fired: reading.fired,
                });
                self.trim(&state.trigger, history);
                if satisfied_by.is_none()
                    && state
                        .trigger
                        .window
                        .is_satisfied(history, self.options.poll_interval)
                {
                    satisfied_by = Some(subject.clone());
                }
            }
            state
                .subjects
                .retain(|_, history| history.iter().any(|event| event.fired));

            let fired = readings.values().find(|reading| reading.fired);
            let event = RollbackEvent {
                trigger_id: state.trigger.id.clone(),
                timestamp: snapshot.taken_at,
                observed_value: fired
                    .or_else(|| readings.values().find(|reading| reading.value.is_some()))
                    .and_then(|reading| reading.value),
                fired: fired.is_some(),
            };
            state.history.push_back(event.clone());
            self.trim(&state.trigger, &mut state.history);

            let satisfied = satisfied_by.is_some();
            if satisfied && !state.satisfied {
                match satisfied_by.as_deref() {
                    Some(subject) if !subject.is_empty() => info!(
                        "trigger {} satisfied by {} (severity {}, observed {:?})",
                        state.trigger.id, subject, state.trigger.severity, event.observed_value
                    ),
                    _ => info!(
                        "trigger {} satisfied (severity {}, observed {:?})",
                        state.trigger.id, state.trigger.severity, event.observed_value
                    ),
                }
            }
            state.satisfied = satisfied;

            evaluations.push(TriggerEvaluation {
                event,
                satisfied,
                error,
            });
        }

        evaluations
    }

    fn trim(&self, trigger: &RollbackTrigger, history: &mut VecDeque<RollbackEvent>) {
        trigger.window.prune(history, self.options.poll_interval);
        while history.len() > self.options.max_history {
            history.pop_front();
        }
    }

    /// The satisfied trigger to act on: highest severity, then lowest id.
    #[must_use]
    pub fn should_rollback(&self) -> Option<RollbackTrigger> {
        self.triggers
            .read()
            .values()
            .filter(|state| state.satisfied)
            .max_by(|a, b| {
                a.trigger
                    .severity
                    .cmp(&b.trigger.severity)
                    .then_with(|| b.trigger.id.cmp(&a.trigger.id))
            })
            .map(|state| state.trigger.clone())
    }

    /// Clears one trigger's history. Returns `false` for an unknown id.
    pub fn reset(&self, trigger_id: &str) -> bool {
        self.triggers.write().get_mut(trigger_id).is_some_and(|state| {
            state.clear();
            debug!("trigger {} history reset", trigger_id);
            true
        })
    }

    /// Clears every trigger's history.
    pub fn reset_all(&self) {
        for state in self.triggers.write().values_mut() {
            state.clear();
        }
        debug!("all trigger history reset");
    }

    /// History snapshot for one trigger, oldest first.
    #[must_use]
    pub fn events(&self, trigger_id: &str) -> Vec<RollbackEvent> {
        self.triggers
            .read()
            .get(trigger_id)
            .map(|state| state.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total missing-metric polls per trigger.
    #[must_use]
    pub fn missing_metric_counts(&self) -> BTreeMap<String, u64> {
        self.triggers
            .read()
            .iter()
            .map(|(id, state)| (id.clone(), state.total_misses))
            .collect()
    }

    /// Polls `provider` every poll interval until `cancel` fires, sending the
    /// trigger to act on whenever a window is satisfied.
    ///
    /// Nothing is evaluated until [`activate`](Self::activate) is called.
    pub async fn run(
        self: Arc<Self>,
        provider: Arc<dyn MetricsProvider>,
        decisions: mpsc::Sender<RollbackTrigger>,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.options.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "trigger monitor polling every {:?}",
            self.options.poll_interval
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.is_active() {
                        continue;
                    }
                    self.poll_once(provider.as_ref(), &decisions).await;
                }
                () = cancel.cancelled() => {
                    debug!("trigger monitor shutting down");
                    break;
                }
            }
        }
    }

    async fn poll_once(
        &self,
        provider: &dyn MetricsProvider,
        decisions: &mpsc::Sender<RollbackTrigger>,
    ) {
        let snapshot = match provider.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("{}", Error::Provider(e.to_string()));
                return;
            }
        };

        self.evaluate(&snapshot);

        let Some(trigger) = self.should_rollback() else {
            return;
        };

        match decisions.try_send(trigger) {
            Ok(()) => {}
            Err(TrySendError::Full(trigger)) => {
                debug!(
                    "rollback decision channel full, dropping firing of {}",
                    trigger.id
                );
            }
            Err(TrySendError::Closed(trigger)) => {
                warn!(
                    "rollback decision channel closed, dropping firing of {}",
                    trigger.id
                );
            }
        }
    }
}

/// What one subject showed in one snapshot.
#[derive(Clone, Copy, Debug, Default)]
struct Reading {
    value: Option<f64>,
    fired: bool,
}

/// Reads every check per subject; a subject fires if any of its checks
/// crosses. The error is only returned when no check produced a value.
fn observe(
    trigger: &RollbackTrigger,
    snapshot: &MetricsSnapshot,
) -> (BTreeMap<String, Reading>, Option<Error>) {
    let mut readings: BTreeMap<String, Reading> = BTreeMap::new();
    let mut first_error = None;

    for check in &trigger.checks {
        let values = match snapshot.lookup_each(&check.metric_path) {
            Ok(values) => values,
            Err(e) => {
                first_error.get_or_insert(e);
                continue;
            }
        };

        for (subject, value) in values {
            match value {
                Ok(value) => {
                    let reading = readings.entry(subject).or_default();
                    if reading.fired {
                        continue;
                    }
                    if check.condition.is_crossed_by(value) {
                        *reading = Reading {
                            value: Some(value),
                            fired: true,
                        };
                    } else {
                        reading.value.get_or_insert(value);
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
    }

    if readings.is_empty() {
        (readings, first_error)
    } else {
        (readings, None)
    }
}
